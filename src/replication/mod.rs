//! 主从快照复制模块
//!
//! 主节点累积变更，定期把整库快照广播给从节点；从节点只通过 restore 修改存储。
//!
//! 架构：
//! ```text
//! Master                                   Slave
//!   MemDb --backup--> DataSender             DataReceiver --restore--> MemDb
//!                        |                        ^
//!                        |   SnapshotBus (gRPC)   |
//!                        +---- SnapshotChanges ---+
//!                        +<----- GetSnapshot -----+  (启动时拉取一次)
//! ```
//!
//! 角色切换由 `Configurator` 负责启停两侧，`RoleManager` 记录当前角色。

pub mod configurator;
pub mod grpc;
pub mod processor;
pub mod receiver;
pub mod role;
pub mod sender;
pub mod state;
pub mod transport;

pub use configurator::{Configurator, ReceiverControl, SenderControl};
pub use grpc::{GrpcBusConfig, GrpcSnapshotProvider, GrpcSnapshotPublisher, GrpcSnapshotSubscriber};
pub use processor::{ConfigInitializer, SlaveSnapshotProcessor};
pub use receiver::{DataReceiver, ProcessSnapshot};
pub use role::{NodeContext, NodeInfo, Role, RoleManager, RoleView};
pub use sender::{DataSender, TickOutcome};
pub use state::{LoopState, LoopTransition};
pub use transport::{
    BackupSource, SnapshotCallback, SnapshotProvider, SnapshotPublisher, SnapshotSubscriber,
    SNAPSHOT_TOPIC,
};

use crate::storage::StoreError;

/// 复制错误
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("{0} is not started")]
    NotStarted(&'static str),

    #[error("{component}: invalid transition {transition:?} from state {from}")]
    InvalidTransition {
        component: &'static str,
        from: LoopState,
        transition: LoopTransition,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("gRPC status: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("gRPC connection error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config initialization failed: {0}")]
    Init(String),
}
