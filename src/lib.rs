//! # MESHGATE-RS
//!
//! 多副本的代理控制面：把节点组、路由、上游、限流等配置保存在事务存储中，
//! 主节点把整库快照复制给从节点，各节点把配置构建成代理资源并通过发现服务下发。
//!
//! ## 架构设计
//!
//! ```text
//! ConfigService ──with_wtx──> MemDb ──Vec<Change>──> EventBus
//!                                                      │
//!                       ┌──────────────────────────────┤
//!                       ↓                              ↓
//!                 CacheUpdater                    DataSender (Master)
//!                       │                              │ SnapshotBus (gRPC)
//!                 SnapshotCache                        ↓
//!                       │                         DataReceiver (Slave)
//!                DiscoveryServer                       │ restore + 全量重建
//!                       ↓                              ↓
//!                  代理 (xDS)                       MemDb / SnapshotCache
//! ```
//!
//! 角色信号 `(NodeInfo, Role)` 由 `RoleManager` 接收，`Configurator` 据此启停发送器/接收器。

// ============================================================================
// 外部依赖
// ============================================================================

// 异步运行时
pub use futures;
pub use tokio;

// 序列化
pub use serde;
pub use serde_json;

// 日志
pub use log;

// ============================================================================
// 内部模块
// ============================================================================

/// 配置数据模型
pub mod model;

/// 事务存储、快照、持久化与通知
pub mod storage;

/// 变更事件与内部总线
pub mod events;

/// 主从快照复制
pub mod replication;

/// 代理资源构建与发现服务
pub mod xds;

/// 服务层（配置写入 + 运维 HTTP）
pub mod service;

/// 可观测性模块 (Prometheus)
pub mod observability;

/// 工具模块
pub mod utils;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use events::{BusError, Event, EventBus};
pub use model::{Entity, GatewayType, NodeGroup, RateLimit, ResourceType, Route, Upstream};
pub use replication::{NodeInfo, ReplicationError, Role};
pub use storage::{MemDb, Snapshot, StoreError};
pub use utils::{ConfigError, MeshgateConfig};
pub use xds::BuildError;

// ============================================================================
// 全局错误类型
// ============================================================================

/// 控制面错误类型
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node is read-only (role: {0})")]
    ReadOnly(String),

    #[error("Changes committed but event publishing failed: {0}")]
    PublishAfterCommit(BusError),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;
