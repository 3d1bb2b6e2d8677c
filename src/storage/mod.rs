//! 事务存储模块
//!
//! 内存中带索引的数据集，支持原子读写事务：
//! - 每个写事务返回按修改顺序排列的 Change 列表
//! - 整库备份 / 恢复（快照）
//! - 持久化存储契约（load / flush）
//! - 存储侧通知通道监听（带 panic 恢复与退避重连）
//!
//! # 架构
//!
//! ```text
//! ConfigService ──with_wtx──> MemDb ──Vec<Change>──> Event Factory
//!                               │
//!                    backup()/restore()
//!                               │
//!                 Snapshot (zstd + crc32) ──> DurableStore / 复制总线
//! ```

pub mod change;
pub mod durable;
pub mod memdb;
pub mod notify;
pub mod snapshot;

pub use change::{Change, ChangeKind};
pub use durable::{DurableFlusher, DurableStore, FileDurableStore};
pub use memdb::{MemDb, ReadTxn, WriteTxn};
pub use notify::{
    Notification, NotificationListener, NotificationSource, NotificationStream,
    TcpNotificationSource,
};
pub use snapshot::{Snapshot, SnapshotBody};

/// 存储错误类型
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Entity {table}/{key} already exists")]
    AlreadyExists { table: String, key: String },

    #[error("Entity {table}/{key} not found")]
    NotFound { table: String, key: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Snapshot encode error: {0}")]
    Encode(String),

    #[error("Snapshot decode error: {0}")]
    Decode(String),

    #[error("Snapshot checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notification channel error: {0}")]
    Channel(String),
}
