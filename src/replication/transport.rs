//! 复制总线传输契约
//!
//! 发送器、接收器只依赖这里的 trait；gRPC 实现见 `grpc` 模块，
//! 测试中可以替换为内存实现。

use super::ReplicationError;
use crate::storage::{MemDb, Snapshot, StoreError};
use async_trait::async_trait;
use std::sync::Arc;

/// 快照广播主题
pub const SNAPSHOT_TOPIC: &str = "SnapshotChanges";

/// 主节点侧：快照发布者
#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    /// 在 `address` 上开始监听
    async fn activate(&self, address: &str) -> Result<(), ReplicationError>;

    async fn deactivate(&self) -> Result<(), ReplicationError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ReplicationError>;

    /// 当前订阅某主题的从节点数量
    fn subscriber_count(&self, topic: &str) -> usize;
}

/// 收到快照时的回调
pub type SnapshotCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// 从节点侧：快照订阅者
#[async_trait]
pub trait SnapshotSubscriber: Send + Sync {
    /// 连接主节点的复制总线
    async fn activate(&self, address: &str) -> Result<(), ReplicationError>;

    async fn subscribe(&self, topic: &str, callback: SnapshotCallback) -> Result<(), ReplicationError>;

    async fn deactivate(&self) -> Result<(), ReplicationError>;
}

/// 拉取一次完整快照
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn get_snapshot(&self, address: &str) -> Result<Snapshot, ReplicationError>;
}

/// 能生成整库备份的数据源
pub trait BackupSource: Send + Sync {
    fn backup(&self) -> Result<Snapshot, StoreError>;
}

impl BackupSource for MemDb {
    fn backup(&self) -> Result<Snapshot, StoreError> {
        MemDb::backup(self)
    }
}
