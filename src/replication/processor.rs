//! 从节点快照处理

use super::receiver::ProcessSnapshot;
use super::ReplicationError;
use crate::storage::{MemDb, Snapshot};
use async_trait::async_trait;
use std::sync::Arc;

/// 全量重建代理资源（带重试）
#[async_trait]
pub trait ConfigInitializer: Send + Sync {
    async fn init_config_with_retry(&self) -> Result<(), ReplicationError>;
}

/// 从节点快照处理器：restore 后全量重建资源
pub struct SlaveSnapshotProcessor {
    store: Arc<MemDb>,
    initializer: Arc<dyn ConfigInitializer>,
}

impl SlaveSnapshotProcessor {
    pub fn new(store: Arc<MemDb>, initializer: Arc<dyn ConfigInitializer>) -> Self {
        Self { store, initializer }
    }
}

#[async_trait]
impl ProcessSnapshot for SlaveSnapshotProcessor {
    async fn process_snapshot(&self, snapshot: Snapshot) -> Result<(), ReplicationError> {
        self.store.restore(&snapshot)?;
        self.initializer.init_config_with_retry().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, GatewayType, NodeGroup, TABLE_NODE_GROUPS};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingInitializer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConfigInitializer for CountingInitializer {
        async fn init_config_with_retry(&self) -> Result<(), ReplicationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_restore_then_rebuild() {
        let leader = MemDb::new();
        leader
            .with_wtx(|tx| {
                tx.insert(Entity::NodeGroup(NodeGroup {
                    name: "gw1".to_string(),
                    gateway_type: GatewayType::Mesh,
                    listen_port: 15006,
                    domains: vec![],
                    runtime: Default::default(),
                }))
            })
            .unwrap();

        let follower = Arc::new(MemDb::new());
        let initializer = Arc::new(CountingInitializer::default());
        let processor = SlaveSnapshotProcessor::new(follower.clone(), initializer.clone());

        processor
            .process_snapshot(leader.backup().unwrap())
            .await
            .unwrap();
        assert_eq!(follower.export()[TABLE_NODE_GROUPS].len(), 1);
        assert_eq!(initializer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restore_failure_short_circuits() {
        let follower = Arc::new(MemDb::new());
        let initializer = Arc::new(CountingInitializer::default());
        let processor = SlaveSnapshotProcessor::new(follower, initializer.clone());

        let err = processor
            .process_snapshot(Snapshot::from_bytes(b"garbage".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Store(_)));
        assert_eq!(initializer.calls.load(Ordering::SeqCst), 0);
    }
}
