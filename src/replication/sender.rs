//! 快照发送器（仅主节点）
//!
//! 定期检查是否有待发送的变更，有且至少一个从节点订阅时
//! 备份整个存储并在 `SnapshotChanges` 主题上广播。

use super::configurator::SenderControl;
use super::role::NodeInfo;
use super::state::{LoopTransition, StateCell};
use super::transport::{BackupSource, SnapshotPublisher, SNAPSHOT_TOPIC};
use super::ReplicationError;
use crate::events::{BusError, Event, EventHandler};
use crate::observability::{SNAPSHOTS_PUBLISHED, SNAPSHOTS_SKIPPED, SNAPSHOT_SIZE_BYTES};
use crate::utils::backoff::{FixedInterval, IntervalProvider};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// 一次节拍的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// 没有待发送的变更
    Idle,
    /// 有变更但没有订阅者，计数保留
    NoSubscribers,
    Published,
    /// 备份或发布失败，计数保留
    Failed,
}

pub type IntervalFactory = Arc<dyn Fn() -> Box<dyn IntervalProvider> + Send + Sync>;

struct SenderCore {
    store: Arc<dyn BackupSource>,
    publisher: Arc<dyn SnapshotPublisher>,

    /// "有待发送的变更" 标志，不是精确计数
    pending_changes: AtomicI32,
}

impl SenderCore {
    fn mark_pending(&self) {
        let _ = self
            .pending_changes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_add(1)));
    }

    async fn tick(&self) -> TickOutcome {
        let observed = self.pending_changes.load(Ordering::SeqCst);
        if observed <= 0 {
            return TickOutcome::Idle;
        }

        if self.publisher.subscriber_count(SNAPSHOT_TOPIC) == 0 {
            SNAPSHOTS_SKIPPED.with_label_values(&["no_subscribers"]).inc();
            log::debug!("Pending changes but no subscribers, skip publishing");
            return TickOutcome::NoSubscribers;
        }

        let snapshot = match self.store.backup() {
            Ok(s) => s,
            Err(e) => {
                SNAPSHOTS_SKIPPED.with_label_values(&["error"]).inc();
                log::error!("Failed to back up store for replication: {}", e);
                return TickOutcome::Failed;
            }
        };

        let size = snapshot.len();
        if let Err(e) = self
            .publisher
            .publish(SNAPSHOT_TOPIC, snapshot.into_bytes())
            .await
        {
            SNAPSHOTS_SKIPPED.with_label_values(&["error"]).inc();
            log::error!("Failed to publish snapshot: {}", e);
            return TickOutcome::Failed;
        }

        // 只扣除本次观察到的值，发布期间新到的变更留到下一拍
        self.pending_changes.fetch_sub(observed, Ordering::SeqCst);
        SNAPSHOTS_PUBLISHED.inc();
        SNAPSHOT_SIZE_BYTES.observe(size as f64);
        log::debug!("Snapshot published ({} bytes)", size);
        TickOutcome::Published
    }
}

struct LoopHandle {
    quit_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// 快照发送器
pub struct DataSender {
    core: Arc<SenderCore>,
    state: StateCell,
    interval: IntervalFactory,
    op_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<LoopHandle>>,
}

impl DataSender {
    pub fn new(
        store: Arc<dyn BackupSource>,
        publisher: Arc<dyn SnapshotPublisher>,
        send_interval: Duration,
    ) -> Self {
        Self::with_interval(
            store,
            publisher,
            Arc::new(move || Box::new(FixedInterval::new(send_interval)) as Box<dyn IntervalProvider>),
        )
    }

    pub fn with_interval(
        store: Arc<dyn BackupSource>,
        publisher: Arc<dyn SnapshotPublisher>,
        interval: IntervalFactory,
    ) -> Self {
        Self {
            core: Arc::new(SenderCore {
                store,
                publisher,
                pending_changes: AtomicI32::new(0),
            }),
            state: StateCell::new("sender"),
            interval,
            op_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    pub fn pending_changes(&self) -> i32 {
        self.core.pending_changes.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.state.is_started()
    }

    /// 记录一次变更（与事件内容无关）
    pub fn handle_change_event(&self, _event: &Event) {
        self.core.mark_pending();
    }

    /// 执行一次节拍（由发送循环调用，测试中可直接调用）
    pub async fn tick(&self) -> TickOutcome {
        self.core.tick().await
    }

    pub async fn start_sending(&self, info: &NodeInfo) -> Result<(), ReplicationError> {
        let _guard = self.op_lock.lock().await;
        if self.state.is_started() {
            log::debug!("Sender already started");
            return Ok(());
        }

        self.state.apply(LoopTransition::BeginStart)?;
        let address = info.bus_address();
        if let Err(e) = self.core.publisher.activate(&address).await {
            self.state.apply(LoopTransition::StartFailed)?;
            log::error!("Failed to activate snapshot publisher at {}: {}", address, e);
            return Err(e);
        }

        let (quit_tx, mut quit_rx) = oneshot::channel::<()>();
        let core = self.core.clone();
        let mut interval = (self.interval)();
        let handle = tokio::spawn(async move {
            loop {
                let wait = interval.next_interval();
                tokio::select! {
                    _ = &mut quit_rx => break,
                    _ = tokio::time::sleep(wait) => {
                        core.tick().await;
                    }
                }
            }
            log::debug!("Sender loop exited");
        });

        *self.task.lock() = Some(LoopHandle { quit_tx, handle });
        self.state.apply(LoopTransition::StartSucceeded)?;
        log::info!("Snapshot sender started on {}", address);
        Ok(())
    }

    pub async fn stop_sending(&self) -> Result<(), ReplicationError> {
        let _guard = self.op_lock.lock().await;
        if !self.state.is_started() {
            return Err(ReplicationError::NotStarted("sender"));
        }

        if let Err(e) = self.core.publisher.deactivate().await {
            log::warn!("Failed to deactivate snapshot publisher: {}", e);
        }

        let task = self.task.lock().take();
        if let Some(LoopHandle { quit_tx, handle }) = task {
            let _ = quit_tx.send(());
            let _ = handle.await;
        }

        self.state.apply(LoopTransition::Stop)?;
        log::info!("Snapshot sender stopped");
        Ok(())
    }
}

impl EventHandler for DataSender {
    fn name(&self) -> &str {
        "data-sender"
    }

    fn handle(&self, event: &Event) -> Result<(), BusError> {
        self.handle_change_event(event);
        Ok(())
    }
}

#[async_trait]
impl SenderControl for DataSender {
    fn is_started(&self) -> bool {
        DataSender::is_started(self)
    }

    async fn start_sending(&self, info: &NodeInfo) -> Result<(), ReplicationError> {
        DataSender::start_sending(self, info).await
    }

    async fn stop_sending(&self) -> Result<(), ReplicationError> {
        DataSender::stop_sending(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ReloadEvent;
    use crate::storage::{Snapshot, StoreError};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakePublisher {
        subscribers: AtomicUsize,
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        published: Mutex<Vec<(String, usize)>>,
        fail_activate: bool,
        fail_publish: bool,
    }

    #[async_trait]
    impl SnapshotPublisher for FakePublisher {
        async fn activate(&self, _address: &str) -> Result<(), ReplicationError> {
            if self.fail_activate {
                return Err(ReplicationError::Transport("address in use".to_string()));
            }
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deactivate(&self) -> Result<(), ReplicationError> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ReplicationError> {
            if self.fail_publish {
                return Err(ReplicationError::Transport("broken pipe".to_string()));
            }
            self.published.lock().push((topic.to_string(), payload.len()));
            Ok(())
        }

        fn subscriber_count(&self, _topic: &str) -> usize {
            self.subscribers.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingStore {
        backups: AtomicUsize,
    }

    impl BackupSource for CountingStore {
        fn backup(&self) -> Result<Snapshot, StoreError> {
            self.backups.fetch_add(1, Ordering::SeqCst);
            Ok(Snapshot::from_bytes(vec![1, 2, 3]))
        }
    }

    fn info() -> NodeInfo {
        NodeInfo {
            ip: "127.0.0.1".to_string(),
            swim_port: 7946,
            bus_port: 5555,
            http_port: 8080,
        }
    }

    fn sender(store: Arc<CountingStore>, publisher: Arc<FakePublisher>) -> DataSender {
        DataSender::new(store, publisher, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_tick_without_pending_changes_does_nothing() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher::default());
        publisher.subscribers.store(2, Ordering::SeqCst);
        let sender = sender(store.clone(), publisher.clone());

        assert_eq!(sender.tick().await, TickOutcome::Idle);
        assert_eq!(store.backups.load(Ordering::SeqCst), 0);
        assert!(publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tick_without_subscribers_keeps_counter() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher::default());
        let sender = sender(store.clone(), publisher.clone());

        sender.handle_change_event(&ReloadEvent::all().into());
        sender.handle_change_event(&ReloadEvent::all().into());
        assert_eq!(sender.tick().await, TickOutcome::NoSubscribers);
        assert_eq!(sender.pending_changes(), 2);
        assert_eq!(store.backups.load(Ordering::SeqCst), 0);
        assert!(publisher.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tick_publishes_and_resets() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher::default());
        publisher.subscribers.store(1, Ordering::SeqCst);
        let sender = sender(store.clone(), publisher.clone());

        sender.handle(&ReloadEvent::all().into()).unwrap();
        assert_eq!(sender.tick().await, TickOutcome::Published);
        assert_eq!(sender.pending_changes(), 0);
        assert_eq!(
            *publisher.published.lock(),
            vec![(SNAPSHOT_TOPIC.to_string(), 3)]
        );

        // 已清零，下一拍空闲
        assert_eq!(sender.tick().await, TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_counter() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher {
            fail_publish: true,
            ..Default::default()
        });
        publisher.subscribers.store(1, Ordering::SeqCst);
        let sender = sender(store, publisher);

        sender.handle_change_event(&ReloadEvent::all().into());
        assert_eq!(sender.tick().await, TickOutcome::Failed);
        assert_eq!(sender.pending_changes(), 1);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher::default());
        let sender = sender(store, publisher.clone());

        assert!(matches!(
            sender.stop_sending().await,
            Err(ReplicationError::NotStarted(_))
        ));

        sender.start_sending(&info()).await.unwrap();
        assert!(sender.is_started());
        // 重复启动是空操作
        sender.start_sending(&info()).await.unwrap();
        assert_eq!(publisher.activations.load(Ordering::SeqCst), 1);

        sender.stop_sending().await.unwrap();
        assert!(!sender.is_started());
        assert_eq!(publisher.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activation_failure_stays_stopped() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher {
            fail_activate: true,
            ..Default::default()
        });
        let sender = sender(store, publisher);

        assert!(sender.start_sending(&info()).await.is_err());
        assert!(!sender.is_started());
    }

    #[tokio::test]
    async fn test_loop_publishes_pending_changes() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher::default());
        publisher.subscribers.store(1, Ordering::SeqCst);
        let sender = DataSender::new(store, publisher.clone(), Duration::from_millis(5));

        sender.start_sending(&info()).await.unwrap();
        sender.handle_change_event(&ReloadEvent::all().into());
        tokio::time::sleep(Duration::from_millis(60)).await;
        sender.stop_sending().await.unwrap();

        assert_eq!(publisher.published.lock().len(), 1);
        assert_eq!(sender.pending_changes(), 0);
    }

    #[test]
    fn test_counter_saturates() {
        let store = Arc::new(CountingStore::default());
        let publisher = Arc::new(FakePublisher::default());
        let sender = sender(store, publisher);
        sender.core.pending_changes.store(i32::MAX, Ordering::SeqCst);
        sender.handle_change_event(&ReloadEvent::all().into());
        assert_eq!(sender.pending_changes(), i32::MAX);
    }
}
