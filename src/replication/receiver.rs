//! 快照接收器（仅从节点）
//!
//! 启动时先订阅 `SnapshotChanges`，再拉取一次完整快照；
//! 应用循环总是先应用初始快照，再按到达顺序逐个应用流式快照。

use super::configurator::ReceiverControl;
use super::state::{LoopTransition, StateCell};
use super::transport::{SnapshotProvider, SnapshotSubscriber, SNAPSHOT_TOPIC};
use super::ReplicationError;
use crate::observability::SNAPSHOTS_APPLIED;
use crate::storage::Snapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// 快照处理函数
#[async_trait]
pub trait ProcessSnapshot: Send + Sync {
    async fn process_snapshot(&self, snapshot: Snapshot) -> Result<(), ReplicationError>;
}

struct LoopHandle {
    quit_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// 快照接收器
pub struct DataReceiver {
    subscriber: Arc<dyn SnapshotSubscriber>,
    provider: Arc<dyn SnapshotProvider>,
    processor: Arc<dyn ProcessSnapshot>,
    state: StateCell,

    /// 积压超过该值时告警
    backlog_warn_threshold: usize,
    backlog: Arc<AtomicUsize>,

    op_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<LoopHandle>>,
}

impl DataReceiver {
    pub fn new(
        subscriber: Arc<dyn SnapshotSubscriber>,
        provider: Arc<dyn SnapshotProvider>,
        processor: Arc<dyn ProcessSnapshot>,
        backlog_warn_threshold: usize,
    ) -> Self {
        Self {
            subscriber,
            provider,
            processor,
            state: StateCell::new("receiver"),
            backlog_warn_threshold,
            backlog: Arc::new(AtomicUsize::new(0)),
            op_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.is_started()
    }

    pub async fn start_receiving(&self, bus_address: &str) -> Result<(), ReplicationError> {
        let _guard = self.op_lock.lock().await;
        if self.state.is_started() {
            log::debug!("Receiver already started");
            return Ok(());
        }

        self.state.apply(LoopTransition::BeginStart)?;
        match self.connect(bus_address).await {
            Ok(handle) => {
                *self.task.lock() = Some(handle);
                self.state.apply(LoopTransition::StartSucceeded)?;
                log::info!("Snapshot receiver started, leader bus at {}", bus_address);
                Ok(())
            }
            Err(e) => {
                self.state.apply(LoopTransition::StartFailed)?;
                log::error!("Failed to start snapshot receiver: {}", e);
                Err(e)
            }
        }
    }

    async fn connect(&self, bus_address: &str) -> Result<LoopHandle, ReplicationError> {
        self.subscriber.activate(bus_address).await?;

        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let backlog = self.backlog.clone();
        let threshold = self.backlog_warn_threshold;
        let callback = Arc::new(move |payload: Vec<u8>| {
            let queued = backlog.fetch_add(1, Ordering::SeqCst) + 1;
            if queued > threshold {
                log::warn!("Snapshot backlog is {} (threshold {})", queued, threshold);
            }
            if stream_tx.send(payload).is_err() {
                backlog.fetch_sub(1, Ordering::SeqCst);
            }
        });

        if let Err(e) = self.subscriber.subscribe(SNAPSHOT_TOPIC, callback).await {
            self.deactivate_quietly().await;
            return Err(e);
        }

        let initial = match self.provider.get_snapshot(bus_address).await {
            Ok(s) => s,
            Err(e) => {
                self.deactivate_quietly().await;
                return Err(e);
            }
        };

        let (init_tx, init_rx) = oneshot::channel::<Snapshot>();
        let (quit_tx, mut quit_rx) = oneshot::channel::<()>();
        let processor = self.processor.clone();
        let backlog = self.backlog.clone();

        let handle = tokio::spawn(async move {
            // 初始快照先于任何流式快照
            tokio::select! {
                _ = &mut quit_rx => return,
                initial = init_rx => match initial {
                    Ok(snapshot) => apply(processor.as_ref(), snapshot).await,
                    Err(_) => return,
                },
            }

            loop {
                tokio::select! {
                    _ = &mut quit_rx => break,
                    payload = stream_rx.recv() => match payload {
                        Some(bytes) => {
                            backlog.fetch_sub(1, Ordering::SeqCst);
                            apply(processor.as_ref(), Snapshot::from_bytes(bytes)).await;
                        }
                        None => break,
                    },
                }
            }
            log::debug!("Receiver loop exited");
        });

        let _ = init_tx.send(initial);
        Ok(LoopHandle { quit_tx, handle })
    }

    async fn deactivate_quietly(&self) {
        if let Err(e) = self.subscriber.deactivate().await {
            log::warn!("Failed to deactivate snapshot subscriber: {}", e);
        }
    }

    pub async fn stop_receiving(&self) -> Result<(), ReplicationError> {
        let _guard = self.op_lock.lock().await;
        if !self.state.is_started() {
            return Err(ReplicationError::NotStarted("receiver"));
        }

        self.deactivate_quietly().await;

        let task = self.task.lock().take();
        if let Some(LoopHandle { quit_tx, handle }) = task {
            let _ = quit_tx.send(());
            let _ = handle.await;
        }
        self.backlog.store(0, Ordering::SeqCst);

        self.state.apply(LoopTransition::Stop)?;
        log::info!("Snapshot receiver stopped");
        Ok(())
    }
}

async fn apply(processor: &dyn ProcessSnapshot, snapshot: Snapshot) {
    let size = snapshot.len();
    match processor.process_snapshot(snapshot).await {
        Ok(()) => {
            SNAPSHOTS_APPLIED.with_label_values(&["ok"]).inc();
            log::debug!("Snapshot applied ({} bytes)", size);
        }
        Err(e) => {
            SNAPSHOTS_APPLIED.with_label_values(&["error"]).inc();
            log::error!("Failed to process snapshot: {}", e);
        }
    }
}

#[async_trait]
impl ReceiverControl for DataReceiver {
    fn is_started(&self) -> bool {
        DataReceiver::is_started(self)
    }

    async fn start_receiving(&self, bus_address: &str) -> Result<(), ReplicationError> {
        DataReceiver::start_receiving(self, bus_address).await
    }

    async fn stop_receiving(&self) -> Result<(), ReplicationError> {
        DataReceiver::stop_receiving(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::transport::SnapshotCallback;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSubscriber {
        callback: Mutex<Option<SnapshotCallback>>,
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        /// 订阅时立即推送的流式快照（模拟初始快照之前到达的广播）
        early: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl SnapshotSubscriber for FakeSubscriber {
        async fn activate(&self, _address: &str) -> Result<(), ReplicationError> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn subscribe(&self, _topic: &str, callback: SnapshotCallback) -> Result<(), ReplicationError> {
            for payload in &self.early {
                callback(payload.clone());
            }
            *self.callback.lock() = Some(callback);
            Ok(())
        }

        async fn deactivate(&self) -> Result<(), ReplicationError> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            *self.callback.lock() = None;
            Ok(())
        }
    }

    impl FakeSubscriber {
        fn push(&self, payload: Vec<u8>) {
            let callback = self.callback.lock().clone();
            if let Some(cb) = callback {
                cb(payload);
            }
        }
    }

    struct FakeProvider {
        result: Result<Vec<u8>, String>,
    }

    #[async_trait]
    impl SnapshotProvider for FakeProvider {
        async fn get_snapshot(&self, _address: &str) -> Result<Snapshot, ReplicationError> {
            self.result
                .clone()
                .map(Snapshot::from_bytes)
                .map_err(ReplicationError::Transport)
        }
    }

    #[derive(Default)]
    struct RecordingProcessor {
        applied: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ProcessSnapshot for RecordingProcessor {
        async fn process_snapshot(&self, snapshot: Snapshot) -> Result<(), ReplicationError> {
            let bytes = snapshot.into_bytes();
            let fail = bytes == b"bad".to_vec();
            self.applied.lock().push(bytes);
            if fail {
                return Err(ReplicationError::Transport("corrupt".to_string()));
            }
            Ok(())
        }
    }

    async fn wait_for(processor: &RecordingProcessor, n: usize) {
        for _ in 0..100 {
            if processor.applied.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_applied_before_streamed() {
        let subscriber = Arc::new(FakeSubscriber {
            early: vec![b"early".to_vec()],
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider {
            result: Ok(b"initial".to_vec()),
        });
        let processor = Arc::new(RecordingProcessor::default());
        let receiver = DataReceiver::new(subscriber.clone(), provider, processor.clone(), 8);

        receiver.start_receiving("10.0.0.1:5555").await.unwrap();
        assert!(receiver.is_started());
        subscriber.push(b"bad".to_vec());
        subscriber.push(b"late".to_vec());
        wait_for(&processor, 4).await;

        assert_eq!(
            *processor.applied.lock(),
            vec![
                b"initial".to_vec(),
                b"early".to_vec(),
                b"bad".to_vec(),
                b"late".to_vec()
            ]
        );

        receiver.stop_receiving().await.unwrap();
        assert!(!receiver.is_started());
        assert_eq!(subscriber.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initial_fetch_failure_never_starts() {
        let subscriber = Arc::new(FakeSubscriber {
            early: vec![b"early".to_vec()],
            ..Default::default()
        });
        let provider = Arc::new(FakeProvider {
            result: Err("leader unreachable".to_string()),
        });
        let processor = Arc::new(RecordingProcessor::default());
        let receiver = DataReceiver::new(subscriber.clone(), provider, processor.clone(), 8);

        assert!(receiver.start_receiving("10.0.0.1:5555").await.is_err());
        assert!(!receiver.is_started());
        assert_eq!(subscriber.deactivations.load(Ordering::SeqCst), 1);

        subscriber.push(b"streamed".to_vec());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(processor.applied.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_stopped() {
        let receiver = DataReceiver::new(
            Arc::new(FakeSubscriber::default()),
            Arc::new(FakeProvider { result: Ok(vec![]) }),
            Arc::new(RecordingProcessor::default()),
            8,
        );
        assert!(matches!(
            receiver.stop_receiving().await,
            Err(ReplicationError::NotStarted(_))
        ));
    }
}
