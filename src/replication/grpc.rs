//! gRPC 复制总线
//!
//! `SnapshotBus` 服务由主节点在 `ip:bus_port` 上提供：
//! - `Subscribe(topic)`: 服务端流，每个主题一个 broadcast 通道
//! - `GetSnapshot()`: 当场备份并返回完整快照
//!
//! 广播是"最新状态"语义：落后的订阅者跳过旧帧，下一帧就是完整状态。

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

use super::transport::{
    BackupSource, SnapshotCallback, SnapshotProvider, SnapshotPublisher, SnapshotSubscriber,
    SNAPSHOT_TOPIC,
};
use super::ReplicationError;
use crate::storage::Snapshot;

// ═══════════════════════════════════════════════════════════════════════════
// Proto 生成模块 (tonic 自动生成)
// ═══════════════════════════════════════════════════════════════════════════

pub mod proto {
    tonic::include_proto!("meshgate.replication");
}

pub use proto::snapshot_bus_client::SnapshotBusClient;
pub use proto::snapshot_bus_server::{SnapshotBus, SnapshotBusServer};
pub use proto::{GetSnapshotRequest, SnapshotFrame, SubscribeRequest};

// ═══════════════════════════════════════════════════════════════════════════
// 配置
// ═══════════════════════════════════════════════════════════════════════════

/// 复制总线配置
#[derive(Debug, Clone)]
pub struct GrpcBusConfig {
    /// 连接超时
    pub connect_timeout: Duration,
    /// 单次请求超时（GetSnapshot）
    pub request_timeout: Duration,
    /// 最大消息大小 (字节)
    pub max_message_size: usize,
    /// 每个主题的广播缓冲
    pub channel_capacity: usize,
    /// 订阅流断开后的重连间隔
    pub reconnect_delay: Duration,
    /// 关闭服务端的等待上限
    pub shutdown_timeout: Duration,
}

impl Default for GrpcBusConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024 * 1024, // 64MB
            channel_capacity: 16,
            reconnect_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ═══════════════════════════════════════════════════════════════════════════
// 服务端
// ═══════════════════════════════════════════════════════════════════════════

struct BusState {
    topics: DashMap<String, broadcast::Sender<SnapshotFrame>>,
    source: Arc<dyn BackupSource>,
    capacity: usize,
}

impl BusState {
    fn topic(&self, name: &str) -> broadcast::Sender<SnapshotFrame> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

struct SnapshotBusService {
    state: Arc<BusState>,
}

#[tonic::async_trait]
impl SnapshotBus for SnapshotBusService {
    type SubscribeStream = Pin<Box<dyn Stream<Item = Result<SnapshotFrame, Status>> + Send>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        if req.topic.is_empty() {
            return Err(Status::invalid_argument("topic is required"));
        }

        let rx = self.state.topic(&req.topic).subscribe();
        log::info!("Subscriber {} joined topic {}", req.subscriber_id, req.topic);

        let subscriber_id = req.subscriber_id;
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(frame) => Some(Ok(frame)),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                log::warn!("Subscriber {} lagged, skipped {} frames", subscriber_id, n);
                None
            }
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_snapshot(
        &self,
        request: Request<GetSnapshotRequest>,
    ) -> Result<Response<SnapshotFrame>, Status> {
        let req = request.into_inner();
        let snapshot = self
            .state
            .source
            .backup()
            .map_err(|e| Status::internal(format!("backup failed: {}", e)))?;
        log::info!(
            "Serving full snapshot to {} ({} bytes)",
            req.requester_id,
            snapshot.len()
        );
        Ok(Response::new(SnapshotFrame {
            topic: SNAPSHOT_TOPIC.to_string(),
            payload: snapshot.into_bytes(),
            timestamp: now_millis(),
        }))
    }
}

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

/// 主节点侧发布者（内嵌 SnapshotBus gRPC 服务）
pub struct GrpcSnapshotPublisher {
    state: Arc<BusState>,
    config: GrpcBusConfig,
    server: tokio::sync::Mutex<Option<ServerHandle>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl GrpcSnapshotPublisher {
    pub fn new(source: Arc<dyn BackupSource>, config: GrpcBusConfig) -> Self {
        Self {
            state: Arc::new(BusState {
                topics: DashMap::new(),
                source,
                capacity: config.channel_capacity,
            }),
            config,
            server: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// 实际监听地址（端口为 0 时由系统分配）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl SnapshotPublisher for GrpcSnapshotPublisher {
    async fn activate(&self, address: &str) -> Result<(), ReplicationError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ReplicationError::Transport(format!("invalid bus address {}: {}", address, e)))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ReplicationError::Transport(format!("bind {} failed: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ReplicationError::Transport(e.to_string()))?;

        let service = SnapshotBusServer::new(SnapshotBusService {
            state: self.state.clone(),
        })
        .max_encoding_message_size(self.config.max_message_size)
        .max_decoding_message_size(self.config.max_message_size);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_rx.await;
                }),
        );

        log::info!("Snapshot bus listening on {}", local_addr);
        *self.local_addr.lock() = Some(local_addr);
        *server = Some(ServerHandle {
            local_addr,
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), ReplicationError> {
        let Some(server) = self.server.lock().await.take() else {
            return Ok(());
        };

        // 先关闭所有广播通道，订阅流随之结束，优雅关闭才不会被长连接卡住
        self.state.topics.clear();
        let _ = server.shutdown_tx.send(());

        let mut handle = server.handle;
        match tokio::time::timeout(self.config.shutdown_timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => log::warn!("Snapshot bus server error on shutdown: {}", e),
            Ok(Err(e)) => log::warn!("Snapshot bus server task failed: {}", e),
            Err(_) => {
                log::warn!("Snapshot bus shutdown timed out, aborting");
                handle.abort();
            }
        }
        *self.local_addr.lock() = None;
        log::info!("Snapshot bus on {} stopped", server.local_addr);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ReplicationError> {
        let Some(sender) = self.state.topics.get(topic).map(|s| s.clone()) else {
            log::debug!("No subscribers ever joined topic {}", topic);
            return Ok(());
        };

        let frame = SnapshotFrame {
            topic: topic.to_string(),
            payload,
            timestamp: now_millis(),
        };
        match sender.send(frame) {
            Ok(n) => log::debug!("Snapshot frame delivered to {} subscribers", n),
            Err(_) => log::debug!("All subscribers left topic {}", topic),
        }
        Ok(())
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .topics
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 客户端
// ═══════════════════════════════════════════════════════════════════════════

fn endpoint(address: &str, config: &GrpcBusConfig) -> Result<tonic::transport::Endpoint, ReplicationError> {
    Ok(Channel::from_shared(format!("http://{}", address))
        .map_err(|e| ReplicationError::Transport(format!("invalid address {}: {}", address, e)))?
        .connect_timeout(config.connect_timeout))
}

/// 从节点侧订阅者
pub struct GrpcSnapshotSubscriber {
    subscriber_id: String,
    config: GrpcBusConfig,
    channel: Mutex<Option<Channel>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GrpcSnapshotSubscriber {
    pub fn new(subscriber_id: impl Into<String>, config: GrpcBusConfig) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            config,
            channel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn client(&self, channel: Channel) -> SnapshotBusClient<Channel> {
        SnapshotBusClient::new(channel).max_decoding_message_size(self.config.max_message_size)
    }
}

#[async_trait]
impl SnapshotSubscriber for GrpcSnapshotSubscriber {
    async fn activate(&self, address: &str) -> Result<(), ReplicationError> {
        let channel = endpoint(address, &self.config)?.connect_lazy();
        *self.channel.lock() = Some(channel);
        log::debug!("Snapshot subscriber targeting {}", address);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: SnapshotCallback) -> Result<(), ReplicationError> {
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| ReplicationError::Transport("subscriber is not activated".to_string()))?;

        let request = SubscribeRequest {
            topic: topic.to_string(),
            subscriber_id: self.subscriber_id.clone(),
        };

        // 第一次订阅同步完成，保证之后拉取的初始快照不会漏掉广播
        let first = self.client(channel.clone()).subscribe(request.clone()).await?;

        let client = self.client(channel);
        let reconnect_delay = self.config.reconnect_delay;
        let handle = tokio::spawn(async move {
            let mut stream = Some(first.into_inner());
            loop {
                if let Some(mut frames) = stream.take() {
                    loop {
                        match frames.message().await {
                            Ok(Some(frame)) => callback(frame.payload),
                            Ok(None) => {
                                log::warn!("Snapshot stream closed by leader");
                                break;
                            }
                            Err(status) => {
                                log::warn!("Snapshot stream error: {}", status);
                                break;
                            }
                        }
                    }
                }

                tokio::time::sleep(reconnect_delay).await;
                match client.clone().subscribe(request.clone()).await {
                    Ok(response) => {
                        log::info!("Snapshot stream re-established");
                        stream = Some(response.into_inner());
                        // 断开期间的广播已经丢失，先补一份完整快照
                        resync(&client, &request.subscriber_id, &callback).await;
                    }
                    Err(status) => log::warn!("Snapshot resubscribe failed: {}", status),
                }
            }
        });

        self.tasks.lock().push(handle);
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), ReplicationError> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.channel.lock() = None;
        Ok(())
    }
}

/// 重新订阅后拉取完整快照交给回调；失败时等下一次广播
async fn resync(
    client: &SnapshotBusClient<Channel>,
    requester_id: &str,
    callback: &SnapshotCallback,
) {
    let request = GetSnapshotRequest {
        requester_id: requester_id.to_string(),
    };
    match client.clone().get_snapshot(request).await {
        Ok(response) => {
            let frame = response.into_inner();
            log::info!("Resynced full snapshot after reconnect ({} bytes)", frame.payload.len());
            callback(frame.payload);
        }
        Err(status) => log::warn!("Snapshot resync after reconnect failed: {}", status),
    }
}

/// 一次性拉取完整快照
pub struct GrpcSnapshotProvider {
    requester_id: String,
    config: GrpcBusConfig,
}

impl GrpcSnapshotProvider {
    pub fn new(requester_id: impl Into<String>, config: GrpcBusConfig) -> Self {
        Self {
            requester_id: requester_id.into(),
            config,
        }
    }
}

#[async_trait]
impl SnapshotProvider for GrpcSnapshotProvider {
    async fn get_snapshot(&self, address: &str) -> Result<Snapshot, ReplicationError> {
        let channel = endpoint(address, &self.config)?
            .timeout(self.config.request_timeout)
            .connect()
            .await?;
        let mut client =
            SnapshotBusClient::new(channel).max_decoding_message_size(self.config.max_message_size);

        let frame = client
            .get_snapshot(GetSnapshotRequest {
                requester_id: self.requester_id.clone(),
            })
            .await?
            .into_inner();
        log::info!("Fetched initial snapshot from {} ({} bytes)", address, frame.payload.len());
        Ok(Snapshot::from_bytes(frame.payload))
    }
}
