//! 发现服务 (gRPC)
//!
//! 七个流式发现服务共用同一个流处理循环：
//! - 节点身份取请求中 `node.cluster`（即节点组名），首个请求确定后不再变化
//! - 每个类型记录最近下发的版本和 nonce；缓存版本变化时推送完整集合
//! - 代理回报错误（`error_detail`）时截断错误信息记录日志，
//!   并重置该类型的版本标记，缓存下次变化时完整重发
//! - nonce 与最近下发不一致的请求视为过期，忽略

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use super::cache::SnapshotCache;
use super::proto::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use super::proto::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use super::proto::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use super::proto::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use super::proto::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use super::proto::runtime_discovery_service_server::{
    RuntimeDiscoveryService, RuntimeDiscoveryServiceServer,
};
use super::proto::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use super::proto::{DiscoveryRequest, DiscoveryResponse, Node};
use super::resources::{
    CLUSTER_TYPE, ENDPOINT_TYPE, LISTENER_TYPE, ROUTE_TYPE, RUNTIME_TYPE, SECRET_TYPE,
};
use crate::observability::{XDS_ACTIVE_STREAMS, XDS_NACKS, XDS_RESPONSES};
use crate::utils::config::XdsConfig;

type ResponseStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

const STREAM_BUFFER: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════
// 节点身份与回调
// ═══════════════════════════════════════════════════════════════════════════

/// 从请求节点信息计算缓存键
pub trait NodeHash: Send + Sync {
    fn id(&self, node: Option<&Node>) -> String;
}

/// 按 `node.cluster` 分组：同一节点组的代理共享一份资源
pub struct ClusterHash;

impl NodeHash for ClusterHash {
    fn id(&self, node: Option<&Node>) -> String {
        node.map(|n| n.cluster.clone()).unwrap_or_default()
    }
}

/// 流生命周期回调
pub trait DiscoveryCallbacks: Send + Sync {
    fn on_stream_open(&self, _stream_id: u64, _type_url: &str) {}

    fn on_stream_closed(&self, _stream_id: u64) {}

    fn on_stream_request(&self, _stream_id: u64, _request: &DiscoveryRequest) {}

    fn on_stream_response(&self, _stream_id: u64, _response: &DiscoveryResponse) {}
}

/// 记录日志的默认回调
pub struct LoggingCallbacks;

impl DiscoveryCallbacks for LoggingCallbacks {
    fn on_stream_open(&self, stream_id: u64, type_url: &str) {
        log::info!("xDS stream {} opened ({})", stream_id, display_type(type_url));
    }

    fn on_stream_closed(&self, stream_id: u64) {
        log::info!("xDS stream {} closed", stream_id);
    }

    fn on_stream_request(&self, stream_id: u64, request: &DiscoveryRequest) {
        log::debug!(
            "xDS stream {} request: type={} version={} nonce={} resources={:?}",
            stream_id,
            display_type(&request.type_url),
            request.version_info,
            request.response_nonce,
            request.resource_names
        );
    }

    fn on_stream_response(&self, stream_id: u64, response: &DiscoveryResponse) {
        log::debug!(
            "xDS stream {} response: type={} version={} nonce={} resources={}",
            stream_id,
            display_type(&response.type_url),
            response.version_info,
            response.nonce,
            response.resources.len()
        );
    }
}

/// type URL 的最后一段，用于日志和指标标签
fn display_type(type_url: &str) -> &str {
    if type_url.is_empty() {
        return "ads";
    }
    type_url.rsplit('.').next().unwrap_or(type_url)
}

fn truncate_message(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        message.to_string()
    } else {
        let mut truncated: String = message.chars().take(max_len).collect();
        truncated.push_str("...");
        truncated
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 单个流的状态
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct TypeState {
    /// 最近下发的版本；None 表示下一次必须完整发送
    last_version: Option<String>,
    last_nonce: Option<String>,
}

struct StreamState {
    id: u64,
    default_type: Option<&'static str>,
    cache: Arc<SnapshotCache>,
    callbacks: Arc<dyn DiscoveryCallbacks>,
    hasher: Arc<dyn NodeHash>,
    max_error_len: usize,

    node_group: Option<String>,
    watch: Option<watch::Receiver<u64>>,
    types: HashMap<String, TypeState>,
}

impl StreamState {
    /// 处理一个请求，返回需要立即下发的响应
    fn on_request(&mut self, req: DiscoveryRequest) -> Result<Option<DiscoveryResponse>, Status> {
        let type_url = if req.type_url.is_empty() {
            self.default_type
                .map(str::to_string)
                .ok_or_else(|| Status::invalid_argument("type_url is required on aggregated streams"))?
        } else {
            req.type_url.clone()
        };

        if self.node_group.is_none() {
            let id = self.hasher.id(req.node.as_ref());
            if id.is_empty() {
                return Err(Status::invalid_argument("node.cluster is required"));
            }
            log::info!("xDS stream {} bound to node group {}", self.id, id);
            self.watch = Some(self.cache.watch(&id));
            self.node_group = Some(id);
        }

        self.callbacks.on_stream_request(self.id, &req);
        let state = self.types.entry(type_url.clone()).or_default();

        if let Some(detail) = &req.error_detail {
            XDS_NACKS
                .with_label_values(&[display_type(&type_url)])
                .inc();
            log::warn!(
                "xDS stream {} NACK for {} (version {}, nonce {}): {}",
                self.id,
                display_type(&type_url),
                req.version_info,
                req.response_nonce,
                truncate_message(&detail.message, self.max_error_len)
            );
            state.last_version = None;
            return Ok(None);
        }

        if let Some(nonce) = &state.last_nonce {
            if !req.response_nonce.is_empty() && &req.response_nonce != nonce {
                log::debug!(
                    "xDS stream {} ignoring stale nonce {} for {}",
                    self.id,
                    req.response_nonce,
                    display_type(&type_url)
                );
                return Ok(None);
            }
        }

        Ok(self.next_response(&type_url))
    }

    /// 缓存变化：为每个已订阅类型检查是否需要推送
    fn on_cache_changed(&mut self) -> Vec<DiscoveryResponse> {
        let subscribed: Vec<String> = self.types.keys().cloned().collect();
        subscribed
            .iter()
            .filter_map(|type_url| self.next_response(type_url))
            .collect()
    }

    fn next_response(&mut self, type_url: &str) -> Option<DiscoveryResponse> {
        let node_group = self.node_group.as_deref()?;
        let set = self.cache.get(node_group, type_url)?;
        let state = self.types.entry(type_url.to_string()).or_default();
        if state.last_version.as_deref() == Some(set.version.as_str()) {
            return None;
        }

        let nonce = uuid::Uuid::new_v4().to_string();
        state.last_version = Some(set.version.clone());
        state.last_nonce = Some(nonce.clone());

        let response = DiscoveryResponse {
            version_info: set.version,
            resources: set.resources,
            canary: false,
            type_url: type_url.to_string(),
            nonce,
        };
        XDS_RESPONSES
            .with_label_values(&[display_type(type_url)])
            .inc();
        self.callbacks.on_stream_response(self.id, &response);
        Some(response)
    }
}

async fn wait_changed(watch: &mut Option<watch::Receiver<u64>>) -> bool {
    match watch {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

enum StreamInput {
    Request(Option<Result<DiscoveryRequest, Status>>),
    CacheChanged(bool),
}

/// 返回流绑定的节点组，此时 watch 已释放
async fn run_stream<S>(
    mut state: StreamState,
    mut requests: S,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Option<String>
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    'stream: loop {
        let input = tokio::select! {
            request = requests.next() => StreamInput::Request(request),
            alive = wait_changed(&mut state.watch) => StreamInput::CacheChanged(alive),
        };

        let responses = match input {
            StreamInput::Request(Some(Ok(req))) => match state.on_request(req) {
                Ok(response) => response.into_iter().collect::<Vec<_>>(),
                Err(status) => {
                    log::warn!("xDS stream {} rejected: {}", state.id, status.message());
                    let _ = tx.send(Err(status)).await;
                    break;
                }
            },
            StreamInput::Request(Some(Err(status))) => {
                log::debug!("xDS stream {} receive error: {}", state.id, status);
                break;
            }
            StreamInput::Request(None) => break,
            StreamInput::CacheChanged(false) => break,
            StreamInput::CacheChanged(true) => state.on_cache_changed(),
        };

        for response in responses {
            if tx.send(Ok(response)).await.is_err() {
                log::debug!("xDS stream {} client went away", state.id);
                break 'stream;
            }
        }
    }

    state.watch = None;
    state.node_group
}

// ═══════════════════════════════════════════════════════════════════════════
// 服务
// ═══════════════════════════════════════════════════════════════════════════

/// 发现服务
pub struct DiscoveryServer {
    cache: Arc<SnapshotCache>,
    callbacks: Arc<dyn DiscoveryCallbacks>,
    hasher: Arc<dyn NodeHash>,
    max_error_len: usize,
    next_stream_id: AtomicU64,
}

impl DiscoveryServer {
    pub fn new(cache: Arc<SnapshotCache>, max_error_len: usize) -> Self {
        Self {
            cache,
            callbacks: Arc::new(LoggingCallbacks),
            hasher: Arc::new(ClusterHash),
            max_error_len,
            next_stream_id: AtomicU64::new(1),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn DiscoveryCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_node_hash(mut self, hasher: Arc<dyn NodeHash>) -> Self {
        self.hasher = hasher;
        self
    }

    /// 为一个请求流启动处理任务，返回响应流
    ///
    /// `default_type` 为 None 表示聚合流，每个请求必须带 type_url。
    pub fn handle_stream<S>(&self, requests: S, default_type: Option<&'static str>) -> ResponseStream
    where
        S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
    {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let state = StreamState {
            id,
            default_type,
            cache: self.cache.clone(),
            callbacks: self.callbacks.clone(),
            hasher: self.hasher.clone(),
            max_error_len: self.max_error_len,
            node_group: None,
            watch: None,
            types: HashMap::new(),
        };

        let cache = self.cache.clone();
        let callbacks = self.callbacks.clone();
        callbacks.on_stream_open(id, default_type.unwrap_or(""));
        XDS_ACTIVE_STREAMS.inc();
        tokio::spawn(async move {
            if let Some(node_group) = run_stream(state, requests, tx).await {
                cache.release(&node_group);
            }
            XDS_ACTIVE_STREAMS.dec();
            callbacks.on_stream_closed(id);
        });

        ReceiverStream::new(rx)
    }

    /// 启动 gRPC 服务直到 `shutdown` 完成
    ///
    /// 只由服务端发起 keepalive ping；不限制客户端 ping 的频率，传输层没有提供这项策略。
    pub async fn serve<F>(
        self: Arc<Self>,
        addr: SocketAddr,
        config: &XdsConfig,
        shutdown: F,
    ) -> Result<(), tonic::transport::Error>
    where
        F: Future<Output = ()> + Send,
    {
        log::info!("xDS server listening on {}", addr);
        Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(config.keepalive_interval_s)))
            .http2_keepalive_timeout(Some(Duration::from_secs(config.keepalive_timeout_s)))
            .tcp_keepalive(Some(Duration::from_secs(config.keepalive_interval_s)))
            .add_service(AggregatedDiscoveryServiceServer::from_arc(self.clone()))
            .add_service(ListenerDiscoveryServiceServer::from_arc(self.clone()))
            .add_service(ClusterDiscoveryServiceServer::from_arc(self.clone()))
            .add_service(RouteDiscoveryServiceServer::from_arc(self.clone()))
            .add_service(EndpointDiscoveryServiceServer::from_arc(self.clone()))
            .add_service(SecretDiscoveryServiceServer::from_arc(self.clone()))
            .add_service(RuntimeDiscoveryServiceServer::from_arc(self))
            .serve_with_shutdown(addr, shutdown)
            .await
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = ResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(Response::new(self.handle_stream(request.into_inner(), None)))
    }
}

#[tonic::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = ResponseStream;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        Ok(Response::new(self.handle_stream(request.into_inner(), Some(LISTENER_TYPE))))
    }
}

#[tonic::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = ResponseStream;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        Ok(Response::new(self.handle_stream(request.into_inner(), Some(CLUSTER_TYPE))))
    }
}

#[tonic::async_trait]
impl RouteDiscoveryService for DiscoveryServer {
    type StreamRoutesStream = ResponseStream;

    async fn stream_routes(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRoutesStream>, Status> {
        Ok(Response::new(self.handle_stream(request.into_inner(), Some(ROUTE_TYPE))))
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryService for DiscoveryServer {
    type StreamEndpointsStream = ResponseStream;

    async fn stream_endpoints(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamEndpointsStream>, Status> {
        Ok(Response::new(self.handle_stream(request.into_inner(), Some(ENDPOINT_TYPE))))
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for DiscoveryServer {
    type StreamSecretsStream = ResponseStream;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        Ok(Response::new(self.handle_stream(request.into_inner(), Some(SECRET_TYPE))))
    }
}

#[tonic::async_trait]
impl RuntimeDiscoveryService for DiscoveryServer {
    type StreamRuntimeStream = ResponseStream;

    async fn stream_runtime(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRuntimeStream>, Status> {
        Ok(Response::new(self.handle_stream(request.into_inner(), Some(RUNTIME_TYPE))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::proto::{Any, ErrorDetail};
    use std::time::Duration;
    use tokio::time::timeout;

    fn any(name: &str) -> Any {
        Any {
            type_url: CLUSTER_TYPE.to_string(),
            value: name.as_bytes().to_vec(),
        }
    }

    fn request(cluster: &str, type_url: &str, nonce: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: String::new(),
            node: Some(Node {
                id: "envoy-1".to_string(),
                cluster: cluster.to_string(),
                user_agent_name: "envoy".to_string(),
            }),
            resource_names: vec![],
            type_url: type_url.to_string(),
            response_nonce: nonce.to_string(),
            error_detail: None,
        }
    }

    type RequestTx = mpsc::Sender<Result<DiscoveryRequest, Status>>;

    fn open(server: &DiscoveryServer, default_type: Option<&'static str>) -> (RequestTx, ResponseStream) {
        let (tx, rx) = mpsc::channel(8);
        let responses = server.handle_stream(ReceiverStream::new(rx), default_type);
        (tx, responses)
    }

    async fn next(responses: &mut ResponseStream) -> Result<DiscoveryResponse, Status> {
        timeout(Duration::from_secs(2), responses.next())
            .await
            .expect("response timed out")
            .expect("stream ended")
    }

    async fn assert_quiet(responses: &mut ResponseStream) {
        assert!(timeout(Duration::from_millis(100), responses.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_then_push_on_change() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_resources("gw1", CLUSTER_TYPE, "1".to_string(), vec![any("a")]);
        let server = DiscoveryServer::new(cache.clone(), 16);
        let (tx, mut responses) = open(&server, Some(CLUSTER_TYPE));

        tx.send(Ok(request("gw1", "", ""))).await.unwrap();
        let first = next(&mut responses).await.unwrap();
        assert_eq!(first.version_info, "1");
        assert_eq!(first.type_url, CLUSTER_TYPE);
        assert_eq!(first.resources.len(), 1);

        tx.send(Ok(request("gw1", "", &first.nonce))).await.unwrap();
        assert_quiet(&mut responses).await;

        cache.set_resources("gw1", CLUSTER_TYPE, "2".to_string(), vec![any("a"), any("b")]);
        let second = next(&mut responses).await.unwrap();
        assert_eq!(second.version_info, "2");
        assert_eq!(second.resources.len(), 2);
        assert_ne!(second.nonce, first.nonce);
    }

    #[tokio::test]
    async fn test_nack_resets_version_marker() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_resources("gw1", CLUSTER_TYPE, "1".to_string(), vec![any("a")]);
        let server = DiscoveryServer::new(cache.clone(), 16);
        let (tx, mut responses) = open(&server, Some(CLUSTER_TYPE));

        tx.send(Ok(request("gw1", "", ""))).await.unwrap();
        let first = next(&mut responses).await.unwrap();

        let mut nack = request("gw1", "", &first.nonce);
        nack.error_detail = Some(ErrorDetail {
            code: 3,
            message: "x".repeat(1000),
        });
        tx.send(Ok(nack)).await.unwrap();
        assert_quiet(&mut responses).await;

        // 版本不变，但标记已重置，仍然完整重发
        cache.set_resources("gw1", CLUSTER_TYPE, "1".to_string(), vec![any("a")]);
        let resend = next(&mut responses).await.unwrap();
        assert_eq!(resend.version_info, "1");
        assert_eq!(resend.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_nonce_ignored() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_resources("gw1", CLUSTER_TYPE, "1".to_string(), vec![any("a")]);
        let server = DiscoveryServer::new(cache.clone(), 16);
        let (tx, mut responses) = open(&server, Some(CLUSTER_TYPE));

        tx.send(Ok(request("gw1", "", ""))).await.unwrap();
        next(&mut responses).await.unwrap();

        tx.send(Ok(request("gw1", "", "old-nonce"))).await.unwrap();
        assert_quiet(&mut responses).await;
    }

    #[tokio::test]
    async fn test_aggregated_stream_requires_type_url() {
        let server = DiscoveryServer::new(Arc::new(SnapshotCache::new()), 16);
        let (tx, mut responses) = open(&server, None);

        tx.send(Ok(request("gw1", "", ""))).await.unwrap();
        let status = next(&mut responses).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_aggregated_stream_serves_multiple_types() {
        let cache = Arc::new(SnapshotCache::new());
        cache.set_resources("gw1", CLUSTER_TYPE, "1".to_string(), vec![any("c")]);
        cache.set_resources("gw1", LISTENER_TYPE, "7".to_string(), vec![any("l")]);
        let server = DiscoveryServer::new(cache.clone(), 16);
        let (tx, mut responses) = open(&server, None);

        tx.send(Ok(request("gw1", CLUSTER_TYPE, ""))).await.unwrap();
        assert_eq!(next(&mut responses).await.unwrap().type_url, CLUSTER_TYPE);

        tx.send(Ok(request("gw1", LISTENER_TYPE, ""))).await.unwrap();
        let listener = next(&mut responses).await.unwrap();
        assert_eq!(listener.type_url, LISTENER_TYPE);
        assert_eq!(listener.version_info, "7");
    }

    #[tokio::test]
    async fn test_missing_node_cluster_rejected() {
        let server = DiscoveryServer::new(Arc::new(SnapshotCache::new()), 16);
        let (tx, mut responses) = open(&server, Some(LISTENER_TYPE));

        tx.send(Ok(request("", "", ""))).await.unwrap();
        let status = next(&mut responses).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_closed_stream_releases_watch() {
        let cache = Arc::new(SnapshotCache::new());
        let server = DiscoveryServer::new(cache.clone(), 16);
        let (tx, mut responses) = open(&server, Some(CLUSTER_TYPE));

        tx.send(Ok(request("no-such-group", "", ""))).await.unwrap();
        assert_quiet(&mut responses).await;
        assert_eq!(cache.entry_counts(), (0, 1));

        drop(tx);
        let mut released = false;
        for _ in 0..50 {
            if cache.entry_counts() == (0, 0) {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("abcdef", 3), "abc...");
        assert_eq!(truncate_message("错误信息很长", 2), "错误...");
    }

    #[test]
    fn test_display_type() {
        assert_eq!(display_type(CLUSTER_TYPE), "Cluster");
        assert_eq!(display_type(""), "ads");
    }
}
