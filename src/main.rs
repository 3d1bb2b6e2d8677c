//! Meshgate 控制面服务
//!
//! 启动顺序：
//! 1. 配置 + 日志 + 指标
//! 2. 存储（从持久化快照恢复）
//! 3. 资源构建器 / 缓存 / 总线订阅
//! 4. 复制两侧（gRPC 快照总线）+ 配置器 + 角色管理
//! 5. 定期落盘、通知监听、xDS 服务、运维 HTTP
//!
//! 运行: cargo run --bin meshgate-server -- --config config/meshgate.toml --role master

use anyhow::Context;
use meshgate::events::EventBus;
use meshgate::replication::{
    ConfigInitializer, Configurator, DataReceiver, DataSender, GrpcBusConfig, GrpcSnapshotProvider,
    GrpcSnapshotPublisher, GrpcSnapshotSubscriber, NodeContext, RoleManager, RoleView,
    SlaveSnapshotProcessor,
};
use meshgate::service::http::{AppState, HttpServer};
use meshgate::storage::{
    DurableFlusher, DurableStore, FileDurableStore, MemDb, NotificationListener,
    TcpNotificationSource,
};
use meshgate::utils::{CliArgs, MeshgateConfig};
use meshgate::xds::{BuilderRegistry, CacheUpdater, DiscoveryServer, SnapshotCache};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn resolve_pod_id(configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("meshgate-{}", &uuid::Uuid::new_v4().to_string()[..8]))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // 1. 配置（日志级别来自配置，所以先加载配置）
    let args = CliArgs::from_env()?;
    let (mut config, config_warning) = match &args.config {
        Some(path) => (
            MeshgateConfig::load_from_file(path)
                .with_context(|| format!("failed to load config {}", path))?,
            None,
        ),
        None => match MeshgateConfig::load_default() {
            Ok(cfg) => (cfg, None),
            Err(e) => (MeshgateConfig::default(), Some(e.to_string())),
        },
    };
    config.apply_cli(&args);
    config.validate().context("invalid configuration")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.server.log_level.as_str()),
    )
    .init();
    if let Some(warning) = config_warning {
        log::warn!("Failed to load config file: {}, using defaults", warning);
    }

    meshgate::observability::init_metrics();

    let context = NodeContext::new(
        resolve_pod_id(&config.server.pod_id),
        config.server.tls_mode.clone(),
        config.node.node_info(),
    );
    log::info!(
        "[{}] Starting {} ({}) bus={} xds={} http={}",
        context.pod_id,
        config.server.name,
        config.server.environment,
        context.node.bus_address(),
        config.xds.bind_address(),
        config.node.http_port
    );

    // 2. 存储
    let store = Arc::new(MemDb::new());
    let durable: Arc<dyn DurableStore> = Arc::new(
        FileDurableStore::new(&config.storage.snapshot_path)
            .context("failed to open durable store")?,
    );
    match durable.load() {
        Ok(Some(snapshot)) => match store.restore(&snapshot) {
            Ok(()) => log::info!(
                "[{}] Store restored from {} ({} bytes)",
                context.pod_id,
                config.storage.snapshot_path,
                snapshot.len()
            ),
            Err(e) => log::error!("[{}] Ignoring unreadable durable snapshot: {}", context.pod_id, e),
        },
        Ok(None) => log::info!("[{}] No durable snapshot, starting empty", context.pod_id),
        Err(e) => log::error!("[{}] Failed to load durable snapshot: {}", context.pod_id, e),
    }

    // 3. 资源构建与缓存
    let cache = Arc::new(SnapshotCache::new());
    let updater = Arc::new(CacheUpdater::new(
        store.clone(),
        Arc::new(BuilderRegistry::new()),
        cache.clone(),
        config.replication.init_retry.clone(),
    ));
    if let Err(e) = updater.init_config_with_retry().await {
        log::error!("[{}] Initial resource build incomplete: {}", context.pod_id, e);
    }

    let bus = Arc::new(EventBus::new());
    bus.subscribe_all(updater.clone());

    // 4. 复制
    let bus_config = GrpcBusConfig::default();
    let publisher = Arc::new(GrpcSnapshotPublisher::new(store.clone(), bus_config.clone()));
    let sender = Arc::new(DataSender::new(
        store.clone(),
        publisher,
        config.replication.send_interval(),
    ));
    bus.subscribe_all(sender.clone());

    let receiver = Arc::new(DataReceiver::new(
        Arc::new(GrpcSnapshotSubscriber::new(context.pod_id.clone(), bus_config.clone())),
        Arc::new(GrpcSnapshotProvider::new(context.pod_id.clone(), bus_config)),
        Arc::new(SlaveSnapshotProcessor::new(store.clone(), updater.clone())),
        config.replication.receive_queue_capacity,
    ));

    let configurator = Arc::new(Configurator::new(sender, receiver));
    let role_manager = Arc::new(RoleManager::new(context.clone(), configurator.clone()));
    let initial_target = config.node.initial_role_target()?;
    if let Err(e) = role_manager
        .apply(initial_target, config.node.initial_role)
        .await
    {
        log::error!(
            "[{}] Failed to apply initial role {}: {}",
            context.pod_id,
            config.node.initial_role,
            e
        );
    }

    // 5. 后台任务
    let flusher = DurableFlusher::spawn(
        store.clone(),
        durable,
        role_manager.clone() as Arc<dyn RoleView>,
        Duration::from_millis(config.storage.flush_interval_ms),
    );

    let mut listener = if !config.notify.channel.is_empty() && !config.notify.address.is_empty() {
        let mut listener = NotificationListener::new(
            config.notify.channel.clone(),
            Arc::new(TcpNotificationSource::new(config.notify.address.clone())),
            Duration::from_millis(config.notify.reconnect_backoff_ms),
        );
        let pod_id = context.pod_id.clone();
        listener.add_handler(move |n| {
            log::info!("[{}] Notification on '{}': {}", pod_id, n.channel, n.payload)
        });
        listener.start();
        Some(listener)
    } else {
        None
    };

    let xds_addr: SocketAddr = config
        .xds
        .bind_address()
        .parse()
        .with_context(|| format!("invalid xDS address {}", config.xds.bind_address()))?;
    let discovery = Arc::new(DiscoveryServer::new(
        cache.clone(),
        config.xds.max_error_message_len,
    ));
    let (xds_shutdown_tx, xds_shutdown_rx) = oneshot::channel::<()>();
    let xds_config = config.xds.clone();
    let xds_handle = tokio::spawn(async move {
        let shutdown = async {
            let _ = xds_shutdown_rx.await;
        };
        if let Err(e) = discovery.serve(xds_addr, &xds_config, shutdown).await {
            log::error!("xDS server error: {}", e);
        }
    });

    let http_address = format!("0.0.0.0:{}", config.node.http_port);
    let app_state = Arc::new(AppState {
        role_manager: role_manager.clone(),
        store: store.clone(),
        cache,
    });
    let http_result = HttpServer::new(app_state, http_address).run().await;

    // 关闭
    log::info!("[{}] Shutting down", context.pod_id);
    let _ = xds_shutdown_tx.send(());
    let _ = xds_handle.await;
    if let Some(listener) = listener.as_mut() {
        listener.stop().await;
    }
    flusher.stop().await;
    configurator.isolate().await;

    http_result.context("HTTP server failed")
}
