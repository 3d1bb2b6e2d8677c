//! Prometheus 指标导出模块
//!
//! 提供控制面监控指标，包括：
//! - 内部事件总线
//! - 快照复制（发送/应用）
//! - 资源重建
//! - xDS 流与下发
//! - 节点角色

use lazy_static::lazy_static;
use prometheus::{
    self, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry,
};

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ═══════════════════════════════════════════════════════════════════
    // 事件总线指标
    // ═══════════════════════════════════════════════════════════════════

    /// 发布的事件数
    pub static ref BUS_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_events_total", "Events published on the internal bus")
            .namespace("meshgate"),
        &["topic"]
    ).expect("Failed to create BUS_EVENTS_TOTAL metric");

    /// 处理器返回错误的次数
    pub static ref BUS_HANDLER_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_handler_errors_total", "Internal bus handler failures")
            .namespace("meshgate"),
        &["topic", "handler"]
    ).expect("Failed to create BUS_HANDLER_ERRORS metric");

    // ═══════════════════════════════════════════════════════════════════
    // 复制指标
    // ═══════════════════════════════════════════════════════════════════

    /// 已发布快照数
    pub static ref SNAPSHOTS_PUBLISHED: IntCounter = IntCounter::with_opts(
        Opts::new("snapshots_published_total", "Snapshots published to followers")
            .namespace("meshgate")
    ).expect("Failed to create SNAPSHOTS_PUBLISHED metric");

    /// 跳过的发送周期
    pub static ref SNAPSHOTS_SKIPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("snapshots_skipped_total", "Sender ticks with pending changes that did not publish")
            .namespace("meshgate"),
        &["reason"]  // "no_subscribers" or "error"
    ).expect("Failed to create SNAPSHOTS_SKIPPED metric");

    /// 快照大小 (bytes)
    pub static ref SNAPSHOT_SIZE_BYTES: Histogram = Histogram::with_opts(
        HistogramOpts::new("snapshot_size_bytes", "Encoded snapshot size")
            .namespace("meshgate")
            .buckets(prometheus::exponential_buckets(256.0, 4.0, 8).unwrap_or_default())
    ).expect("Failed to create SNAPSHOT_SIZE_BYTES metric");

    /// 从节点应用的快照
    pub static ref SNAPSHOTS_APPLIED: IntCounterVec = IntCounterVec::new(
        Opts::new("snapshots_applied_total", "Snapshots applied on followers")
            .namespace("meshgate"),
        &["result"]
    ).expect("Failed to create SNAPSHOTS_APPLIED metric");

    // ═══════════════════════════════════════════════════════════════════
    // 资源重建指标
    // ═══════════════════════════════════════════════════════════════════

    /// 资源重建次数
    pub static ref RESOURCE_REBUILDS: IntCounterVec = IntCounterVec::new(
        Opts::new("resource_rebuilds_total", "Proxy resource rebuilds")
            .namespace("meshgate"),
        &["resource_type", "result"]
    ).expect("Failed to create RESOURCE_REBUILDS metric");

    /// 单节点组重建耗时 (微秒)
    pub static ref REBUILD_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("rebuild_latency_us", "Per node group rebuild latency in microseconds")
            .namespace("meshgate")
            .buckets(vec![10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 25000.0, 100000.0]),
        &["gateway_type"]
    ).expect("Failed to create REBUILD_LATENCY metric");

    // ═══════════════════════════════════════════════════════════════════
    // xDS 指标
    // ═══════════════════════════════════════════════════════════════════

    /// 当前 xDS 流数量
    pub static ref XDS_ACTIVE_STREAMS: IntGauge = IntGauge::with_opts(
        Opts::new("xds_active_streams", "Open discovery streams")
            .namespace("meshgate")
    ).expect("Failed to create XDS_ACTIVE_STREAMS metric");

    /// 下发的响应数
    pub static ref XDS_RESPONSES: IntCounterVec = IntCounterVec::new(
        Opts::new("xds_responses_total", "Discovery responses sent")
            .namespace("meshgate"),
        &["type"]
    ).expect("Failed to create XDS_RESPONSES metric");

    /// 代理上报的 NACK
    pub static ref XDS_NACKS: IntCounterVec = IntCounterVec::new(
        Opts::new("xds_nacks_total", "Discovery requests carrying error details")
            .namespace("meshgate"),
        &["type"]
    ).expect("Failed to create XDS_NACKS metric");

    // ═══════════════════════════════════════════════════════════════════
    // 集群指标
    // ═══════════════════════════════════════════════════════════════════

    /// 节点角色
    pub static ref NODE_ROLE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("node_role", "Node role (0=phantom, 1=slave, 2=master)")
            .namespace("meshgate"),
        &["pod_id"]
    ).expect("Failed to create NODE_ROLE metric");

    /// 通知通道重连次数
    pub static ref NOTIFY_RECONNECTS: IntCounter = IntCounter::with_opts(
        Opts::new("notify_reconnects_total", "Notification channel reconnects")
            .namespace("meshgate")
    ).expect("Failed to create NOTIFY_RECONNECTS metric");
}

/// 初始化所有指标到 Registry
pub fn init_metrics() {
    // 总线指标
    REGISTRY.register(Box::new(BUS_EVENTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(BUS_HANDLER_ERRORS.clone())).ok();

    // 复制指标
    REGISTRY.register(Box::new(SNAPSHOTS_PUBLISHED.clone())).ok();
    REGISTRY.register(Box::new(SNAPSHOTS_SKIPPED.clone())).ok();
    REGISTRY.register(Box::new(SNAPSHOT_SIZE_BYTES.clone())).ok();
    REGISTRY.register(Box::new(SNAPSHOTS_APPLIED.clone())).ok();

    // 重建指标
    REGISTRY.register(Box::new(RESOURCE_REBUILDS.clone())).ok();
    REGISTRY.register(Box::new(REBUILD_LATENCY.clone())).ok();

    // xDS 指标
    REGISTRY.register(Box::new(XDS_ACTIVE_STREAMS.clone())).ok();
    REGISTRY.register(Box::new(XDS_RESPONSES.clone())).ok();
    REGISTRY.register(Box::new(XDS_NACKS.clone())).ok();

    // 集群指标
    REGISTRY.register(Box::new(NODE_ROLE.clone())).ok();
    REGISTRY.register(Box::new(NOTIFY_RECONNECTS.clone())).ok();

    log::info!("Prometheus metrics initialized");
}

/// 导出指标为 Prometheus 格式
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// 带标签的计时器
pub struct LabeledTimer {
    start: std::time::Instant,
    histogram: HistogramVec,
    labels: Vec<String>,
}

impl LabeledTimer {
    pub fn new(histogram: HistogramVec, labels: Vec<String>) -> Self {
        Self {
            start: std::time::Instant::now(),
            histogram,
            labels,
        }
    }

    pub fn observe(self) {
        let elapsed = self.start.elapsed().as_micros() as f64;
        let label_refs: Vec<&str> = self.labels.iter().map(|s| s.as_str()).collect();
        self.histogram.with_label_values(&label_refs).observe(elapsed);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 便捷宏
// ═══════════════════════════════════════════════════════════════════════

/// 记录资源重建结果
#[macro_export]
macro_rules! record_rebuild {
    ($resource_type:expr, $ok:expr) => {
        $crate::observability::RESOURCE_REBUILDS
            .with_label_values(&[$resource_type, if $ok { "ok" } else { "error" }])
            .inc();
    };
}
