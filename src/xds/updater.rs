//! 资源缓存更新器
//!
//! 订阅总线上的四类事件，算出受影响的 (节点组, 资源类型) 集合，
//! 只重新读取存储并重建这些资源。单个节点组失败只记日志，不影响其它节点组。
//!
//! 受影响集合的确定：
//! - 变更事件：优先看版本表的变更行；没有版本行时按变更所在的表推导
//! - 全量重载：指定的节点组（为空则全部）的全部资源类型
//! - 部分重载：精确的 (节点组, 资源类型)
//!
//! 重建串行执行，每一轮都读取当时的存储内容，后写入缓存的总是更新的内容。

use super::builder::{BuildError, BuilderRegistry, NodeGroupView};
use super::cache::SnapshotCache;
use super::proto::Any;
use super::resources::{Resource, CLUSTER_TYPE, LISTENER_TYPE, ROUTE_TYPE, RUNTIME_TYPE};
use crate::events::{BusError, ChangeMap, Event, EventHandler, PartialReloadEvent, ReloadEvent};
use crate::model::{
    EnvoyConfigVersion, ResourceType, TABLE_CONFIG_VERSIONS, TABLE_NODE_GROUPS, TABLE_RATE_LIMITS,
    TABLE_ROUTES, TABLE_UPSTREAMS,
};
use crate::observability::{LabeledTimer, REBUILD_LATENCY};
use crate::record_rebuild;
use crate::replication::{ConfigInitializer, ReplicationError};
use crate::storage::{MemDb, StoreError};
use crate::utils::backoff::{ExponentialBackoff, IntervalProvider};
use crate::utils::config::RetryConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// 节点组 → 需要重建的资源类型
pub type Targets = BTreeMap<String, BTreeSet<ResourceType>>;

/// 一轮重建的结果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RebuildReport {
    pub rebuilt: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl RebuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 资源缓存更新器
pub struct CacheUpdater {
    store: Arc<MemDb>,
    registry: Arc<BuilderRegistry>,
    cache: Arc<SnapshotCache>,
    retry: RetryConfig,
    rebuild_lock: Mutex<()>,
}

impl CacheUpdater {
    pub fn new(
        store: Arc<MemDb>,
        registry: Arc<BuilderRegistry>,
        cache: Arc<SnapshotCache>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            retry,
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    // ========================================================================
    // 受影响集合
    // ========================================================================

    /// 返回 (需要重建的目标, 被删除的节点组)
    pub fn targets_for_changes(&self, changes: &ChangeMap) -> (Targets, BTreeSet<String>) {
        let mut targets = Targets::new();
        let mut removed = BTreeSet::new();

        for change in changes.get(TABLE_NODE_GROUPS).into_iter().flatten() {
            match change.after.as_ref().and_then(|e| e.as_node_group()) {
                Some(ng) => self.registry.register_gateway(&ng.name, ng.gateway_type),
                None => {
                    if let Some(ng) = change.before.as_ref().and_then(|e| e.as_node_group()) {
                        removed.insert(ng.name.clone());
                    }
                }
            }
        }

        let version_rows: Vec<&EnvoyConfigVersion> = changes
            .get(TABLE_CONFIG_VERSIONS)
            .into_iter()
            .flatten()
            .filter_map(|c| c.after.as_ref().and_then(|e| e.as_config_version()))
            .collect();

        if !version_rows.is_empty() {
            for v in version_rows {
                targets
                    .entry(v.node_group.clone())
                    .or_default()
                    .insert(v.resource_type);
            }
        } else {
            for (table, table_changes) in changes {
                let types = resource_types_for_table(table);
                if types.is_empty() {
                    continue;
                }
                for change in table_changes {
                    for ng in change.node_groups() {
                        targets.entry(ng).or_default().extend(types.iter().copied());
                    }
                }
            }
        }

        for ng in &removed {
            targets.remove(ng);
        }
        (targets, removed)
    }

    pub fn targets_for_reload(&self, event: &ReloadEvent) -> Result<Targets, StoreError> {
        let names = if event.is_full() {
            self.stored_node_groups()?
        } else {
            event.node_groups.clone()
        };
        Ok(names
            .into_iter()
            .map(|ng| (ng, ResourceType::ALL.iter().copied().collect()))
            .collect())
    }

    pub fn targets_for_partial_reload(&self, event: &PartialReloadEvent) -> Targets {
        let mut targets = Targets::new();
        for t in &event.targets {
            targets
                .entry(t.node_group.clone())
                .or_default()
                .insert(t.resource_type);
        }
        targets
    }

    fn stored_node_groups(&self) -> Result<Vec<String>, StoreError> {
        self.store.with_rtx(|tx| {
            Ok(tx
                .list(TABLE_NODE_GROUPS)?
                .into_iter()
                .filter_map(|e| e.as_node_group().map(|ng| ng.name.clone()))
                .collect())
        })
    }

    // ========================================================================
    // 重建
    // ========================================================================

    /// 重建目标集合并清理被删除的节点组
    ///
    /// 被删除的节点组按存储当前内容处理：事件之后又被重新创建的节点组会被重建而不是清空。
    pub fn apply(&self, mut targets: Targets, removed: BTreeSet<String>) -> RebuildReport {
        let _guard = self.rebuild_lock.lock();
        let mut report = RebuildReport::default();

        for ng in removed {
            targets.insert(ng, ResourceType::ALL.iter().copied().collect());
        }

        for (ng, types) in targets {
            match self.rebuild_node_group(&ng, &types) {
                Ok(true) => report.rebuilt.push(ng),
                Ok(false) => {
                    self.remove_node_group(&ng);
                    report.removed.push(ng);
                }
                Err(e) => {
                    log::error!("Failed to rebuild resources for node group {}: {}", ng, e);
                    report.failed.push((ng, e.to_string()));
                }
            }
        }
        report
    }

    /// 按存储内容全量重建；缓存中已不存在于存储的节点组被清空
    ///
    /// 已清空的节点组不在 `node_groups()` 中，不会被再次清空。
    pub fn rebuild_all(&self) -> RebuildReport {
        let stored = match self.stored_node_groups() {
            Ok(names) => names,
            Err(e) => {
                return RebuildReport {
                    failed: vec![("*".to_string(), e.to_string())],
                    ..Default::default()
                }
            }
        };

        let removed: BTreeSet<String> = self
            .cache
            .node_groups()
            .into_iter()
            .filter(|ng| !stored.contains(ng))
            .collect();
        let targets = stored
            .into_iter()
            .map(|ng| (ng, ResourceType::ALL.iter().copied().collect()))
            .collect();
        self.apply(targets, removed)
    }

    /// 节点组不存在时返回 `Ok(false)`
    ///
    /// 先构建全部请求的类型再写入缓存，失败时缓存保持原样。
    fn rebuild_node_group(
        &self,
        name: &str,
        types: &BTreeSet<ResourceType>,
    ) -> Result<bool, BuildError> {
        let view = match NodeGroupView::load(&self.store, name)? {
            Some(view) => view,
            None => return Ok(false),
        };
        let gateway_type = view.node_group.gateway_type;
        self.registry.register_gateway(name, gateway_type);

        let timer = LabeledTimer::new(REBUILD_LATENCY.clone(), vec![gateway_type.to_string()]);
        let mut built: Vec<(&'static str, String, Vec<Any>)> = Vec::new();
        for &resource_type in types {
            let version = view.version_of(resource_type);
            let result = self.build_type(&view, resource_type);
            record_rebuild!(resource_type.as_str(), result.is_ok());
            for (type_url, resources) in result? {
                built.push((type_url, version.clone(), resources));
            }
        }

        for (type_url, version, resources) in built {
            log::debug!(
                "Node group {} {} -> version {} ({} resources)",
                name,
                type_url,
                version,
                resources.len()
            );
            self.cache.set_resources(name, type_url, version, resources);
        }
        timer.observe();
        Ok(true)
    }

    fn build_type(
        &self,
        view: &NodeGroupView,
        resource_type: ResourceType,
    ) -> Result<Vec<(&'static str, Vec<Any>)>, BuildError> {
        match resource_type {
            ResourceType::Listener => Ok(vec![
                (LISTENER_TYPE, encode(&self.registry.build_listeners(view)?)?),
                (RUNTIME_TYPE, encode(&self.registry.build_runtime(view)?)?),
            ]),
            ResourceType::Cluster => Ok(vec![(
                CLUSTER_TYPE,
                encode(&self.registry.build_clusters(view)?)?,
            )]),
            ResourceType::RouteConfiguration => Ok(vec![(
                ROUTE_TYPE,
                encode(&self.registry.build_routes(view)?)?,
            )]),
        }
    }

    fn remove_node_group(&self, name: &str) {
        self.registry.unregister(name);
        self.cache
            .clear(name, format!("g{}", self.store.generation()));
        log::info!("Node group {} removed, cleared its resources", name);
    }

    fn handle_event(&self, event: &Event) -> Result<RebuildReport, StoreError> {
        let (targets, removed) = match event {
            Event::Changes(e) => self.targets_for_changes(&e.changes),
            Event::MultipleChanges(e) => self.targets_for_changes(&e.changes),
            Event::Reload(e) => (self.targets_for_reload(e)?, BTreeSet::new()),
            Event::PartialReload(e) => (self.targets_for_partial_reload(e), BTreeSet::new()),
        };
        Ok(self.apply(targets, removed))
    }
}

fn encode(resources: &[Resource]) -> Result<Vec<Any>, BuildError> {
    resources.iter().map(Resource::to_any).collect()
}

fn resource_types_for_table(table: &str) -> &'static [ResourceType] {
    match table {
        TABLE_NODE_GROUPS => &ResourceType::ALL,
        TABLE_ROUTES => &[ResourceType::RouteConfiguration],
        TABLE_UPSTREAMS => &[ResourceType::Cluster, ResourceType::RouteConfiguration],
        TABLE_RATE_LIMITS => &[ResourceType::Listener, ResourceType::RouteConfiguration],
        _ => &[],
    }
}

impl EventHandler for CacheUpdater {
    fn name(&self) -> &str {
        "cache-updater"
    }

    fn handle(&self, event: &Event) -> Result<(), BusError> {
        match self.handle_event(event) {
            Ok(report) => {
                if !report.is_success() {
                    log::warn!(
                        "{} event: {} node groups failed to rebuild: {:?}",
                        event.topic().as_str(),
                        report.failed.len(),
                        report.failed
                    );
                }
            }
            Err(e) => {
                log::error!("Failed to resolve targets for {} event: {}", event.topic().as_str(), e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigInitializer for CacheUpdater {
    async fn init_config_with_retry(&self) -> Result<(), ReplicationError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::from_config(&self.retry);
        let mut last = RebuildReport::default();

        for attempt in 1..=attempts {
            last = self.rebuild_all();
            if last.is_success() {
                log::info!(
                    "Proxy configuration initialized: {} node groups rebuilt, {} removed",
                    last.rebuilt.len(),
                    last.removed.len()
                );
                return Ok(());
            }
            log::warn!(
                "Config initialization attempt {}/{} failed for {:?}",
                attempt,
                attempts,
                last.failed
            );
            if attempt < attempts {
                tokio::time::sleep(backoff.next_interval()).await;
            }
        }

        Err(ReplicationError::Init(format!(
            "{} node groups still failing after {} attempts",
            last.failed.len(),
            attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeEvent, MultipleChangeEvent};
    use crate::model::{
        Endpoint, Entity, GatewayType, LbPolicy, NodeGroup, PathMatch, RateLimit, RateLimitUnit,
        Route, Upstream,
    };
    use crate::storage::Change;

    fn node_group(name: &str) -> Entity {
        Entity::NodeGroup(NodeGroup {
            name: name.to_string(),
            gateway_type: GatewayType::Ingress,
            listen_port: 10000,
            domains: vec![],
            runtime: BTreeMap::new(),
        })
    }

    fn upstream(id: &str, ng: &str) -> Entity {
        Entity::Upstream(Upstream {
            id: id.to_string(),
            node_group: ng.to_string(),
            endpoints: vec![Endpoint {
                host: "10.0.0.1".to_string(),
                port: 8080,
                weight: 1,
            }],
            lb_policy: LbPolicy::RoundRobin,
            connect_timeout_ms: 500,
            tls: false,
            sni: None,
        })
    }

    fn route(id: &str, ng: &str, upstream: &str) -> Entity {
        Entity::Route(Route {
            id: id.to_string(),
            node_group: ng.to_string(),
            path: "/".to_string(),
            path_match: PathMatch::Prefix,
            upstream: upstream.to_string(),
            timeout_ms: 1000,
            prefix_rewrite: None,
        })
    }

    fn version(ng: &str, rt: ResourceType, v: i64) -> Entity {
        Entity::ConfigVersion(EnvoyConfigVersion::new(ng, rt, v))
    }

    fn updater(store: Arc<MemDb>) -> CacheUpdater {
        CacheUpdater::new(
            store,
            Arc::new(BuilderRegistry::new()),
            Arc::new(SnapshotCache::new()),
            RetryConfig {
                initial_ms: 1,
                max_ms: 2,
                max_attempts: 2,
            },
        )
    }

    fn seed(store: &MemDb, entities: Vec<Entity>) -> Vec<Change> {
        store
            .with_wtx(|tx| -> Result<(), StoreError> {
                for e in entities {
                    tx.upsert(e)?;
                }
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_version_rows_select_targets() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        let changes = seed(
            &store,
            vec![
                node_group("gw1"),
                upstream("u1", "gw1"),
                version("gw1", ResourceType::Cluster, 5),
            ],
        );

        let (targets, removed) =
            updater.targets_for_changes(&crate::events::changes_to_map(changes));
        assert!(removed.is_empty());
        assert_eq!(
            targets.get("gw1").unwrap(),
            &BTreeSet::from([ResourceType::Cluster])
        );
        assert_eq!(updater.registry.gateway_of("gw1"), Some(GatewayType::Ingress));
    }

    #[test]
    fn test_table_fallback_without_version_rows() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        let changes = seed(&store, vec![route("r1", "gw1", "u1")]);

        let (targets, _) = updater.targets_for_changes(&crate::events::changes_to_map(changes));
        assert_eq!(
            targets.get("gw1").unwrap(),
            &BTreeSet::from([ResourceType::RouteConfiguration])
        );
    }

    #[test]
    fn test_change_event_rebuilds_cache_with_row_version() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        let changes = seed(
            &store,
            vec![
                node_group("gw1"),
                upstream("u1", "gw1"),
                version("gw1", ResourceType::Cluster, 42),
            ],
        );

        updater
            .handle(&Event::Changes(ChangeEvent::by_node_group("gw1", changes)))
            .unwrap();

        let set = updater.cache().get("gw1", CLUSTER_TYPE).unwrap();
        assert_eq!(set.version, "42");
        assert_eq!(set.resources.len(), 1);
        assert!(updater.cache().get("gw1", LISTENER_TYPE).is_none());
    }

    #[test]
    fn test_failing_node_group_does_not_block_others() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(
            &store,
            vec![
                node_group("good"),
                node_group("bad"),
                upstream("u1", "good"),
                route("r1", "good", "u1"),
                route("r2", "bad", "missing"),
            ],
        );

        let report = updater.rebuild_all();
        assert_eq!(report.rebuilt, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert!(updater.cache().get("good", ROUTE_TYPE).is_some());
        assert!(updater.cache().get("bad", ROUTE_TYPE).is_none());
    }

    #[test]
    fn test_deleted_node_group_is_cleared() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(&store, vec![node_group("gw1"), upstream("u1", "gw1")]);
        assert!(updater.rebuild_all().is_success());
        let _proxy = updater.cache().watch("gw1");

        let changes = store
            .with_wtx(|tx| -> Result<(), StoreError> {
                tx.delete_by_node_group(TABLE_UPSTREAMS, "gw1")?;
                tx.delete(TABLE_NODE_GROUPS, "gw1")?;
                Ok(())
            })
            .unwrap();
        updater
            .handle(&Event::Changes(ChangeEvent::by_node_group("gw1", changes)))
            .unwrap();

        assert!(updater.cache().get("gw1", CLUSTER_TYPE).unwrap().resources.is_empty());
        assert_eq!(updater.registry.gateway_of("gw1"), None);
    }

    #[test]
    fn test_unwatched_deleted_node_group_is_dropped() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(&store, vec![node_group("gw1"), upstream("u1", "gw1")]);
        assert!(updater.rebuild_all().is_success());

        let changes = store
            .with_wtx(|tx| -> Result<(), StoreError> {
                tx.delete_by_node_group(TABLE_UPSTREAMS, "gw1")?;
                tx.delete(TABLE_NODE_GROUPS, "gw1")?;
                Ok(())
            })
            .unwrap();
        updater
            .handle(&Event::Changes(ChangeEvent::by_node_group("gw1", changes)))
            .unwrap();

        assert!(updater.cache().get("gw1", CLUSTER_TYPE).is_none());
        assert_eq!(updater.cache().entry_counts(), (0, 0));
    }

    #[test]
    fn test_rebuild_all_leaves_cleared_node_group_alone() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(&store, vec![node_group("gw1"), node_group("gw2")]);
        assert!(updater.rebuild_all().is_success());
        let mut proxy = updater.cache().watch("gw1");

        store
            .with_wtx(|tx| -> Result<(), StoreError> {
                tx.delete(TABLE_NODE_GROUPS, "gw1")?;
                Ok(())
            })
            .unwrap();
        let report = updater.rebuild_all();
        assert_eq!(report.removed, vec!["gw1".to_string()]);
        let cleared = updater.cache().version("gw1", LISTENER_TYPE).unwrap();
        proxy.borrow_and_update();

        // 再次全量重建（如快照恢复后）不会给已删除的节点组新版本
        let report = updater.rebuild_all();
        assert!(report.removed.is_empty());
        assert_eq!(updater.cache().version("gw1", LISTENER_TYPE).unwrap(), cleared);
        assert!(!proxy.has_changed().unwrap());
    }

    #[test]
    fn test_removal_of_recreated_node_group_rebuilds() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(&store, vec![node_group("gw1")]);
        let deleted = store
            .with_wtx(|tx| -> Result<(), StoreError> {
                tx.delete(TABLE_NODE_GROUPS, "gw1")?;
                Ok(())
            })
            .unwrap();
        let recreated = seed(&store, vec![node_group("gw1")]);

        // 重新创建的事件先被处理，删除事件随后到达
        updater
            .handle(&Event::Changes(ChangeEvent::by_node_group("gw1", recreated)))
            .unwrap();
        updater
            .handle(&Event::Changes(ChangeEvent::by_node_group("gw1", deleted)))
            .unwrap();

        assert_eq!(updater.cache().node_groups(), vec!["gw1".to_string()]);
        assert_eq!(updater.registry.gateway_of("gw1"), Some(GatewayType::Ingress));
    }

    #[test]
    fn test_versions_come_from_view_transaction() {
        let store = Arc::new(MemDb::new());
        seed(
            &store,
            vec![node_group("gw1"), version("gw1", ResourceType::Cluster, 9)],
        );

        let view = NodeGroupView::load(&store, "gw1").unwrap().unwrap();
        seed(&store, vec![version("gw1", ResourceType::Cluster, 10)]);

        assert_eq!(view.version_of(ResourceType::Cluster), "9");
        assert_eq!(view.version_of(ResourceType::Listener), format!("g{}", view.generation));
        assert_eq!(view.generation, 1);
    }

    #[test]
    fn test_rate_limit_spans_node_groups() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(&store, vec![node_group("a"), node_group("b")]);
        let changes = seed(
            &store,
            vec![Entity::RateLimit(RateLimit {
                id: "rl".to_string(),
                node_groups: vec!["a".to_string(), "b".to_string()],
                requests_per_unit: 10,
                unit: RateLimitUnit::Second,
                descriptor: String::new(),
            })],
        );

        updater
            .handle(&Event::MultipleChanges(MultipleChangeEvent::new(changes)))
            .unwrap();
        assert!(updater.cache().get("a", RUNTIME_TYPE).is_some());
        assert!(updater.cache().get("b", LISTENER_TYPE).is_some());
    }

    #[test]
    fn test_partial_reload_is_exact() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(&store, vec![node_group("gw1")]);

        updater
            .handle(&Event::PartialReload(PartialReloadEvent::new(vec![
                EnvoyConfigVersion::new("gw1", ResourceType::RouteConfiguration, 1),
            ])))
            .unwrap();
        assert!(updater.cache().get("gw1", ROUTE_TYPE).is_some());
        assert!(updater.cache().get("gw1", CLUSTER_TYPE).is_none());
    }

    #[tokio::test]
    async fn test_init_with_retry_reports_persistent_failure() {
        let store = Arc::new(MemDb::new());
        let updater = updater(store.clone());
        seed(&store, vec![node_group("bad"), route("r", "bad", "missing")]);

        let err = updater.init_config_with_retry().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Init(_)));

        seed(&store, vec![upstream("missing", "bad")]);
        updater.init_config_with_retry().await.unwrap();
        assert!(updater.cache().get("bad", ROUTE_TYPE).is_some());
    }
}
