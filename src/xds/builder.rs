//! 资源构建器
//!
//! 按节点组的网关类型分派到不同的 listener / virtual host / cluster 构建逻辑。
//! 出口网关使用独立的 cluster 构建器（逻辑 DNS + TLS 发起）。

use super::resources::{
    ClusterResource, DiscoveryType, LbEndpoint, ListenerResource, RateLimitAction, Resource,
    RouteConfigResource, RouteEntry, RouteMatch, RuntimeResource, SocketAddress, UpstreamTls,
    VirtualHost,
};
use crate::model::{
    EnvoyConfigVersion, GatewayType, NodeGroup, PathMatch, RateLimit, RateLimitUnit, ResourceType,
    Route, Upstream, TABLE_CONFIG_VERSIONS, TABLE_NODE_GROUPS, TABLE_RATE_LIMITS, TABLE_ROUTES,
    TABLE_UPSTREAMS,
};
use crate::storage::{MemDb, StoreError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const RATE_LIMIT_FILTER: &str = "envoy.filters.http.local_ratelimit";
const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
const ORIGINAL_DST: &str = "envoy.filters.listener.original_dst";

/// 构建错误
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Node group {0} has no registered gateway type")]
    UnregisteredGateway(String),

    #[error("Route {route} references unknown upstream {upstream}")]
    DanglingUpstream { route: String, upstream: String },

    #[error("Upstream {0} has no endpoints")]
    EmptyUpstream(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Encode error: {0}")]
    Encode(String),
}

// ============================================================================
// 节点组视图
// ============================================================================

/// 一次只读事务内读出的节点组完整配置
///
/// 版本号与内容来自同一事务，缓存里的版本只会命名它实际构建的内容。
#[derive(Debug, Clone)]
pub struct NodeGroupView {
    pub node_group: NodeGroup,
    pub routes: Vec<Route>,
    pub upstreams: Vec<Upstream>,
    pub rate_limits: Vec<RateLimit>,
    pub versions: HashMap<ResourceType, i64>,
    /// 读取时的存储代数
    pub generation: u64,
}

impl NodeGroupView {
    /// 节点组不存在时返回 `None`
    pub fn load(store: &MemDb, name: &str) -> Result<Option<Self>, BuildError> {
        store.with_rtx(|tx| {
            let node_group = match tx.get(TABLE_NODE_GROUPS, name)?.and_then(|e| e.as_node_group()) {
                Some(ng) => ng.clone(),
                None => return Ok(None),
            };
            let routes = tx
                .list_by_node_group(TABLE_ROUTES, name)?
                .into_iter()
                .filter_map(|e| e.as_route().cloned())
                .collect();
            let upstreams = tx
                .list_by_node_group(TABLE_UPSTREAMS, name)?
                .into_iter()
                .filter_map(|e| e.as_upstream().cloned())
                .collect();
            let rate_limits = tx
                .list_by_node_group(TABLE_RATE_LIMITS, name)?
                .into_iter()
                .filter_map(|e| e.as_rate_limit().cloned())
                .collect();
            let mut versions = HashMap::new();
            for resource_type in ResourceType::ALL {
                let key = EnvoyConfigVersion::key_for(name, resource_type);
                if let Some(v) = tx.get(TABLE_CONFIG_VERSIONS, &key)?.and_then(|e| e.as_config_version()) {
                    versions.insert(resource_type, v.version);
                }
            }
            Ok(Some(Self {
                node_group,
                routes,
                upstreams,
                rate_limits,
                versions,
                generation: tx.generation(),
            }))
        })
    }

    /// 版本表中的版本号；缺失时退回存储代数
    pub fn version_of(&self, resource_type: ResourceType) -> String {
        match self.versions.get(&resource_type) {
            Some(v) => v.to_string(),
            None => format!("g{}", self.generation),
        }
    }

    fn upstream(&self, id: &str) -> Option<&Upstream> {
        self.upstreams.iter().find(|u| u.id == id)
    }

    pub fn route_config_name(&self) -> String {
        format!("{}-routes", self.node_group.name)
    }
}

// ============================================================================
// 构建器注册表
// ============================================================================

/// 节点组 → 网关类型
///
/// 节点组写入/删除时由 `CacheUpdater` 维护，构建时据此选择构建逻辑。
pub struct BuilderRegistry {
    gateways: RwLock<HashMap<String, GatewayType>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self {
            gateways: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_gateway(&self, node_group: &str, gateway_type: GatewayType) {
        let previous = self
            .gateways
            .write()
            .insert(node_group.to_string(), gateway_type);
        if previous != Some(gateway_type) {
            log::debug!("Registered node group {} as {} gateway", node_group, gateway_type);
        }
    }

    pub fn unregister(&self, node_group: &str) -> Option<GatewayType> {
        self.gateways.write().remove(node_group)
    }

    pub fn gateway_of(&self, node_group: &str) -> Option<GatewayType> {
        self.gateways.read().get(node_group).copied()
    }

    pub fn len(&self) -> usize {
        self.gateways.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.read().is_empty()
    }

    fn gateway(&self, view: &NodeGroupView) -> Result<GatewayType, BuildError> {
        self.gateway_of(&view.node_group.name)
            .ok_or_else(|| BuildError::UnregisteredGateway(view.node_group.name.clone()))
    }

    // ------------------------------------------------------------------------
    // listener
    // ------------------------------------------------------------------------

    pub fn build_listeners(&self, view: &NodeGroupView) -> Result<Vec<Resource>, BuildError> {
        let ng = &view.node_group;
        let mut filters = vec![HTTP_CONNECTION_MANAGER.to_string()];
        if !view.rate_limits.is_empty() {
            filters.push(RATE_LIMIT_FILTER.to_string());
        }

        let listener = match self.gateway(view)? {
            GatewayType::Ingress => ListenerResource {
                name: format!("ingress_{}", ng.name),
                address: SocketAddress {
                    address: "0.0.0.0".to_string(),
                    port: ng.listen_port,
                },
                listener_filters: Vec::new(),
                filters,
                route_config_name: view.route_config_name(),
                use_original_dst: false,
            },
            GatewayType::Egress => ListenerResource {
                name: format!("egress_{}", ng.name),
                address: SocketAddress {
                    address: "127.0.0.1".to_string(),
                    port: ng.listen_port,
                },
                listener_filters: vec![TLS_INSPECTOR.to_string()],
                filters,
                route_config_name: view.route_config_name(),
                use_original_dst: false,
            },
            GatewayType::Mesh => ListenerResource {
                name: format!("mesh_{}", ng.name),
                address: SocketAddress {
                    address: "0.0.0.0".to_string(),
                    port: ng.listen_port,
                },
                listener_filters: vec![ORIGINAL_DST.to_string()],
                filters,
                route_config_name: view.route_config_name(),
                use_original_dst: true,
            },
        };
        Ok(vec![Resource::Listener(listener)])
    }

    /// 运行时层：节点组自身的 key/value 加上限流参数
    pub fn build_runtime(&self, view: &NodeGroupView) -> Result<Vec<Resource>, BuildError> {
        let mut layer: BTreeMap<String, String> = view.node_group.runtime.clone();
        for rl in &view.rate_limits {
            layer.insert(
                format!("ratelimit.{}.requests_per_unit", rl.id),
                rl.requests_per_unit.to_string(),
            );
        }
        Ok(vec![Resource::Runtime(RuntimeResource {
            name: format!("{}-runtime", view.node_group.name),
            layer,
        })])
    }

    // ------------------------------------------------------------------------
    // cluster
    // ------------------------------------------------------------------------

    pub fn build_clusters(&self, view: &NodeGroupView) -> Result<Vec<Resource>, BuildError> {
        let gateway = self.gateway(view)?;
        view.upstreams
            .iter()
            .map(|upstream| {
                let cluster = match gateway {
                    GatewayType::Egress => egress_cluster(upstream)?,
                    GatewayType::Ingress | GatewayType::Mesh => standard_cluster(upstream)?,
                };
                Ok(Resource::Cluster(cluster))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // route
    // ------------------------------------------------------------------------

    pub fn build_routes(&self, view: &NodeGroupView) -> Result<Vec<Resource>, BuildError> {
        let ng = &view.node_group;
        let mut entries = Vec::with_capacity(view.routes.len());
        for route in &view.routes {
            let upstream = view.upstream(&route.upstream).ok_or_else(|| {
                BuildError::DanglingUpstream {
                    route: route.id.clone(),
                    upstream: route.upstream.clone(),
                }
            })?;
            entries.push(RouteEntry {
                name: route.id.clone(),
                route_match: match route.path_match {
                    PathMatch::Prefix => RouteMatch::Prefix(route.path.clone()),
                    PathMatch::Exact => RouteMatch::Path(route.path.clone()),
                },
                cluster: upstream.id.clone(),
                timeout_ms: route.timeout_ms,
                prefix_rewrite: route.prefix_rewrite.clone(),
            });
        }

        let rate_limits: Vec<RateLimitAction> = view
            .rate_limits
            .iter()
            .map(|rl| RateLimitAction {
                descriptor: if rl.descriptor.is_empty() {
                    rl.id.clone()
                } else {
                    rl.descriptor.clone()
                },
                requests_per_unit: rl.requests_per_unit,
                unit: unit_name(rl.unit).to_string(),
            })
            .collect();

        let virtual_host = match self.gateway(view)? {
            GatewayType::Ingress => VirtualHost {
                name: format!("{}-ingress", ng.name),
                domains: domains_or_wildcard(&ng.domains),
                routes: entries,
                rate_limits,
            },
            GatewayType::Egress => {
                // 出口网关按上游主机名匹配
                let mut domains: Vec<String> = view
                    .upstreams
                    .iter()
                    .flat_map(|u| u.endpoints.iter().map(|ep| ep.host.clone()))
                    .collect();
                domains.sort();
                domains.dedup();
                VirtualHost {
                    name: format!("{}-egress", ng.name),
                    domains: domains_or_wildcard(&domains),
                    routes: entries,
                    rate_limits,
                }
            }
            GatewayType::Mesh => VirtualHost {
                name: format!("{}-mesh", ng.name),
                domains: vec!["*".to_string()],
                routes: entries,
                rate_limits,
            },
        };

        Ok(vec![Resource::RouteConfiguration(RouteConfigResource {
            name: view.route_config_name(),
            virtual_hosts: vec![virtual_host],
        })])
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn domains_or_wildcard(domains: &[String]) -> Vec<String> {
    if domains.is_empty() {
        vec!["*".to_string()]
    } else {
        domains.to_vec()
    }
}

fn unit_name(unit: RateLimitUnit) -> &'static str {
    match unit {
        RateLimitUnit::Second => "second",
        RateLimitUnit::Minute => "minute",
        RateLimitUnit::Hour => "hour",
    }
}

fn lb_endpoints(upstream: &Upstream) -> Result<Vec<LbEndpoint>, BuildError> {
    if upstream.endpoints.is_empty() {
        return Err(BuildError::EmptyUpstream(upstream.id.clone()));
    }
    Ok(upstream
        .endpoints
        .iter()
        .map(|ep| LbEndpoint {
            address: SocketAddress {
                address: ep.host.clone(),
                port: ep.port,
            },
            weight: ep.weight,
        })
        .collect())
}

/// 入口/网格：全部是 IP 用静态发现，否则严格 DNS
fn standard_cluster(upstream: &Upstream) -> Result<ClusterResource, BuildError> {
    let endpoints = lb_endpoints(upstream)?;
    let all_ips = upstream
        .endpoints
        .iter()
        .all(|ep| ep.host.parse::<IpAddr>().is_ok());
    let tls = upstream.tls.then(|| UpstreamTls {
        sni: upstream.sni.clone().unwrap_or_default(),
    });
    Ok(ClusterResource {
        name: upstream.id.clone(),
        discovery_type: if all_ips {
            DiscoveryType::Static
        } else {
            DiscoveryType::StrictDns
        },
        connect_timeout_ms: upstream.connect_timeout_ms,
        lb_policy: upstream.lb_policy,
        endpoints,
        tls,
    })
}

/// 出口：逻辑 DNS，开启 TLS 时 SNI 默认取第一个端点主机名
fn egress_cluster(upstream: &Upstream) -> Result<ClusterResource, BuildError> {
    let endpoints = lb_endpoints(upstream)?;
    let tls = if upstream.tls {
        let sni = upstream
            .sni
            .clone()
            .or_else(|| upstream.endpoints.first().map(|ep| ep.host.clone()))
            .unwrap_or_default();
        Some(UpstreamTls { sni })
    } else {
        None
    };
    Ok(ClusterResource {
        name: upstream.id.clone(),
        discovery_type: DiscoveryType::LogicalDns,
        connect_timeout_ms: upstream.connect_timeout_ms,
        lb_policy: upstream.lb_policy,
        endpoints,
        tls,
    })
}
