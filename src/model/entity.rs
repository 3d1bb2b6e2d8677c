//! 配置实体定义

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// 表名
// ============================================================================

pub const TABLE_NODE_GROUPS: &str = "node_groups";
pub const TABLE_ROUTES: &str = "routes";
pub const TABLE_UPSTREAMS: &str = "upstreams";
pub const TABLE_RATE_LIMITS: &str = "rate_limits";
pub const TABLE_CONFIG_VERSIONS: &str = "envoy_config_versions";

/// 存储中的全部表（schema）
pub const ALL_TABLES: [&str; 5] = [
    TABLE_NODE_GROUPS,
    TABLE_ROUTES,
    TABLE_UPSTREAMS,
    TABLE_RATE_LIMITS,
    TABLE_CONFIG_VERSIONS,
];

// ============================================================================
// 枚举类型
// ============================================================================

/// 网关类型（决定使用哪一组 listener/virtual host/cluster 构建器）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    /// 入口网关
    Ingress,
    /// 出口网关
    Egress,
    /// 服务网格 sidecar
    Mesh,
}

impl GatewayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayType::Ingress => "ingress",
            GatewayType::Egress => "egress",
            GatewayType::Mesh => "mesh",
        }
    }
}

impl fmt::Display for GatewayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 带版本号的 Envoy 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Listener,
    Cluster,
    RouteConfiguration,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [
        ResourceType::Listener,
        ResourceType::Cluster,
        ResourceType::RouteConfiguration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Listener => "listener",
            ResourceType::Cluster => "cluster",
            ResourceType::RouteConfiguration => "route_configuration",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listener" => Ok(ResourceType::Listener),
            "cluster" => Ok(ResourceType::Cluster),
            "route_configuration" => Ok(ResourceType::RouteConfiguration),
            other => Err(format!("unknown resource type: {}", other)),
        }
    }
}

/// 路径匹配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    #[default]
    Prefix,
    Exact,
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
}

/// 限流时间单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitUnit {
    Second,
    Minute,
    Hour,
}

// ============================================================================
// 实体
// ============================================================================

/// 节点组：共享同一份配置的一组代理实例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    pub gateway_type: GatewayType,
    pub listen_port: u16,
    #[serde(default)]
    pub domains: Vec<String>,
    /// 运行时层 key/value
    #[serde(default)]
    pub runtime: BTreeMap<String, String>,
}

/// 路由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub node_group: String,
    pub path: String,
    #[serde(default)]
    pub path_match: PathMatch,
    /// 目标上游 ID
    pub upstream: String,
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub prefix_rewrite: Option<String>,
}

fn default_route_timeout_ms() -> u64 {
    15_000
}

/// 上游端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// 上游服务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub id: String,
    pub node_group: String,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub lb_policy: LbPolicy,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni: Option<String>,
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

/// 限流配置（可被多个节点组共享）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub id: String,
    pub node_groups: Vec<String>,
    pub requests_per_unit: u32,
    pub unit: RateLimitUnit,
    #[serde(default)]
    pub descriptor: String,
}

/// Envoy 配置版本：每个 (节点组, 资源类型) 一行
///
/// 版本号只增不减，递增是资源需要重建并重新下发的唯一信号。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvoyConfigVersion {
    pub node_group: String,
    pub resource_type: ResourceType,
    pub version: i64,
}

impl EnvoyConfigVersion {
    pub fn new(node_group: impl Into<String>, resource_type: ResourceType, version: i64) -> Self {
        Self {
            node_group: node_group.into(),
            resource_type,
            version,
        }
    }

    /// 主键: `<node_group>/<resource_type>`
    pub fn key_for(node_group: &str, resource_type: ResourceType) -> String {
        format!("{}/{}", node_group, resource_type.as_str())
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.node_group, self.resource_type)
    }

    /// 计算下一个版本号：基于时间，且严格大于上一个版本
    ///
    /// 上一个版本已到 `i64::MAX` 时回到当前时间，仍与上一个版本不同。
    pub fn next_version(previous: Option<i64>) -> i64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_micros() * 1_000);
        match previous {
            Some(prev) if prev >= now => prev.checked_add(1).unwrap_or(now),
            _ => now,
        }
    }
}

/// 存储中的实体（封闭的和类型，按表区分）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Entity {
    NodeGroup(NodeGroup),
    Route(Route),
    Upstream(Upstream),
    RateLimit(RateLimit),
    ConfigVersion(EnvoyConfigVersion),
}

impl Entity {
    /// 实体所属的表
    pub fn table(&self) -> &'static str {
        match self {
            Entity::NodeGroup(_) => TABLE_NODE_GROUPS,
            Entity::Route(_) => TABLE_ROUTES,
            Entity::Upstream(_) => TABLE_UPSTREAMS,
            Entity::RateLimit(_) => TABLE_RATE_LIMITS,
            Entity::ConfigVersion(_) => TABLE_CONFIG_VERSIONS,
        }
    }

    /// 主键
    pub fn primary_key(&self) -> String {
        match self {
            Entity::NodeGroup(ng) => ng.name.clone(),
            Entity::Route(r) => r.id.clone(),
            Entity::Upstream(u) => u.id.clone(),
            Entity::RateLimit(rl) => rl.id.clone(),
            Entity::ConfigVersion(v) => v.key(),
        }
    }

    /// 节点组索引值（限流配置可属于多个节点组）
    pub fn node_groups(&self) -> Vec<&str> {
        match self {
            Entity::NodeGroup(ng) => vec![ng.name.as_str()],
            Entity::Route(r) => vec![r.node_group.as_str()],
            Entity::Upstream(u) => vec![u.node_group.as_str()],
            Entity::RateLimit(rl) => rl.node_groups.iter().map(|s| s.as_str()).collect(),
            Entity::ConfigVersion(v) => vec![v.node_group.as_str()],
        }
    }

    pub fn as_node_group(&self) -> Option<&NodeGroup> {
        match self {
            Entity::NodeGroup(ng) => Some(ng),
            _ => None,
        }
    }

    pub fn as_route(&self) -> Option<&Route> {
        match self {
            Entity::Route(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_upstream(&self) -> Option<&Upstream> {
        match self {
            Entity::Upstream(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_rate_limit(&self) -> Option<&RateLimit> {
        match self {
            Entity::RateLimit(rl) => Some(rl),
            _ => None,
        }
    }

    pub fn as_config_version(&self) -> Option<&EnvoyConfigVersion> {
        match self {
            Entity::ConfigVersion(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_table_and_key() {
        let route = Entity::Route(Route {
            id: "r1".to_string(),
            node_group: "gw1".to_string(),
            path: "/api".to_string(),
            path_match: PathMatch::Prefix,
            upstream: "u1".to_string(),
            timeout_ms: 1000,
            prefix_rewrite: None,
        });
        assert_eq!(route.table(), TABLE_ROUTES);
        assert_eq!(route.primary_key(), "r1");
        assert_eq!(route.node_groups(), vec!["gw1"]);

        let version = Entity::ConfigVersion(EnvoyConfigVersion::new("gw1", ResourceType::Cluster, 7));
        assert_eq!(version.primary_key(), "gw1/cluster");
    }

    #[test]
    fn test_rate_limit_spans_node_groups() {
        let rl = Entity::RateLimit(RateLimit {
            id: "rl".to_string(),
            node_groups: vec!["a".to_string(), "b".to_string()],
            requests_per_unit: 100,
            unit: RateLimitUnit::Second,
            descriptor: String::new(),
        });
        assert_eq!(rl.node_groups(), vec!["a", "b"]);
    }

    #[test]
    fn test_next_version_is_monotonic() {
        let far_future = i64::MAX - 10;
        assert_eq!(EnvoyConfigVersion::next_version(Some(far_future)), far_future + 1);

        let v1 = EnvoyConfigVersion::next_version(None);
        let v2 = EnvoyConfigVersion::next_version(Some(v1));
        assert!(v2 > v1);
    }

    #[test]
    fn test_next_version_at_max_does_not_overflow() {
        let next = EnvoyConfigVersion::next_version(Some(i64::MAX));
        assert_ne!(next, i64::MAX);
        assert!(next > 0);
        assert!(EnvoyConfigVersion::next_version(Some(next)) > next);
    }

    #[test]
    fn test_entity_serde_tagged() {
        let ng = Entity::NodeGroup(NodeGroup {
            name: "gw1".to_string(),
            gateway_type: GatewayType::Ingress,
            listen_port: 8080,
            domains: vec![],
            runtime: BTreeMap::new(),
        });
        let json = serde_json::to_string(&ng).unwrap();
        assert!(json.contains("\"kind\":\"node_group\""));
        assert!(json.contains("\"gateway_type\":\"ingress\""));
        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ng);
    }

    #[test]
    fn test_resource_type_from_str() {
        assert_eq!("cluster".parse::<ResourceType>().unwrap(), ResourceType::Cluster);
        assert!("secret".parse::<ResourceType>().is_err());
    }
}
