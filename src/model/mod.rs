//! 配置数据模型
//!
//! 控制面在事务存储中保存的全部实体：
//! - 节点组 (NodeGroup) 及其网关类型
//! - 路由 (Route) / 上游 (Upstream) / 限流 (RateLimit)
//! - Envoy 配置版本 (EnvoyConfigVersion)

pub mod entity;

pub use entity::{
    Endpoint, Entity, EnvoyConfigVersion, GatewayType, LbPolicy, NodeGroup, PathMatch, RateLimit,
    RateLimitUnit, ResourceType, Route, Upstream, ALL_TABLES, TABLE_CONFIG_VERSIONS,
    TABLE_NODE_GROUPS, TABLE_RATE_LIMITS, TABLE_ROUTES, TABLE_UPSTREAMS,
};
