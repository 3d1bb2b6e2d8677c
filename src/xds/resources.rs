//! 下发给代理的资源
//!
//! 资源以 JSON 编码后放入 `Any.value`，`type_url` 与 Envoy v3 类型保持一致。

use super::builder::BuildError;
use super::proto::Any;
use crate::model::LbPolicy;
use serde::Serialize;
use std::collections::BTreeMap;

pub const LISTENER_TYPE: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const CLUSTER_TYPE: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const ENDPOINT_TYPE: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const SECRET_TYPE: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
pub const RUNTIME_TYPE: &str = "type.googleapis.com/envoy.service.runtime.v3.Runtime";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocketAddress {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerResource {
    pub name: String,
    pub address: SocketAddress,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listener_filters: Vec<String>,
    pub filters: Vec<String>,
    /// HTTP 连接管理器引用的 RDS 名称
    pub route_config_name: String,
    pub use_original_dst: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LbEndpoint {
    pub address: SocketAddress,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamTls {
    pub sni: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    Static,
    StrictDns,
    LogicalDns,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterResource {
    pub name: String,
    pub discovery_type: DiscoveryType,
    pub connect_timeout_ms: u64,
    pub lb_policy: LbPolicy,
    pub endpoints: Vec<LbEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<UpstreamTls>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMatch {
    Prefix(String),
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteEntry {
    pub name: String,
    #[serde(rename = "match")]
    pub route_match: RouteMatch,
    pub cluster: String,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_rewrite: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitAction {
    pub descriptor: String,
    pub requests_per_unit: u32,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<RouteEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimitAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteConfigResource {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeResource {
    pub name: String,
    pub layer: BTreeMap<String, String>,
}

/// 下发资源
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Resource {
    Listener(ListenerResource),
    Cluster(ClusterResource),
    RouteConfiguration(RouteConfigResource),
    Runtime(RuntimeResource),
}

impl Resource {
    pub fn name(&self) -> &str {
        match self {
            Resource::Listener(r) => &r.name,
            Resource::Cluster(r) => &r.name,
            Resource::RouteConfiguration(r) => &r.name,
            Resource::Runtime(r) => &r.name,
        }
    }

    pub fn type_url(&self) -> &'static str {
        match self {
            Resource::Listener(_) => LISTENER_TYPE,
            Resource::Cluster(_) => CLUSTER_TYPE,
            Resource::RouteConfiguration(_) => ROUTE_TYPE,
            Resource::Runtime(_) => RUNTIME_TYPE,
        }
    }

    pub fn to_any(&self) -> Result<Any, BuildError> {
        let value = serde_json::to_vec(self).map_err(|e| BuildError::Encode(e.to_string()))?;
        Ok(Any {
            type_url: self.type_url().to_string(),
            value,
        })
    }
}
