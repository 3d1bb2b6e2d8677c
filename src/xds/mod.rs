//! 代理配置（xDS）
//!
//! - `resources`: 下发给代理的资源结构与类型 URL
//! - `builder`: 按网关类型构建 listener / cluster / route / runtime
//! - `cache`: 按节点组、资源类型缓存带版本的资源集合
//! - `updater`: 订阅内部总线，只重建受影响的 (节点组, 资源类型)
//! - `server`: gRPC 发现服务

pub mod builder;
pub mod cache;
pub mod resources;
pub mod server;
pub mod updater;

/// 发现协议 (tonic 自动生成)
pub mod proto {
    tonic::include_proto!("envoy.service.discovery.v3");
}

pub use builder::{BuildError, BuilderRegistry, NodeGroupView};
pub use cache::{ResourceSet, SnapshotCache};
pub use resources::Resource;
pub use server::{ClusterHash, DiscoveryCallbacks, DiscoveryServer, LoggingCallbacks, NodeHash};
pub use updater::{CacheUpdater, RebuildReport};
