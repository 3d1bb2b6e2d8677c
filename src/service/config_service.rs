//! 配置写入服务
//!
//! 所有配置修改的唯一入口：
//! 1. 在一个写事务内修改实体，并递增受影响 (节点组, 资源类型) 的版本行
//! 2. 提交后把变更包装成事件发布到总线
//!
//! 只有主节点可以写入；从节点的存储只通过快照 restore 修改。
//! 提交成功但发布失败时返回 `PublishAfterCommit`，存储中的修改不会回滚。

use crate::events::{ChangeEvent, Event, EventBus, MultipleChangeEvent, PartialReloadEvent, ReloadEvent};
use crate::model::{
    Entity, EnvoyConfigVersion, NodeGroup, RateLimit, ResourceType, Route, Upstream,
    TABLE_CONFIG_VERSIONS, TABLE_NODE_GROUPS, TABLE_RATE_LIMITS, TABLE_ROUTES, TABLE_UPSTREAMS,
};
use crate::replication::{Role, RoleView};
use crate::storage::{Change, MemDb, StoreError, WriteTxn};
use crate::{ControlPlaneError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// 限流配置影响的资源类型
const RATE_LIMIT_TYPES: [ResourceType; 2] =
    [ResourceType::Listener, ResourceType::RouteConfiguration];

/// 配置写入服务
pub struct ConfigService {
    store: Arc<MemDb>,
    bus: Arc<EventBus>,
    role: Arc<dyn RoleView>,
}

impl ConfigService {
    pub fn new(store: Arc<MemDb>, bus: Arc<EventBus>, role: Arc<dyn RoleView>) -> Self {
        Self { store, bus, role }
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.role.current_role() {
            Some(Role::Master) => Ok(()),
            Some(role) => Err(ControlPlaneError::ReadOnly(role.to_string())),
            None => Err(ControlPlaneError::ReadOnly("no role".to_string())),
        }
    }

    fn publish(&self, event: Event) -> Result<()> {
        self.bus
            .publish(event)
            .map_err(ControlPlaneError::PublishAfterCommit)
    }

    // ========================================================================
    // 节点组
    // ========================================================================

    pub fn upsert_node_group(&self, node_group: NodeGroup) -> Result<Vec<Change>> {
        self.ensure_writable()?;
        if node_group.name.is_empty() || node_group.name.contains('/') {
            return Err(ControlPlaneError::Invalid(format!(
                "invalid node group name: {:?}",
                node_group.name
            )));
        }
        if node_group.listen_port == 0 {
            return Err(ControlPlaneError::Invalid("listen_port must be non-zero".to_string()));
        }

        let name = node_group.name.clone();
        let changes = self.store.with_wtx(|tx| -> Result<()> {
            tx.upsert(Entity::NodeGroup(node_group))?;
            bump_versions(tx, &name, &ResourceType::ALL)?;
            Ok(())
        })?;

        log::info!("Node group {} saved ({} changes)", name, changes.len());
        self.publish(ChangeEvent::by_node_group(name, changes.clone()).into())?;
        Ok(changes)
    }

    /// 删除节点组及其路由、上游、版本行；共享的限流配置移除该节点组
    pub fn delete_node_group(&self, name: &str) -> Result<Vec<Change>> {
        self.ensure_writable()?;

        let mut touched_others = false;
        let changes = self.store.with_wtx(|tx| -> Result<()> {
            tx.delete(TABLE_NODE_GROUPS, name)?;
            tx.delete_by_node_group(TABLE_ROUTES, name)?;
            tx.delete_by_node_group(TABLE_UPSTREAMS, name)?;
            tx.delete_by_node_group(TABLE_CONFIG_VERSIONS, name)?;

            let shared: Vec<RateLimit> = tx
                .list_by_node_group(TABLE_RATE_LIMITS, name)?
                .into_iter()
                .filter_map(|e| e.as_rate_limit().cloned())
                .collect();
            for mut rl in shared {
                rl.node_groups.retain(|ng| ng != name);
                if rl.node_groups.is_empty() {
                    tx.delete(TABLE_RATE_LIMITS, &rl.id)?;
                } else {
                    for ng in &rl.node_groups {
                        bump_versions(tx, ng, &RATE_LIMIT_TYPES)?;
                    }
                    touched_others = true;
                    tx.update(Entity::RateLimit(rl))?;
                }
            }
            Ok(())
        })?;

        log::info!("Node group {} deleted ({} changes)", name, changes.len());
        let event: Event = if touched_others {
            MultipleChangeEvent::new(changes.clone()).into()
        } else {
            ChangeEvent::by_node_group(name, changes.clone()).into()
        };
        self.publish(event)?;
        Ok(changes)
    }

    // ========================================================================
    // 路由
    // ========================================================================

    pub fn upsert_route(&self, route: Route) -> Result<Vec<Change>> {
        self.ensure_writable()?;
        if !route.path.starts_with('/') {
            return Err(ControlPlaneError::Invalid(format!(
                "route {} path must start with '/'",
                route.id
            )));
        }

        let node_group = route.node_group.clone();
        let changes = self.store.with_wtx(|tx| -> Result<()> {
            require_node_group(tx, &route.node_group)?;
            let upstream_ok = tx
                .get(TABLE_UPSTREAMS, &route.upstream)?
                .and_then(|e| e.as_upstream())
                .map(|u| u.node_group == route.node_group)
                .unwrap_or(false);
            if !upstream_ok {
                return Err(StoreError::Constraint(format!(
                    "route {} references unknown upstream {} in node group {}",
                    route.id, route.upstream, route.node_group
                ))
                .into());
            }

            let previous = tx.upsert(Entity::Route(route))?;
            // 路由换了节点组时，旧节点组的路由配置也要重建
            if let Some(old) = previous.as_ref().and_then(|e| e.as_route()) {
                if old.node_group != node_group {
                    let old_group = old.node_group.clone();
                    bump_versions(tx, &old_group, &[ResourceType::RouteConfiguration])?;
                }
            }
            bump_versions(tx, &node_group, &[ResourceType::RouteConfiguration])?;
            Ok(())
        })?;

        self.publish_for_groups(&changes)?;
        Ok(changes)
    }

    pub fn delete_route(&self, id: &str) -> Result<Vec<Change>> {
        self.ensure_writable()?;
        let changes = self.store.with_wtx(|tx| -> Result<()> {
            let removed = tx.delete(TABLE_ROUTES, id)?;
            if let Some(route) = removed.as_route() {
                bump_versions(tx, &route.node_group, &[ResourceType::RouteConfiguration])?;
            }
            Ok(())
        })?;

        self.publish_for_groups(&changes)?;
        Ok(changes)
    }

    // ========================================================================
    // 上游
    // ========================================================================

    pub fn upsert_upstream(&self, upstream: Upstream) -> Result<Vec<Change>> {
        self.ensure_writable()?;
        if upstream.endpoints.is_empty() {
            return Err(ControlPlaneError::Invalid(format!(
                "upstream {} needs at least one endpoint",
                upstream.id
            )));
        }

        let node_group = upstream.node_group.clone();
        let changes = self.store.with_wtx(|tx| -> Result<()> {
            require_node_group(tx, &upstream.node_group)?;
            let previous = tx.upsert(Entity::Upstream(upstream))?;
            if let Some(old) = previous.as_ref().and_then(|e| e.as_upstream()) {
                if old.node_group != node_group {
                    return Err(StoreError::Constraint(format!(
                        "upstream {} cannot move from node group {} to {}",
                        old.id, old.node_group, node_group
                    ))
                    .into());
                }
            }
            bump_versions(tx, &node_group, &[ResourceType::Cluster])?;
            Ok(())
        })?;

        self.publish(ChangeEvent::by_node_group(node_group, changes.clone()).into())?;
        Ok(changes)
    }

    /// 仍被路由引用的上游不能删除
    pub fn delete_upstream(&self, id: &str) -> Result<Vec<Change>> {
        self.ensure_writable()?;
        let changes = self.store.with_wtx(|tx| -> Result<()> {
            let removed = tx.delete(TABLE_UPSTREAMS, id)?;
            let node_group = match removed.as_upstream() {
                Some(u) => u.node_group.clone(),
                None => return Ok(()),
            };
            let referenced_by: Vec<String> = tx
                .list_by_node_group(TABLE_ROUTES, &node_group)?
                .into_iter()
                .filter_map(|e| e.as_route())
                .filter(|r| r.upstream == id)
                .map(|r| r.id.clone())
                .collect();
            if !referenced_by.is_empty() {
                return Err(StoreError::Constraint(format!(
                    "upstream {} is still referenced by routes {:?}",
                    id, referenced_by
                ))
                .into());
            }
            bump_versions(tx, &node_group, &[ResourceType::Cluster])?;
            Ok(())
        })?;

        self.publish_for_groups(&changes)?;
        Ok(changes)
    }

    // ========================================================================
    // 限流（可跨节点组）
    // ========================================================================

    pub fn upsert_rate_limit(&self, rate_limit: RateLimit) -> Result<Vec<Change>> {
        self.ensure_writable()?;
        if rate_limit.node_groups.is_empty() {
            return Err(ControlPlaneError::Invalid(format!(
                "rate limit {} must apply to at least one node group",
                rate_limit.id
            )));
        }
        if rate_limit.requests_per_unit == 0 {
            return Err(ControlPlaneError::Invalid(format!(
                "rate limit {} requests_per_unit must be positive",
                rate_limit.id
            )));
        }

        let changes = self.store.with_wtx(|tx| -> Result<()> {
            let mut affected: BTreeSet<String> = rate_limit.node_groups.iter().cloned().collect();
            for ng in &affected {
                require_node_group(tx, ng)?;
            }
            let previous = tx.upsert(Entity::RateLimit(rate_limit))?;
            if let Some(old) = previous.as_ref().and_then(|e| e.as_rate_limit()) {
                affected.extend(old.node_groups.iter().cloned());
            }
            for ng in &affected {
                if tx.exists(TABLE_NODE_GROUPS, ng)? {
                    bump_versions(tx, ng, &RATE_LIMIT_TYPES)?;
                }
            }
            Ok(())
        })?;

        self.publish(MultipleChangeEvent::new(changes.clone()).into())?;
        Ok(changes)
    }

    pub fn delete_rate_limit(&self, id: &str) -> Result<Vec<Change>> {
        self.ensure_writable()?;
        let changes = self.store.with_wtx(|tx| -> Result<()> {
            let removed = tx.delete(TABLE_RATE_LIMITS, id)?;
            if let Some(rl) = removed.as_rate_limit() {
                for ng in &rl.node_groups {
                    if tx.exists(TABLE_NODE_GROUPS, ng)? {
                        bump_versions(tx, ng, &RATE_LIMIT_TYPES)?;
                    }
                }
            }
            Ok(())
        })?;

        self.publish(MultipleChangeEvent::new(changes.clone()).into())?;
        Ok(changes)
    }

    // ========================================================================
    // 重载（不修改存储）
    // ========================================================================

    /// 重建指定节点组的全部资源；为空表示全部节点组
    pub fn reload(&self, node_groups: Vec<String>) -> Result<()> {
        log::info!(
            "Reload requested for {}",
            if node_groups.is_empty() {
                "all node groups".to_string()
            } else {
                node_groups.join(", ")
            }
        );
        self.publish(ReloadEvent::new(node_groups).into())
    }

    pub fn partial_reload(&self, targets: Vec<EnvoyConfigVersion>) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        log::info!("Partial reload requested for {} targets", targets.len());
        self.publish(PartialReloadEvent::new(targets).into())
    }

    /// 单个节点组发 ChangeEvent，涉及多个节点组发 MultipleChangeEvent
    fn publish_for_groups(&self, changes: &[Change]) -> Result<()> {
        let groups: BTreeSet<String> = changes.iter().flat_map(|c| c.node_groups()).collect();
        let event: Event = if groups.len() == 1 {
            let group = groups.into_iter().next();
            ChangeEvent::new(group, changes.to_vec()).into()
        } else {
            MultipleChangeEvent::new(changes.to_vec()).into()
        };
        self.publish(event)
    }
}

fn require_node_group(tx: &WriteTxn<'_>, name: &str) -> std::result::Result<(), StoreError> {
    if tx.exists(TABLE_NODE_GROUPS, name)? {
        Ok(())
    } else {
        Err(StoreError::Constraint(format!("node group {} does not exist", name)))
    }
}

/// 在当前写事务内递增版本行
fn bump_versions(
    tx: &mut WriteTxn<'_>,
    node_group: &str,
    types: &[ResourceType],
) -> std::result::Result<(), StoreError> {
    for &resource_type in types {
        let key = EnvoyConfigVersion::key_for(node_group, resource_type);
        let previous = tx
            .get(TABLE_CONFIG_VERSIONS, &key)?
            .and_then(|e| e.as_config_version())
            .map(|v| v.version);
        tx.upsert(Entity::ConfigVersion(EnvoyConfigVersion::new(
            node_group,
            resource_type,
            EnvoyConfigVersion::next_version(previous),
        )))?;
    }
    Ok(())
}
