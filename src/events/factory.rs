//! 变更事件工厂
//!
//! 纯函数：把写事务返回的 Change 列表按表分组并包装成事件，无副作用、无 I/O。

use super::event::{
    ChangeEvent, ChangeMap, MultipleChangeEvent, PartialReloadEvent, ReloadEvent,
};
use crate::model::EnvoyConfigVersion;
use crate::storage::Change;
use std::collections::BTreeSet;

/// 按表分组，保持每张表内的原始顺序
pub fn changes_to_map(changes: Vec<Change>) -> ChangeMap {
    let mut map = ChangeMap::new();
    for change in changes {
        map.entry(change.table.clone()).or_default().push(change);
    }
    map
}

/// 变更涉及的全部节点组（去重、有序）
pub fn node_groups_of(changes: &ChangeMap) -> BTreeSet<String> {
    changes
        .values()
        .flatten()
        .flat_map(|c| c.node_groups())
        .collect()
}

impl ChangeEvent {
    pub fn new(node_group: Option<String>, changes: Vec<Change>) -> Self {
        Self {
            node_group,
            changes: changes_to_map(changes),
        }
    }

    /// 单节点组变更
    pub fn by_node_group(node_group: impl Into<String>, changes: Vec<Change>) -> Self {
        Self::new(Some(node_group.into()), changes)
    }
}

impl MultipleChangeEvent {
    pub fn new(changes: Vec<Change>) -> Self {
        Self {
            changes: changes_to_map(changes),
        }
    }

    pub fn node_groups(&self) -> BTreeSet<String> {
        node_groups_of(&self.changes)
    }
}

impl ReloadEvent {
    pub fn new(node_groups: Vec<String>) -> Self {
        Self { node_groups }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.node_groups.is_empty()
    }
}

impl PartialReloadEvent {
    pub fn new(targets: Vec<EnvoyConfigVersion>) -> Self {
        Self { targets }
    }
}
