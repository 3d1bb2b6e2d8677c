//! 变更记录

use crate::model::Entity;
use serde::{Deserialize, Serialize};

/// 变更类型（由 before/after 推导）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// 一次存储修改产生的 before/after 记录
///
/// - `before == None` ⇒ 插入
/// - `after == None` ⇒ 删除
/// - 两者都有 ⇒ 更新
///
/// 只在写事务内部产生，按修改顺序排列，不做持久化。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub table: String,
    pub before: Option<Entity>,
    pub after: Option<Entity>,
}

impl Change {
    pub fn insert(entity: Entity) -> Self {
        Self {
            table: entity.table().to_string(),
            before: None,
            after: Some(entity),
        }
    }

    pub fn update(before: Entity, after: Entity) -> Self {
        Self {
            table: after.table().to_string(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(entity: Entity) -> Self {
        Self {
            table: entity.table().to_string(),
            before: Some(entity),
            after: None,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match (&self.before, &self.after) {
            (None, _) => ChangeKind::Insert,
            (Some(_), None) => ChangeKind::Delete,
            (Some(_), Some(_)) => ChangeKind::Update,
        }
    }

    /// 变更涉及的节点组（before 与 after 的并集，保持出现顺序且去重）
    pub fn node_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for entity in self.before.iter().chain(self.after.iter()) {
            for ng in entity.node_groups() {
                if !groups.iter().any(|g| g == ng) {
                    groups.push(ng.to_string());
                }
            }
        }
        groups
    }
}
