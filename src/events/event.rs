//! 内部事件定义

use crate::model::EnvoyConfigVersion;
use crate::storage::Change;
use std::collections::BTreeMap;
use std::fmt;

/// 表名 -> 按修改顺序排列的变更
pub type ChangeMap = BTreeMap<String, Vec<Change>>;

/// 内部总线主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Changes,
    MultipleChanges,
    Reload,
    PartialReload,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::Changes,
        Topic::MultipleChanges,
        Topic::Reload,
        Topic::PartialReload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Changes => "changes",
            Topic::MultipleChanges => "multiple-changes",
            Topic::Reload => "reload",
            Topic::PartialReload => "partial-reload",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单节点组（或无节点组）的变更事件
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub node_group: Option<String>,
    pub changes: ChangeMap,
}

/// 可能影响多个节点组的变更事件
#[derive(Debug, Clone, PartialEq)]
pub struct MultipleChangeEvent {
    pub changes: ChangeMap,
}

/// 全量重载（node_groups 为空表示全部节点组）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReloadEvent {
    pub node_groups: Vec<String>,
}

/// 精确重建指定的 (节点组, 资源类型)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialReloadEvent {
    pub targets: Vec<EnvoyConfigVersion>,
}

/// 内部总线事件
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Changes(ChangeEvent),
    MultipleChanges(MultipleChangeEvent),
    Reload(ReloadEvent),
    PartialReload(PartialReloadEvent),
}

impl Event {
    /// 事件对应的主题
    pub fn topic(&self) -> Topic {
        match self {
            Event::Changes(_) => Topic::Changes,
            Event::MultipleChanges(_) => Topic::MultipleChanges,
            Event::Reload(_) => Topic::Reload,
            Event::PartialReload(_) => Topic::PartialReload,
        }
    }

    /// 携带的变更（重载类事件没有）
    pub fn changes(&self) -> Option<&ChangeMap> {
        match self {
            Event::Changes(e) => Some(&e.changes),
            Event::MultipleChanges(e) => Some(&e.changes),
            Event::Reload(_) | Event::PartialReload(_) => None,
        }
    }
}

impl From<ChangeEvent> for Event {
    fn from(e: ChangeEvent) -> Self {
        Event::Changes(e)
    }
}

impl From<MultipleChangeEvent> for Event {
    fn from(e: MultipleChangeEvent) -> Self {
        Event::MultipleChanges(e)
    }
}

impl From<ReloadEvent> for Event {
    fn from(e: ReloadEvent) -> Self {
        Event::Reload(e)
    }
}

impl From<PartialReloadEvent> for Event {
    fn from(e: PartialReloadEvent) -> Self {
        Event::PartialReload(e)
    }
}
