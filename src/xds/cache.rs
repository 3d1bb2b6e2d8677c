//! 资源快照缓存
//!
//! 每个节点组、每个 type URL 保存一份带版本的资源集合。
//! 任何修改都会让该节点组的 watch 计数器加一，发现服务据此推送。
//!
//! watch 与资源分开保存：代理上报的节点组不一定存在，只订阅不会产生资源条目。
//! 流关闭后调用 [`SnapshotCache::release`]，没有剩余订阅者的 watch 和
//! 已清空的节点组都会被移除。

use super::proto::Any;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::watch;

/// 某个节点组某一类型的资源集合
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSet {
    pub version: String,
    pub resources: Vec<Any>,
}

#[derive(Default)]
struct NodeEntry {
    sets: HashMap<String, ResourceSet>,
    /// 节点组已删除，资源集合只为已连接的代理保留
    cleared: bool,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, NodeEntry>,
    watchers: HashMap<String, watch::Sender<u64>>,
}

impl Inner {
    fn notify(&self, node_group: &str) {
        if let Some(notifier) = self.watchers.get(node_group) {
            notifier.send_modify(|v| *v += 1);
        }
    }

    fn has_watchers(&self, node_group: &str) -> bool {
        self.watchers
            .get(node_group)
            .map(|n| n.receiver_count() > 0)
            .unwrap_or(false)
    }
}

/// 按节点组缓存的资源
pub struct SnapshotCache {
    inner: RwLock<Inner>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// 替换某个节点组某一类型的资源集合
    pub fn set_resources(&self, node_group: &str, type_url: &str, version: String, resources: Vec<Any>) {
        let mut inner = self.inner.write();
        let entry = inner.nodes.entry(node_group.to_string()).or_default();
        if entry.cleared {
            entry.sets.clear();
            entry.cleared = false;
        }
        entry.sets.insert(
            type_url.to_string(),
            ResourceSet { version, resources },
        );
        inner.notify(node_group);
    }

    pub fn get(&self, node_group: &str, type_url: &str) -> Option<ResourceSet> {
        self.inner
            .read()
            .nodes
            .get(node_group)
            .and_then(|entry| entry.sets.get(type_url).cloned())
    }

    pub fn version(&self, node_group: &str, type_url: &str) -> Option<String> {
        self.inner
            .read()
            .nodes
            .get(node_group)
            .and_then(|entry| entry.sets.get(type_url).map(|s| s.version.clone()))
    }

    /// 订阅节点组的变化（节点组尚未出现时也可以先订阅）
    pub fn watch(&self, node_group: &str) -> watch::Receiver<u64> {
        let mut inner = self.inner.write();
        inner
            .watchers
            .entry(node_group.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// 节点组被删除：清空全部资源
    ///
    /// 有代理连接时保留空集合让它们收到删除；没有时直接移除条目。
    /// 已清空的节点组再次清空不会产生新版本。
    pub fn clear(&self, node_group: &str, version: String) {
        let mut inner = self.inner.write();
        let watched = inner.has_watchers(node_group);
        let entry = match inner.nodes.get_mut(node_group) {
            Some(entry) => entry,
            None => return,
        };
        if entry.cleared {
            return;
        }
        if !watched {
            inner.nodes.remove(node_group);
            return;
        }
        for set in entry.sets.values_mut() {
            set.version = version.clone();
            set.resources.clear();
        }
        entry.cleared = true;
        inner.notify(node_group);
    }

    /// 一个订阅者离开：没有剩余订阅者时移除 watch 和已清空的节点组
    ///
    /// 调用方须先丢弃自己的 `watch::Receiver`。
    pub fn release(&self, node_group: &str) {
        let mut inner = self.inner.write();
        if inner.has_watchers(node_group) {
            return;
        }
        inner.watchers.remove(node_group);
        if inner.nodes.get(node_group).map(|e| e.cleared).unwrap_or(false) {
            inner.nodes.remove(node_group);
            log::debug!("Dropped cleared resources of node group {}", node_group);
        }
    }

    /// 持有资源的节点组（不含已清空的）
    pub fn node_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .nodes
            .iter()
            .filter(|(_, entry)| !entry.cleared && !entry.sets.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// (资源条目数, watch 数)
    pub fn entry_counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.nodes.len(), inner.watchers.len())
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(name: &str) -> Any {
        Any {
            type_url: "t".to_string(),
            value: name.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_set_notifies_watchers() {
        let cache = SnapshotCache::new();
        let mut rx = cache.watch("gw1");

        cache.set_resources("gw1", "t", "1".to_string(), vec![any("a")]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        let set = cache.get("gw1", "t").unwrap();
        assert_eq!(set.version, "1");
        assert_eq!(set.resources.len(), 1);
        assert!(cache.get("gw2", "t").is_none());
    }

    #[test]
    fn test_clear_keeps_empty_sets_for_watchers() {
        let cache = SnapshotCache::new();
        let _rx = cache.watch("gw1");
        cache.set_resources("gw1", "t", "1".to_string(), vec![any("a")]);
        cache.clear("gw1", "2".to_string());

        let set = cache.get("gw1", "t").unwrap();
        assert_eq!(set.version, "2");
        assert!(set.resources.is_empty());
        assert!(cache.node_groups().is_empty());
    }

    #[test]
    fn test_clear_without_watchers_drops_entry() {
        let cache = SnapshotCache::new();
        cache.set_resources("gw1", "t", "1".to_string(), vec![any("a")]);
        cache.clear("gw1", "2".to_string());

        assert!(cache.get("gw1", "t").is_none());
        assert_eq!(cache.entry_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_second_clear_is_silent() {
        let cache = SnapshotCache::new();
        let mut rx = cache.watch("gw1");
        cache.set_resources("gw1", "t", "1".to_string(), vec![any("a")]);
        cache.clear("gw1", "2".to_string());
        rx.borrow_and_update();

        cache.clear("gw1", "3".to_string());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(cache.version("gw1", "t").unwrap(), "2");
    }

    #[test]
    fn test_watch_does_not_create_resources() {
        let cache = SnapshotCache::new();
        let _rx = cache.watch("pending");
        cache.set_resources("gw1", "t", "1".to_string(), vec![]);
        assert_eq!(cache.node_groups(), vec!["gw1".to_string()]);
        assert_eq!(cache.entry_counts(), (1, 1));
    }

    #[test]
    fn test_release_prunes_last_watcher() {
        let cache = SnapshotCache::new();
        let first = cache.watch("bogus");
        let second = cache.watch("bogus");

        drop(first);
        cache.release("bogus");
        assert_eq!(cache.entry_counts(), (0, 1));

        drop(second);
        cache.release("bogus");
        assert_eq!(cache.entry_counts(), (0, 0));
    }

    #[test]
    fn test_release_drops_cleared_node_group() {
        let cache = SnapshotCache::new();
        let rx = cache.watch("gw1");
        cache.set_resources("gw1", "t", "1".to_string(), vec![any("a")]);
        cache.clear("gw1", "2".to_string());
        assert_eq!(cache.entry_counts(), (1, 1));

        drop(rx);
        cache.release("gw1");
        assert_eq!(cache.entry_counts(), (0, 0));
    }

    #[test]
    fn test_set_after_clear_revives_node_group() {
        let cache = SnapshotCache::new();
        let _rx = cache.watch("gw1");
        cache.set_resources("gw1", "a", "1".to_string(), vec![any("a")]);
        cache.set_resources("gw1", "b", "1".to_string(), vec![any("b")]);
        cache.clear("gw1", "2".to_string());

        cache.set_resources("gw1", "a", "3".to_string(), vec![any("a")]);
        assert_eq!(cache.node_groups(), vec!["gw1".to_string()]);
        assert!(cache.get("gw1", "b").is_none());
    }
}
