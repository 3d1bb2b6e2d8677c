//! 内存事务存储（MemDb）
//!
//! - 单写者：写事务持有写锁直到提交/回滚
//! - 读事务：共享读锁，读到一致视图
//! - 回滚：按逆序重放本事务自身的 Change 列表（Change 同时充当 undo log）
//! - 二级索引：按节点组索引每张表的主键

use super::change::Change;
use super::snapshot::{Snapshot, SnapshotBody};
use super::StoreError;
use crate::model::{Entity, ALL_TABLES};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// 单张表：主键 -> 实体，外加节点组索引
#[derive(Debug, Default, Clone)]
struct TableData {
    rows: BTreeMap<String, Entity>,
    by_node_group: HashMap<String, BTreeSet<String>>,
}

impl TableData {
    fn put(&mut self, entity: Entity) -> Option<Entity> {
        let key = entity.primary_key();
        let previous = self.rows.remove(&key);
        if let Some(old) = &previous {
            self.unindex(&key, old);
        }
        self.index(&key, &entity);
        self.rows.insert(key, entity);
        previous
    }

    fn remove(&mut self, key: &str) -> Option<Entity> {
        let removed = self.rows.remove(key);
        if let Some(old) = &removed {
            self.unindex(key, old);
        }
        removed
    }

    fn index(&mut self, key: &str, entity: &Entity) {
        for ng in entity.node_groups() {
            self.by_node_group
                .entry(ng.to_string())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&mut self, key: &str, entity: &Entity) {
        for ng in entity.node_groups() {
            if let Some(keys) = self.by_node_group.get_mut(ng) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_node_group.remove(ng);
                }
            }
        }
    }
}

/// 全部表
#[derive(Debug, Clone)]
struct Tables {
    tables: HashMap<String, TableData>,
}

impl Tables {
    fn new() -> Self {
        Self {
            tables: ALL_TABLES
                .iter()
                .map(|t| (t.to_string(), TableData::default()))
                .collect(),
        }
    }

    fn table(&self, name: &str) -> Result<&TableData, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableData, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<&Entity>, StoreError> {
        Ok(self.table(table)?.rows.get(key))
    }

    fn list(&self, table: &str) -> Result<Vec<&Entity>, StoreError> {
        Ok(self.table(table)?.rows.values().collect())
    }

    fn list_by_node_group(&self, table: &str, node_group: &str) -> Result<Vec<&Entity>, StoreError> {
        let data = self.table(table)?;
        Ok(data
            .by_node_group
            .get(node_group)
            .map(|keys| keys.iter().filter_map(|k| data.rows.get(k)).collect())
            .unwrap_or_default())
    }

    fn export(&self) -> BTreeMap<String, Vec<Entity>> {
        self.tables
            .iter()
            .map(|(name, data)| (name.clone(), data.rows.values().cloned().collect()))
            .collect()
    }

    fn from_export(exported: BTreeMap<String, Vec<Entity>>) -> Result<Self, StoreError> {
        let mut tables = Tables::new();
        for (name, rows) in exported {
            let data = tables.table_mut(&name)?;
            for entity in rows {
                if entity.table() != name {
                    return Err(StoreError::Decode(format!(
                        "entity of table {} found in table {}",
                        entity.table(),
                        name
                    )));
                }
                data.put(entity);
            }
        }
        Ok(tables)
    }
}

// ============================================================================
// 读事务
// ============================================================================

/// 只读事务视图
pub struct ReadTxn<'a> {
    tables: &'a Tables,
    generation: u64,
}

impl<'a> ReadTxn<'a> {
    /// 事务开始时的存储代数
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, table: &str, key: &str) -> Result<Option<&'a Entity>, StoreError> {
        self.tables.get(table, key)
    }

    pub fn exists(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.tables.get(table, key)?.is_some())
    }

    pub fn list(&self, table: &str) -> Result<Vec<&'a Entity>, StoreError> {
        self.tables.list(table)
    }

    pub fn list_by_node_group(&self, table: &str, node_group: &str) -> Result<Vec<&'a Entity>, StoreError> {
        self.tables.list_by_node_group(table, node_group)
    }

    pub fn count(&self, table: &str) -> Result<usize, StoreError> {
        Ok(self.tables.table(table)?.rows.len())
    }
}

// ============================================================================
// 写事务
// ============================================================================

/// 写事务
///
/// 未提交即被丢弃（闭包返回错误或 panic）时自动回滚。
pub struct WriteTxn<'a> {
    tables: &'a mut Tables,
    changes: Vec<Change>,
    committed: bool,
}

impl<'a> WriteTxn<'a> {
    fn new(tables: &'a mut Tables) -> Self {
        Self {
            tables,
            changes: Vec::new(),
            committed: false,
        }
    }

    pub fn get(&self, table: &str, key: &str) -> Result<Option<&Entity>, StoreError> {
        self.tables.get(table, key)
    }

    pub fn exists(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.tables.get(table, key)?.is_some())
    }

    pub fn list(&self, table: &str) -> Result<Vec<&Entity>, StoreError> {
        self.tables.list(table)
    }

    pub fn list_by_node_group(&self, table: &str, node_group: &str) -> Result<Vec<&Entity>, StoreError> {
        self.tables.list_by_node_group(table, node_group)
    }

    /// 插入新实体，主键已存在时报错
    pub fn insert(&mut self, entity: Entity) -> Result<(), StoreError> {
        let table = entity.table();
        let key = entity.primary_key();
        let data = self.tables.table_mut(table)?;
        if data.rows.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                table: table.to_string(),
                key,
            });
        }
        data.put(entity.clone());
        self.changes.push(Change::insert(entity));
        Ok(())
    }

    /// 插入或更新，返回旧值
    pub fn upsert(&mut self, entity: Entity) -> Result<Option<Entity>, StoreError> {
        let previous = self.tables.table_mut(entity.table())?.put(entity.clone());
        match &previous {
            Some(old) => self.changes.push(Change::update(old.clone(), entity)),
            None => self.changes.push(Change::insert(entity)),
        }
        Ok(previous)
    }

    /// 更新已存在的实体
    pub fn update(&mut self, entity: Entity) -> Result<Entity, StoreError> {
        let table = entity.table();
        let key = entity.primary_key();
        if !self.tables.table(table)?.rows.contains_key(&key) {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                key,
            });
        }
        let previous = self.upsert(entity)?;
        previous.ok_or_else(|| StoreError::NotFound {
            table: table.to_string(),
            key,
        })
    }

    /// 删除实体，返回被删除的值
    pub fn delete(&mut self, table: &str, key: &str) -> Result<Entity, StoreError> {
        let removed = self
            .tables
            .table_mut(table)?
            .remove(key)
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                key: key.to_string(),
            })?;
        self.changes.push(Change::delete(removed.clone()));
        Ok(removed)
    }

    /// 删除表中属于某节点组的全部实体，返回删除数量
    pub fn delete_by_node_group(&mut self, table: &str, node_group: &str) -> Result<usize, StoreError> {
        let keys: Vec<String> = self
            .tables
            .list_by_node_group(table, node_group)?
            .into_iter()
            .map(|e| e.primary_key())
            .collect();
        for key in &keys {
            self.delete(table, key)?;
        }
        Ok(keys.len())
    }

    /// 本事务目前累计的变更
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    fn commit(mut self) -> Vec<Change> {
        self.committed = true;
        std::mem::take(&mut self.changes)
    }

    fn rollback(&mut self) {
        for change in self.changes.drain(..).rev() {
            let Ok(data) = self.tables.table_mut(&change.table) else {
                continue;
            };
            if let Some(after) = &change.after {
                data.remove(&after.primary_key());
            }
            if let Some(before) = change.before {
                data.put(before);
            }
        }
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.changes.is_empty() {
            log::debug!("Rolling back write transaction ({} changes)", self.changes.len());
            self.rollback();
        }
    }
}

// ============================================================================
// MemDb
// ============================================================================

/// 内存事务存储
pub struct MemDb {
    tables: RwLock<Tables>,

    /// 每次提交非空写事务或 restore 时递增
    generation: AtomicU64,
}

impl MemDb {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// 写事务
    ///
    /// 闭包返回 `Ok` 时提交并返回按修改顺序排列的变更列表；
    /// 返回 `Err` 时回滚，不留任何副作用。
    pub fn with_wtx<F, E>(&self, f: F) -> Result<Vec<Change>, E>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut guard = self.tables.write();
        let mut txn = WriteTxn::new(&mut *guard);
        f(&mut txn)?;
        let changes = txn.commit();
        if !changes.is_empty() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(changes)
    }

    /// 只读事务
    pub fn with_rtx<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTxn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let guard = self.tables.read();
        let txn = ReadTxn {
            tables: &*guard,
            generation: self.generation.load(Ordering::SeqCst),
        };
        f(&txn)
    }

    /// 整库备份
    pub fn backup(&self) -> Result<Snapshot, StoreError> {
        let (tables, generation) = {
            let guard = self.tables.read();
            (guard.export(), self.generation.load(Ordering::SeqCst))
        };
        let body = SnapshotBody {
            taken_at: chrono::Utc::now().timestamp_millis(),
            generation,
            tables,
        };
        Snapshot::encode(&body)
    }

    /// 用快照整体替换当前内容（不是合并）
    pub fn restore(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let body = snapshot.decode()?;
        let tables = Tables::from_export(body.tables)?;
        let mut guard = self.tables.write();
        *guard = tables;
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(guard);
        log::debug!("Store restored from snapshot taken at {}", body.taken_at);
        Ok(())
    }

    /// 当前内容导出（按表、主键有序）
    pub fn export(&self) -> BTreeMap<String, Vec<Entity>> {
        self.tables.read().export()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}
