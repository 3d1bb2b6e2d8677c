//! 持久化存储契约
//!
//! 控制面只依赖 load / flush 两个操作；SQL 之类的具体后端不在本模块内。
//! 这里提供一个基于文件的实现（临时文件 + rename，保证原子替换），
//! 以及 Master 上定期落盘的 DurableFlusher。

use super::memdb::MemDb;
use super::snapshot::Snapshot;
use super::StoreError;
use crate::replication::role::{Role, RoleView};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// 持久化存储契约
pub trait DurableStore: Send + Sync {
    /// 加载最近一次落盘的快照，不存在时返回 None
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    /// 落盘快照
    fn flush(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// 基于文件的持久化存储
pub struct FileDurableStore {
    path: PathBuf,
}

impl FileDurableStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableStore for FileDurableStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Snapshot::from_bytes(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(snapshot.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        log::debug!(
            "Snapshot flushed to {} ({} bytes)",
            self.path.display(),
            snapshot.len()
        );
        Ok(())
    }
}

/// 定期落盘任务（仅在 Master 上写）
pub struct DurableFlusher {
    quit_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl DurableFlusher {
    /// 启动落盘循环：generation 变化且当前为 Master 时备份并 flush
    pub fn spawn(
        store: Arc<MemDb>,
        durable: Arc<dyn DurableStore>,
        role: Arc<dyn RoleView>,
        interval: Duration,
    ) -> Self {
        let (quit_tx, mut quit_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut flushed_generation = store.generation();

            loop {
                tokio::select! {
                    _ = &mut quit_rx => break,
                    _ = ticker.tick() => {
                        if role.current_role() != Some(Role::Master) {
                            continue;
                        }
                        let generation = store.generation();
                        if generation == flushed_generation {
                            continue;
                        }
                        match store.backup().and_then(|s| durable.flush(&s)) {
                            Ok(()) => flushed_generation = generation,
                            Err(e) => log::error!("Durable flush failed: {}", e),
                        }
                    }
                }
            }
            log::info!("Durable flusher stopped");
        });

        Self { quit_tx, handle }
    }

    pub async fn stop(self) {
        let _ = self.quit_tx.send(());
        let _ = self.handle.await;
    }
}
