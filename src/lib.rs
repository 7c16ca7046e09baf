use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::core::{
    normalize_path, CacheEntry, CacheStore, CheckMode, ContentHash, PushOutcome, RestoreReport,
    SyncEngine, SyncNotification,
};
pub use config::{StorageConfig, StorageType, SyncConfig};
pub use error::{Result, SyncError};
pub use storage::{RemoteId, RemoteStorage};

use crate::core::{CacheWatcher, Notifier, StateFile, WatchEvent};

/// 缓存同步服务
///
/// 持有唯一的 `CacheStore` 与同步引擎，负责启动时恢复状态、关闭时保存状态。
pub struct CacheSync {
    config_dir: PathBuf,
    config: SyncConfig,
    engine: Arc<SyncEngine>,
    state: StateFile,
    events: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    notifications: Mutex<Option<mpsc::Receiver<SyncNotification>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheSync {
    /// 默认配置目录
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("cachesync"))
            .unwrap_or_else(|| PathBuf::from(".cachesync"))
    }

    /// 从配置目录加载配置与存储列表并创建服务
    pub async fn open(config_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let config = SyncConfig::load(config_dir);
        let storages = StorageConfig::load_all(config_dir);
        let storage = storage::create_router(&storages).await?;
        Self::new(config_dir, config, storage)
    }

    pub fn new(
        config_dir: &Path,
        config: SyncConfig,
        storage: Arc<dyn RemoteStorage>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)?;

        let store = CacheStore::new();
        let (notifier, notifications) = Notifier::channel();
        let (tx, events) = mpsc::unbounded_channel();
        let watcher = Arc::new(CacheWatcher::new(store.clone(), tx)?);
        let engine = SyncEngine::new(&config, store, storage, notifier).with_watcher(watcher);

        tracing::info!(
            "缓存同步服务: 缓存目录 {:?}, 最大条目 {}, 检查模式 {}/{}",
            config.cache_dir,
            engine.eviction_policy().max_entries(),
            config.check_mode,
            config.cloud_check_mode
        );

        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            state: StateFile::new(config.state_path(config_dir)),
            config,
            engine: Arc::new(engine),
            events: Mutex::new(Some(events)),
            notifications: Mutex::new(Some(notifications)),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// 启动文件事件处理任务（只能启动一次）
    pub fn start(&self) -> bool {
        let Some(events) = self.events.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return false;
        };
        let handle = tokio::spawn(self.engine.clone().run(events));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        true
    }

    /// 取走通知接收端
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<SyncNotification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // ========== 状态 ==========

    /// 恢复跟踪状态并重新建立监听
    pub async fn restore_state(&self) -> Result<RestoreReport> {
        let report = self.state.restore(self.engine.store());
        self.engine.rearm_watches().await?;
        Ok(report)
    }

    pub fn save_state(&self) -> Result<usize> {
        self.state.save(self.engine.store())
    }

    /// 关闭服务：取消传输与事件处理，然后保存状态
    pub async fn shutdown(&self) -> Result<usize> {
        tracing::info!("正在关闭缓存同步服务...");
        self.engine.shutdown();

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }

        self.save_state()
    }

    // ========== 同步操作 ==========

    pub async fn pull(&self, remote: &RemoteId, path: &Path) -> Result<ContentHash> {
        self.engine.pull(remote, &normalize_path(path)?).await
    }

    pub async fn adopt(&self, remote: &RemoteId, path: &Path) -> Result<ContentHash> {
        self.engine.adopt(remote, &normalize_path(path)?).await
    }

    pub async fn push(&self, path: &Path) -> Result<PushOutcome> {
        self.engine.push(&normalize_path(path)?, false).await
    }

    pub async fn force_push(&self, path: &Path) -> Result<PushOutcome> {
        self.engine.force_push(&normalize_path(path)?).await
    }

    pub async fn retarget(&self, path: &Path, new_remote: &RemoteId) -> Result<PushOutcome> {
        self.engine.retarget(&normalize_path(path)?, new_remote).await
    }

    pub async fn confirm_delete(&self, path: &Path) -> Result<()> {
        self.engine.confirm_delete(&normalize_path(path)?).await
    }

    pub fn remove(&self, path: &Path) -> Result<Option<CacheEntry>> {
        Ok(self.engine.remove(&normalize_path(path)?))
    }

    pub async fn clear(&self) -> Result<usize> {
        self.engine.clear().await
    }

    pub fn mru(&self) -> Vec<(RemoteId, PathBuf)> {
        self.engine.mru()
    }

    /// 取消进行中的传输
    pub fn cancel(&self) {
        self.engine.cancel_transfers();
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }

    pub fn cache_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Caches"))
        } else {
            std::env::var("XDG_CACHE_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".cache")))
        }
    }

    /// 备份等需要长期保留的数据
    pub fn data_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local").join("share"))
                })
        }
    }
}
