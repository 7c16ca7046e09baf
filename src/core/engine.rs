//! 同步引擎
//!
//! 负责拉取远程文档到缓存、把缓存修改推回远程，并按检查模式做冲突与写入校验。

use super::backup::backup_file;
use super::digest::{hash_file, hash_stream, ContentDigest, ContentHash, DigestAlgorithm, StreamDigest};
use super::eviction::{prune_empty_dirs, EvictionPolicy};
use super::notification::{Notifier, SyncNotification};
use super::policy::ProviderTable;
use super::store::{now_millis, CacheEntry, CacheStore, SyncPhase};
use super::watcher::{CacheWatcher, WatchEvent};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::storage::{RemoteId, RemoteStorage, TruncateStrategy};
use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 一次推送的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// 已写入远程，条目哈希已更新
    Written,
    /// 远程内容与本地一致，无需写入
    InSync,
    /// 远程内容在上次同步后被修改，未写入
    Conflict,
    /// 无法读取远程内容，未写入
    RemoteUnreachable,
    /// 写入失败，缓存文件已备份
    BackedUp(PathBuf),
    /// 写入失败且备份也失败
    DataAtRisk,
}

pub struct SyncEngine {
    store: CacheStore,
    storage: Arc<dyn RemoteStorage>,
    providers: ProviderTable,
    digest: DigestAlgorithm,
    cache_root: PathBuf,
    backup_dir: PathBuf,
    delete_confirmation: bool,
    write_check_delay: Duration,
    transfer_timeout: Option<Duration>,
    eviction: EvictionPolicy,
    notifier: Notifier,
    watcher: Option<Arc<CacheWatcher>>,
    /// 关闭信号，取消后所有传输和延迟校验都会停止
    shutdown: CancellationToken,
    /// 当前一批传输的取消信号（`shutdown` 的子令牌）
    transfers: Mutex<CancellationToken>,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        store: CacheStore,
        storage: Arc<dyn RemoteStorage>,
        notifier: Notifier,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let transfers = Mutex::new(shutdown.child_token());
        Self {
            store,
            storage,
            providers: config.provider_table(),
            digest: config.digest_algorithm(),
            cache_root: config.cache_dir.clone(),
            backup_dir: config.backup_dir.clone(),
            delete_confirmation: config.delete_confirmation,
            write_check_delay: Duration::from_millis(config.write_check_delay_ms),
            transfer_timeout: match config.transfer_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            eviction: EvictionPolicy::new(config.max_entries),
            notifier,
            watcher: None,
            shutdown,
            transfers,
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<CacheWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction
    }

    /// 取消所有进行中的传输，之后的传输不受影响
    pub fn cancel_transfers(&self) {
        let mut token = self.transfers.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = self.shutdown.child_token();
        info!("已取消进行中的传输");
    }

    /// 停止引擎：取消传输、延迟校验和事件循环
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn transfer_token(&self) -> CancellationToken {
        self.transfers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 在取消信号与超时控制下执行一次传输
    async fn run_transfer<T>(
        &self,
        path: &Path,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T> {
        let token = self.transfer_token();
        let limited = async {
            match self.transfer_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(r) => r.map_err(|e| SyncError::transfer(path, e)),
                    Err(_) => Err(SyncError::TimedOut(path.to_path_buf())),
                },
                None => fut.await.map_err(|e| SyncError::transfer(path, e)),
            }
        };
        tokio::select! {
            _ = token.cancelled() => Err(SyncError::Cancelled(path.to_path_buf())),
            r = limited => r,
        }
    }

    // ========== 拉取 ==========

    /// 拉取远程文档到本地路径，返回新的内容哈希
    ///
    /// 失败时已跟踪条目的哈希置为失败标记，新文档不会加入存储；取消或超时不修改哈希。
    pub async fn pull(&self, remote: &RemoteId, path: &Path) -> Result<ContentHash> {
        let guard = self
            .store
            .begin(path, SyncPhase::Pulling)
            .ok_or_else(|| SyncError::Busy(path.to_path_buf()))?;

        tokio::fs::create_dir_all(&self.cache_root).await?;
        let tmp = self.cache_root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let tmp_cleanup = tmp.clone();
        scopeguard::defer! {
            let _ = std::fs::remove_file(&tmp_cleanup);
        }

        debug!("拉取 {} -> {:?}", remote, path);
        let fetched = self.run_transfer(path, self.download(remote, &tmp)).await;
        let result = match fetched {
            Ok(hash) => install(&tmp, path)
                .await
                .map(|_| hash)
                .map_err(|e| SyncError::transfer(path, e)),
            Err(e) => Err(e),
        };

        let hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                if !e.is_interrupted() {
                    self.store.set_hash(path, ContentHash::Unavailable);
                }
                warn!("拉取失败: {}", e);
                return Err(e);
            }
        };

        self.store.put(CacheEntry::new(
            remote.clone(),
            path.to_path_buf(),
            hash.clone(),
        ));
        self.arm_watch(path);
        drop(guard);

        info!("已拉取 {} -> {:?}", remote, path);
        self.run_eviction().await;
        Ok(hash)
    }

    async fn download(&self, remote: &RemoteId, tmp: &Path) -> anyhow::Result<ContentHash> {
        let mut stream = self.storage.open_read(remote).await?;
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut digest = ContentDigest::new(self.digest);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(digest.finalize())
    }

    /// 登记已有的本地文件，不做传输
    pub async fn adopt(&self, remote: &RemoteId, path: &Path) -> Result<ContentHash> {
        if self.store.is_busy(path) {
            return Err(SyncError::Busy(path.to_path_buf()));
        }
        let hash = match hash_file(path, self.digest).await {
            Ok(h) => h,
            Err(e) => {
                warn!("无法计算 {:?} 的哈希: {}", path, e);
                ContentHash::Unavailable
            }
        };
        self.store
            .put(CacheEntry::new(remote.clone(), path.to_path_buf(), hash.clone()));
        self.arm_watch(path);
        debug!("登记 {} -> {:?}", remote, path);

        self.run_eviction().await;
        Ok(hash)
    }

    // ========== 推送 ==========

    /// 把缓存文件推回远程；`force` 为真时跳过所有检查
    pub async fn push(&self, path: &Path, force: bool) -> Result<PushOutcome> {
        let entry = self
            .store
            .get(path)
            .ok_or_else(|| SyncError::NotTracked(path.to_path_buf()))?;
        let _guard = self
            .store
            .begin(path, SyncPhase::Pushing)
            .ok_or_else(|| SyncError::Busy(path.to_path_buf()))?;

        let strategy = self.providers.resolve(&entry.remote_id, force);
        let mode = strategy.check_mode;
        debug!("推送 {:?} -> {} (检查模式 {})", path, entry.remote_id, mode);

        if mode.is_none() {
            return Ok(self.flush(&entry, strategy.truncate).await);
        }

        let remote_digest = match self.run_transfer(path, self.read_remote(&entry.remote_id)).await {
            Ok(d) => d,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                warn!("远程不可读，放弃推送: {}", e);
                self.notifier.send(SyncNotification::RemoteUnreachable {
                    path: path.to_path_buf(),
                    remote: entry.remote_id.clone(),
                });
                return Ok(PushOutcome::RemoteUnreachable);
            }
        };

        if remote_digest.is_empty() && !mode.writes() {
            return Ok(self.flush(&entry, strategy.truncate).await);
        }

        let local_hash = match hash_file(path, self.digest).await {
            Ok(h) => h,
            Err(e) => {
                error!("读取缓存文件失败 {:?}: {}", path, e);
                return Ok(self.backup(path).await);
            }
        };

        if remote_digest.hash.matches(&local_hash) {
            debug!("远程内容已一致: {:?}", path);
            return Ok(PushOutcome::InSync);
        }

        if mode.reads() && !remote_digest.hash.matches(&entry.content_hash) {
            let err = SyncError::Conflict {
                path: path.to_path_buf(),
                remote: entry.remote_id.to_string(),
            };
            warn!("{}", err);
            self.notifier.send(SyncNotification::Conflict {
                path: path.to_path_buf(),
                remote: entry.remote_id.clone(),
            });
            return Ok(PushOutcome::Conflict);
        }

        let outcome = self.flush(&entry, strategy.truncate).await;
        if outcome == PushOutcome::Written && mode.writes() {
            self.schedule_write_check(entry.remote_id.clone(), path.to_path_buf(), local_hash);
        }
        Ok(outcome)
    }

    /// 冲突处理"覆盖"：不做检查直接写入
    pub async fn force_push(&self, path: &Path) -> Result<PushOutcome> {
        self.push(path, true).await
    }

    /// 冲突处理"另存"：把缓存内容写入新的远程位置并改为跟踪新位置
    pub async fn retarget(&self, path: &Path, new_remote: &RemoteId) -> Result<PushOutcome> {
        let old = self
            .store
            .get(path)
            .ok_or_else(|| SyncError::NotTracked(path.to_path_buf()))?;
        let _guard = self
            .store
            .begin(path, SyncPhase::Pushing)
            .ok_or_else(|| SyncError::Busy(path.to_path_buf()))?;

        let truncate = self.providers.resolve(new_remote, true).truncate;
        match self
            .run_transfer(path, self.upload(new_remote, path, truncate))
            .await
        {
            Ok(hash) => {
                self.store.remove(path);
                self.store
                    .put(CacheEntry::new(new_remote.clone(), path.to_path_buf(), hash));
                info!("已改写到 {} (原 {})", new_remote, old.remote_id);
                Ok(PushOutcome::Written)
            }
            Err(e) => {
                warn!("改写失败: {}", e);
                Ok(self.backup(path).await)
            }
        }
    }

    async fn read_remote(&self, remote: &RemoteId) -> anyhow::Result<StreamDigest> {
        let stream = self.storage.open_read(remote).await?;
        Ok(hash_stream(stream, self.digest).await)
    }

    /// 写入远程，成功后以写入时计算的哈希作为条目哈希；失败时备份
    async fn flush(&self, entry: &CacheEntry, truncate: TruncateStrategy) -> PushOutcome {
        let path = &entry.local_path;
        match self
            .run_transfer(path, self.upload(&entry.remote_id, path, truncate))
            .await
        {
            Ok(hash) => {
                self.store.set_hash(path, hash);
                self.store.touch(path, now_millis());
                info!("已推送 {:?} -> {}", path, entry.remote_id);
                PushOutcome::Written
            }
            Err(e) => {
                warn!("推送失败: {}", e);
                self.backup(path).await
            }
        }
    }

    async fn upload(
        &self,
        remote: &RemoteId,
        path: &Path,
        truncate: TruncateStrategy,
    ) -> anyhow::Result<ContentHash> {
        let file = tokio::fs::File::open(path).await?;
        let digest = Arc::new(Mutex::new(ContentDigest::new(self.digest)));

        let tap = digest.clone();
        let stream = ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                tap.lock().unwrap_or_else(|e| e.into_inner()).update(bytes);
            }
        });

        let written = self
            .storage
            .write_stream(remote, truncate, Box::pin(stream))
            .await?;
        debug!("写入 {} 字节到 {}", written, remote);

        let hash = digest.lock().unwrap_or_else(|e| e.into_inner()).finalize();
        Ok(hash)
    }

    async fn backup(&self, path: &Path) -> PushOutcome {
        match backup_file(path, &self.backup_dir).await {
            Ok(dest) => {
                self.notifier.send(SyncNotification::DataAtRiskWarning {
                    path: path.to_path_buf(),
                    backup: Some(dest.clone()),
                });
                PushOutcome::BackedUp(dest)
            }
            Err(e) => {
                error!("备份失败，数据可能丢失 {:?}: {}", path, e);
                self.notifier.send(SyncNotification::DataAtRiskWarning {
                    path: path.to_path_buf(),
                    backup: None,
                });
                PushOutcome::DataAtRisk
            }
        }
    }

    /// 延迟复查远程内容，不一致时只报告不重试
    fn schedule_write_check(&self, remote: RemoteId, path: PathBuf, expected: ContentHash) {
        let storage = self.storage.clone();
        let notifier = self.notifier.clone();
        let token = self.shutdown.clone();
        let delay = self.write_check_delay;
        let algorithm = self.digest;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let actual = match storage.open_read(&remote).await {
                Ok(stream) => hash_stream(stream, algorithm).await.hash,
                Err(e) => {
                    warn!("写入校验时无法读取远程 {}: {}", remote, e);
                    ContentHash::Unavailable
                }
            };

            if actual.matches(&expected) {
                debug!("写入校验通过: {:?}", path);
                return;
            }

            let err = SyncError::WriteIntegrity {
                path: path.clone(),
                remote: remote.to_string(),
            };
            warn!("{}", err);
            notifier.send(SyncNotification::WriteIntegrityFailure { path, remote });
        });
    }

    // ========== 条目管理 ==========

    /// 确认删除：删除远程文档并移除条目
    pub async fn confirm_delete(&self, path: &Path) -> Result<()> {
        let entry = self
            .store
            .get(path)
            .ok_or_else(|| SyncError::NotTracked(path.to_path_buf()))?;
        let _guard = self
            .store
            .begin(path, SyncPhase::Pushing)
            .ok_or_else(|| SyncError::Busy(path.to_path_buf()))?;

        self.run_transfer(path, self.storage.delete(&entry.remote_id))
            .await?;

        self.store.remove(path);
        if let Some(w) = &self.watcher {
            w.unwatch(path);
        }
        if path.starts_with(&self.cache_root) {
            let root = self.cache_root.clone();
            let _ = tokio::task::spawn_blocking(move || prune_empty_dirs(&root)).await;
        }
        info!("已删除远程文档 {}", entry.remote_id);
        Ok(())
    }

    /// 停止跟踪（缓存文件保留）
    pub fn remove(&self, path: &Path) -> Option<CacheEntry> {
        let removed = self.store.remove(path)?;
        if let Some(w) = &self.watcher {
            w.unwatch(path);
        }
        debug!("停止跟踪 {:?}", path);
        Some(removed)
    }

    /// 重置：清空条目、停止所有监听并删除缓存目录内容
    pub async fn clear(&self) -> Result<usize> {
        let cleared = self.store.clear();
        if let Some(w) = &self.watcher {
            w.unwatch_all();
        }

        match tokio::fs::remove_dir_all(&self.cache_root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.cache_root).await?;
        self.arm_watch_root();

        info!("已清空缓存 ({} 个条目)", cleared.len());
        Ok(cleared.len())
    }

    /// 最近使用列表（新到旧）
    pub fn mru(&self) -> Vec<(RemoteId, PathBuf)> {
        self.store
            .snapshot_by_recency()
            .into_iter()
            .map(|e| (e.remote_id, e.local_path))
            .collect()
    }

    // ========== 监听 ==========

    fn arm_watch_root(&self) {
        if let Some(w) = &self.watcher {
            if let Err(e) = w.watch_root(&self.cache_root) {
                warn!("无法监听缓存目录 {:?}: {}", self.cache_root, e);
            }
        }
    }

    fn arm_watch(&self, path: &Path) {
        let Some(w) = &self.watcher else {
            return;
        };
        let result = if path.starts_with(&self.cache_root) {
            w.watch_root(&self.cache_root)
        } else {
            w.watch_file(path)
        };
        if let Err(e) = result {
            warn!("无法监听 {:?}: {}", path, e);
        }
    }

    /// 恢复状态后重新建立监听：缓存根目录一个递归监听，外部路径各一个
    pub async fn rearm_watches(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_root).await?;
        self.arm_watch_root();
        for entry in self.store.snapshot_by_recency() {
            if !entry.local_path.starts_with(&self.cache_root) && entry.local_path.exists() {
                self.arm_watch(&entry.local_path);
            }
        }
        Ok(())
    }

    /// 文件事件循环，直到引擎关闭或事件源结束
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<WatchEvent>) {
        info!("开始处理缓存文件事件");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        info!("缓存文件事件处理已停止");
    }

    fn handle_event(self: &Arc<Self>, event: WatchEvent) {
        match event {
            WatchEvent::Opened(path) => {
                self.store.touch(&path, now_millis());
            }
            WatchEvent::ClosedAfterWrite(path) => {
                if !self.store.touch(&path, now_millis()) {
                    return;
                }
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    match engine.push(&path, false).await {
                        Ok(outcome) => debug!("推送 {:?}: {:?}", path, outcome),
                        Err(SyncError::Busy(_)) => debug!("路径正在同步，忽略本次写入: {:?}", path),
                        Err(e) => warn!("推送失败: {}", e),
                    }
                });
            }
            WatchEvent::Deleted(path) => {
                if !self.delete_confirmation {
                    debug!("缓存文件被删除: {:?}", path);
                    return;
                }
                if let Some(entry) = self.store.get(&path) {
                    self.notifier.send(SyncNotification::DeleteConfirmationRequested {
                        path,
                        remote: entry.remote_id,
                    });
                }
            }
        }
    }

    async fn run_eviction(&self) {
        if !self.eviction.needs_eviction(self.store.len()) {
            return;
        }
        let store = self.store.clone();
        let watcher = self.watcher.clone();
        let root = self.cache_root.clone();
        let policy = self.eviction;
        if let Err(e) =
            tokio::task::spawn_blocking(move || policy.evict(&store, watcher.as_deref(), &root))
                .await
        {
            error!("缓存淘汰任务失败: {}", e);
        }
    }
}

/// 用临时文件替换目标文件（先删后改名，跨设备时退回复制）
async fn install(tmp: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Err(e) = tokio::fs::rename(tmp, dest).await {
        debug!("改名失败，改用复制: {}", e);
        tokio::fs::copy(tmp, dest).await?;
    }
    Ok(())
}
