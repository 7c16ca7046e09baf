//! 缓存条目存储
//!
//! 本地缓存路径到跟踪条目的映射，是同步状态的唯一来源。
//! 监听回调、延迟校验任务和调用方都会并发访问，所有操作都在同一把锁内完成。

use super::digest::ContentHash;
use crate::storage::RemoteId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// 拉取结束后忽略该路径文件事件的时长（替换缓存文件产生的事件会稍晚到达）
const SETTLE_WINDOW: Duration = Duration::from_millis(300);

/// 当前时间（毫秒时间戳）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub remote_id: RemoteId,
    pub local_path: PathBuf,
    /// 最后一次确认一致的内容哈希
    pub content_hash: ContentHash,
    /// 最后访问时间（毫秒时间戳）
    pub last_access: i64,
}

impl CacheEntry {
    pub fn new(remote_id: RemoteId, local_path: PathBuf, content_hash: ContentHash) -> Self {
        Self {
            remote_id,
            local_path,
            content_hash,
            last_access: now_millis(),
        }
    }
}

/// 单个路径的同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pulling,
    Pushing,
}

#[derive(Debug, Clone, Copy)]
struct PhaseSlot {
    phase: SyncPhase,
    settle_until: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<PathBuf, CacheEntry>,
    phases: HashMap<PathBuf, PhaseSlot>,
}

/// 共享的缓存条目存储
#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<Inner>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, path: &Path) -> Option<CacheEntry> {
        self.lock().entries.get(path).cloned()
    }

    /// 插入或替换条目，返回旧条目
    pub fn put(&self, entry: CacheEntry) -> Option<CacheEntry> {
        self.lock().entries.insert(entry.local_path.clone(), entry)
    }

    /// 移除条目；空闲路径的阶段记录一并清掉
    pub fn remove(&self, path: &Path) -> Option<CacheEntry> {
        let mut inner = self.lock();
        if inner.phases.get(path).is_some_and(|s| s.phase == SyncPhase::Idle) {
            inner.phases.remove(path);
        }
        inner.entries.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// 清空全部条目，返回被清除的条目
    pub fn clear(&self) -> Vec<CacheEntry> {
        let mut inner = self.lock();
        inner.phases.retain(|_, s| s.phase != SyncPhase::Idle);
        inner.entries.drain().map(|(_, e)| e).collect()
    }

    /// 更新访问时间，路径未跟踪时返回 false
    pub fn touch(&self, path: &Path, at: i64) -> bool {
        match self.lock().entries.get_mut(path) {
            Some(entry) => {
                entry.last_access = at;
                true
            }
            None => false,
        }
    }

    pub fn set_hash(&self, path: &Path, hash: ContentHash) -> bool {
        match self.lock().entries.get_mut(path) {
            Some(entry) => {
                entry.content_hash = hash;
                true
            }
            None => false,
        }
    }

    /// 按访问时间从新到旧排列的快照（时间相同时按路径排序）
    pub fn snapshot_by_recency(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_access
                .cmp(&a.last_access)
                .then_with(|| a.local_path.cmp(&b.local_path))
        });
        entries
    }

    /// 开始对路径的同步操作；该路径已有操作在进行时返回 None
    pub fn begin(&self, path: &Path, phase: SyncPhase) -> Option<PathGuard> {
        let mut inner = self.lock();
        if let Some(slot) = inner.phases.get(path) {
            if slot.phase != SyncPhase::Idle {
                return None;
            }
        }
        inner.phases.insert(
            path.to_path_buf(),
            PhaseSlot {
                phase,
                settle_until: None,
            },
        );
        Some(PathGuard {
            store: self.clone(),
            path: path.to_path_buf(),
            phase,
        })
    }

    pub fn phase(&self, path: &Path) -> SyncPhase {
        self.lock()
            .phases
            .get(path)
            .map(|s| s.phase)
            .unwrap_or(SyncPhase::Idle)
    }

    pub fn is_busy(&self, path: &Path) -> bool {
        self.phase(path) != SyncPhase::Idle
    }

    /// 文件事件是否应当处理：路径已跟踪、没有进行中的传输且不在静默期内
    pub fn accepts_event(&self, path: &Path) -> bool {
        let mut inner = self.lock();
        if !inner.entries.contains_key(path) {
            return false;
        }
        match inner.phases.get(path).copied() {
            None => true,
            Some(slot) if slot.phase != SyncPhase::Idle => false,
            Some(PhaseSlot {
                settle_until: Some(until),
                ..
            }) if Instant::now() < until => false,
            Some(_) => {
                inner.phases.remove(path);
                true
            }
        }
    }

    /// 推送不改动缓存文件，结束后直接回到空闲；拉取到已跟踪路径后进入静默期
    fn finish(&self, path: &Path, phase: SyncPhase) {
        let mut inner = self.lock();
        match phase {
            SyncPhase::Pulling if inner.entries.contains_key(path) => {
                inner.phases.insert(
                    path.to_path_buf(),
                    PhaseSlot {
                        phase: SyncPhase::Idle,
                        settle_until: Some(Instant::now() + SETTLE_WINDOW),
                    },
                );
            }
            _ => {
                inner.phases.remove(path);
            }
        }
    }

    #[cfg(test)]
    fn phase_slots(&self) -> usize {
        self.lock().phases.len()
    }
}

/// 路径同步操作守卫，释放时路径回到空闲状态
pub struct PathGuard {
    store: CacheStore,
    path: PathBuf,
    phase: SyncPhase,
}

impl PathGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.store.finish(&self.path, self.phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, at: i64) -> CacheEntry {
        CacheEntry {
            remote_id: RemoteId::new(format!("s3://b{}", path)),
            local_path: PathBuf::from(path),
            content_hash: ContentHash::Unavailable,
            last_access: at,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let store = CacheStore::new();
        assert!(store.put(entry("/c/a", 1)).is_none());
        // 相同路径替换而不是重复
        assert!(store.put(entry("/c/a", 2)).is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(Path::new("/c/a")).unwrap().last_access, 2);

        assert!(store.touch(Path::new("/c/a"), 9));
        assert!(!store.touch(Path::new("/c/missing"), 9));
        assert!(store.remove(Path::new("/c/a")).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_by_recency() {
        let store = CacheStore::new();
        store.put(entry("/c/old", 1));
        store.put(entry("/c/new", 3));
        store.put(entry("/c/mid-b", 2));
        store.put(entry("/c/mid-a", 2));

        let order: Vec<_> = store
            .snapshot_by_recency()
            .into_iter()
            .map(|e| e.local_path)
            .collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/c/new"),
                PathBuf::from("/c/mid-a"),
                PathBuf::from("/c/mid-b"),
                PathBuf::from("/c/old"),
            ]
        );
    }

    #[test]
    fn test_guard_is_exclusive_per_path() {
        let store = CacheStore::new();
        store.put(entry("/c/a", 1));
        store.put(entry("/c/b", 1));

        let guard = store.begin(Path::new("/c/a"), SyncPhase::Pulling).unwrap();
        assert!(store.begin(Path::new("/c/a"), SyncPhase::Pushing).is_none());
        // 其他路径不受影响
        assert!(store.begin(Path::new("/c/b"), SyncPhase::Pushing).is_some());
        assert!(!store.accepts_event(Path::new("/c/a")));

        drop(guard);
        assert_eq!(store.phase(Path::new("/c/a")), SyncPhase::Idle);
        // 静默期内仍忽略事件
        assert!(!store.accepts_event(Path::new("/c/a")));
        assert!(store.begin(Path::new("/c/a"), SyncPhase::Pushing).is_some());
    }

    #[test]
    fn test_events_accepted_right_after_push() {
        let store = CacheStore::new();
        store.put(entry("/c/a", 1));

        let guard = store.begin(Path::new("/c/a"), SyncPhase::Pushing).unwrap();
        assert!(!store.accepts_event(Path::new("/c/a")));
        drop(guard);
        // 推送后用户立即保存的事件不能丢
        assert!(store.accepts_event(Path::new("/c/a")));
    }

    #[test]
    fn test_removed_paths_release_phase_slots() {
        let store = CacheStore::new();
        store.put(entry("/c/a", 1));
        store.put(entry("/c/b", 1));
        store.put(entry("/c/c", 1));

        drop(store.begin(Path::new("/c/a"), SyncPhase::Pulling).unwrap());
        drop(store.begin(Path::new("/c/b"), SyncPhase::Pulling).unwrap());
        let busy = store.begin(Path::new("/c/c"), SyncPhase::Pulling).unwrap();
        assert_eq!(store.phase_slots(), 3);

        store.remove(Path::new("/c/a"));
        assert_eq!(store.phase_slots(), 2);
        store.clear();
        // 进行中的操作仍保留自己的记录，守卫释放后再清理
        assert_eq!(store.phase_slots(), 1);
        assert!(store.is_busy(Path::new("/c/c")));
        drop(busy);
        assert_eq!(store.phase_slots(), 0);
    }

    #[test]
    fn test_events_for_untracked_paths_are_dropped() {
        let store = CacheStore::new();
        store.put(entry("/c/a", 1));
        assert!(store.accepts_event(Path::new("/c/a")));
        assert!(!store.accepts_event(Path::new("/c/other")));
    }
}
