//! 文件监听适配器
//!
//! 把底层文件系统通知转换成三种语义事件，并过滤掉未跟踪或正在传输的路径。

use super::store::CacheStore;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// 缓存文件事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Opened(PathBuf),
    ClosedAfterWrite(PathBuf),
    Deleted(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Opened(p) | WatchEvent::ClosedAfterWrite(p) | WatchEvent::Deleted(p) => p,
        }
    }
}

/// 把 notify 事件映射为语义事件
pub fn classify(event: &Event) -> Vec<WatchEvent> {
    match event.kind {
        EventKind::Access(AccessKind::Open(_)) => {
            event.paths.iter().cloned().map(WatchEvent::Opened).collect()
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => event
            .paths
            .iter()
            .cloned()
            .map(WatchEvent::ClosedAfterWrite)
            .collect(),
        // 编辑器常用"写临时文件再改名"保存
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .first()
            .cloned()
            .map(WatchEvent::ClosedAfterWrite)
            .into_iter()
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .last()
            .cloned()
            .map(WatchEvent::ClosedAfterWrite)
            .into_iter()
            .collect(),
        // 没有关闭事件的平台上，以数据修改代替
        #[cfg(not(target_os = "linux"))]
        EventKind::Modify(ModifyKind::Data(_)) => event
            .paths
            .iter()
            .cloned()
            .map(WatchEvent::ClosedAfterWrite)
            .collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(WatchEvent::Deleted).collect(),
        _ => Vec::new(),
    }
}

/// 缓存目录与外部跟踪路径的监听器
pub struct CacheWatcher {
    watcher: Mutex<RecommendedWatcher>,
    watched: Mutex<HashMap<PathBuf, RecursiveMode>>,
}

impl CacheWatcher {
    /// 创建监听器，事件经过滤后发送到 `tx`
    pub fn new(store: CacheStore, tx: mpsc::UnboundedSender<WatchEvent>) -> notify::Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for ev in classify(&event) {
                    if !store.accepts_event(ev.path()) {
                        continue;
                    }
                    if tx.send(ev).is_err() {
                        debug!("文件事件接收端已关闭");
                        return;
                    }
                }
            }
            Err(e) => error!("文件监听错误: {}", e),
        })?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            watched: Mutex::new(HashMap::new()),
        })
    }

    /// 递归监听缓存根目录（重复调用无副作用）
    pub fn watch_root(&self, root: &Path) -> notify::Result<()> {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if watched.contains_key(root) {
            return Ok(());
        }
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch(root, RecursiveMode::Recursive)?;
        watched.insert(root.to_path_buf(), RecursiveMode::Recursive);
        debug!("监听缓存目录: {:?}", root);
        Ok(())
    }

    /// 监听缓存目录之外的单个文件
    ///
    /// 文件被替换后原监听失效，因此总是先取消再重新监听。
    pub fn watch_file(&self, path: &Path) -> notify::Result<()> {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watched.remove(path).is_some() {
            let _ = watcher.unwatch(path);
        }
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        watched.insert(path.to_path_buf(), RecursiveMode::NonRecursive);
        debug!("监听外部文件: {:?}", path);
        Ok(())
    }

    pub fn unwatch(&self, path: &Path) {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if watched.remove(path).is_some() {
            if let Err(e) = self
                .watcher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .unwatch(path)
            {
                warn!("取消监听失败 {:?}: {}", path, e);
            }
        }
    }

    pub fn unwatch_all(&self) {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        for (path, _) in watched.drain() {
            let _ = watcher.unwatch(&path);
        }
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut ev = Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        ev
    }

    #[test]
    fn test_classify() {
        let open = event(EventKind::Access(AccessKind::Open(AccessMode::Any)), &["/c/a"]);
        assert_eq!(classify(&open), vec![WatchEvent::Opened("/c/a".into())]);

        let close = event(EventKind::Access(AccessKind::Close(AccessMode::Write)), &["/c/a"]);
        assert_eq!(classify(&close), vec![WatchEvent::ClosedAfterWrite("/c/a".into())]);

        let rename = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/c/.a.swp", "/c/a"],
        );
        assert_eq!(classify(&rename), vec![WatchEvent::ClosedAfterWrite("/c/a".into())]);

        let remove = event(EventKind::Remove(RemoveKind::File), &["/c/a"]);
        assert_eq!(classify(&remove), vec![WatchEvent::Deleted("/c/a".into())]);
    }

    #[test]
    fn test_classify_ignores_other_events() {
        let create = event(EventKind::Create(CreateKind::File), &["/c/a"]);
        assert!(classify(&create).is_empty());

        let close_read = event(EventKind::Access(AccessKind::Close(AccessMode::Read)), &["/c/a"]);
        assert!(classify(&close_read).is_empty());
    }

    #[tokio::test]
    async fn test_watch_bookkeeping() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("outside.txt");
        std::fs::write(&file, b"x").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let watcher = CacheWatcher::new(CacheStore::new(), tx).unwrap();

        watcher.watch_root(dir.path()).unwrap();
        watcher.watch_root(dir.path()).unwrap();
        watcher.watch_file(&file).unwrap();
        watcher.watch_file(&file).unwrap();
        assert!(watcher.is_watching(dir.path()));
        assert!(watcher.is_watching(&file));

        watcher.unwatch(&file);
        assert!(!watcher.is_watching(&file));
        watcher.unwatch_all();
        assert!(!watcher.is_watching(dir.path()));
    }
}
