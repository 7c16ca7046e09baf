//! 缓存淘汰策略
//!
//! 条目数超过上限时按访问时间淘汰最久未用的约四分之一，只保留 `floor((n-1)*3/4) + 1` 个。

use super::store::{CacheEntry, CacheStore};
use super::watcher::CacheWatcher;
use crate::error::SyncError;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 最大条目数的下限
pub const MIN_ENTRIES: usize = 100;

/// 淘汰结果
#[derive(Debug, Default, Clone)]
pub struct EvictionReport {
    /// 已从存储中移除的路径
    pub evicted: Vec<PathBuf>,
    /// 条目已移除但文件删除失败的路径
    pub orphaned: Vec<PathBuf>,
    /// 因传输进行中而跳过的路径
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    max_entries: usize,
}

impl EvictionPolicy {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(MIN_ENTRIES),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn needs_eviction(&self, count: usize) -> bool {
        count > self.max_entries
    }

    /// 在按新到旧排好的列表中选出要淘汰的条目（排名 `min+1..=size`）
    pub fn select_victims(ranked: &[CacheEntry]) -> &[CacheEntry] {
        if ranked.len() < 2 {
            return &[];
        }
        let size = ranked.len() - 1;
        let min_size = size * 3 / 4;
        &ranked[min_size + 1..=size]
    }

    /// 条目过多时执行淘汰
    ///
    /// 只删除缓存根目录下的文件；外部跟踪路径只停止监听并移除条目。
    pub fn evict(
        &self,
        store: &CacheStore,
        watcher: Option<&CacheWatcher>,
        cache_root: &Path,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        let count = store.len();
        if !self.needs_eviction(count) {
            return report;
        }

        let ranked = store.snapshot_by_recency();
        let victims = Self::select_victims(&ranked);
        debug!("缓存条目 {} 超过上限 {}，淘汰 {} 个", count, self.max_entries, victims.len());

        for entry in victims {
            let path = &entry.local_path;
            if store.is_busy(path) {
                report.skipped.push(path.clone());
                continue;
            }

            if let Some(w) = watcher {
                w.unwatch(path);
            }

            if path.starts_with(cache_root) {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        let err = SyncError::EvictionIo {
                            path: path.clone(),
                            source: e,
                        };
                        warn!("{}", err);
                        report.orphaned.push(path.clone());
                    }
                }
            }

            store.remove(path);
            report.evicted.push(path.clone());
        }

        prune_empty_dirs(cache_root);

        info!(
            "缓存淘汰完成: 移除 {} 个, 残留文件 {} 个, 跳过 {} 个",
            report.evicted.len(),
            report.orphaned.len(),
            report.skipped.len()
        );
        report
    }
}

/// 递归删除缓存根目录下的空目录（不删除根目录本身）
pub fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            // 非空目录删除失败，忽略
            if std::fs::remove_dir(entry.path()).is_ok() {
                debug!("删除空目录: {:?}", entry.path());
            }
        }
    }
}
