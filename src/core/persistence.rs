//! 跟踪状态持久化
//!
//! 状态文件格式：`{"version":1,"entries":[{path, remoteId, hash, lastAccessTime}]}`。
//! 恢复时逐条解析，单条损坏只跳过该条；整个文件缺失或损坏视为空存储。

use super::digest::ContentHash;
use super::store::{CacheEntry, CacheStore};
use crate::error::{Result, SyncError};
use crate::storage::RemoteId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRecord {
    path: PathBuf,
    remote_id: RemoteId,
    hash: ContentHash,
    last_access_time: i64,
}

impl From<CacheEntry> for StateRecord {
    fn from(e: CacheEntry) -> Self {
        Self {
            path: e.local_path,
            remote_id: e.remote_id,
            hash: e.content_hash,
            last_access_time: e.last_access,
        }
    }
}

impl From<StateRecord> for CacheEntry {
    fn from(r: StateRecord) -> Self {
        Self {
            remote_id: r.remote_id,
            local_path: r.path,
            content_hash: r.hash,
            last_access: r.last_access_time,
        }
    }
}

#[derive(Serialize)]
struct StateDocument {
    version: u32,
    entries: Vec<StateRecord>,
}

/// 恢复结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
}

/// 状态文件
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 写入全部条目（先写临时文件再改名）
    pub fn save(&self, store: &CacheStore) -> Result<usize> {
        // 最近使用的在前，便于人工查看
        let entries: Vec<StateRecord> = store
            .snapshot_by_recency()
            .into_iter()
            .map(StateRecord::from)
            .collect();
        let count = entries.len();

        let doc = StateDocument {
            version: STATE_VERSION,
            entries,
        };
        let content = serde_json::to_string_pretty(&doc)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!("已保存 {} 个缓存条目到 {:?}", count, self.path);
        Ok(count)
    }

    /// 恢复条目到存储中，任何错误都不会中断启动
    pub fn restore(&self, store: &CacheStore) -> RestoreReport {
        let mut report = RestoreReport::default();

        let records = match self.read_records() {
            Ok(records) => records,
            Err(e) => {
                warn!("{}，按空缓存启动", e);
                return report;
            }
        };

        for (index, value) in records.into_iter().enumerate() {
            match serde_json::from_value::<StateRecord>(value) {
                Ok(record) if record.path.is_absolute() => {
                    store.put(record.into());
                    report.restored += 1;
                }
                Ok(record) => {
                    warn!("跳过第 {} 条记录：路径不是绝对路径 {:?}", index, record.path);
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!("跳过第 {} 条损坏的记录: {}", index, e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "已恢复 {} 个缓存条目（跳过 {} 条）",
            report.restored, report.skipped
        );
        report
    }

    fn read_records(&self) -> Result<Vec<serde_json::Value>> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            SyncError::Persistence(format!("无法读取状态文件 {:?}: {}", self.path, e))
        })?;
        let doc: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| SyncError::Persistence(format!("状态文件格式错误: {}", e)))?;

        match doc {
            serde_json::Value::Object(mut map) => match map.remove("entries") {
                Some(serde_json::Value::Array(entries)) => Ok(entries),
                _ => Err(SyncError::Persistence("状态文件缺少 entries 列表".to_string())),
            },
            // 兼容直接保存的记录列表
            serde_json::Value::Array(entries) => Ok(entries),
            _ => Err(SyncError::Persistence("状态文件格式错误".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::{hash_bytes, DigestAlgorithm};

    fn sample_store(root: &Path) -> CacheStore {
        let store = CacheStore::new();
        store.put(CacheEntry {
            remote_id: RemoteId::new("s3://bucket/a.txt"),
            local_path: root.join("a.txt"),
            content_hash: hash_bytes(b"a", DigestAlgorithm::Blake3),
            last_access: 10,
        });
        store.put(CacheEntry {
            remote_id: RemoteId::new("webdav://host/b.txt"),
            local_path: root.join("sub").join("b.txt"),
            content_hash: ContentHash::Unavailable,
            last_access: 20,
        });
        store
    }

    fn sorted(store: &CacheStore) -> Vec<CacheEntry> {
        let mut entries = store.snapshot_by_recency();
        entries.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        entries
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sample_store(dir.path());
        let state = StateFile::new(dir.path().join("state.json"));
        assert_eq!(state.save(&store).unwrap(), 2);

        let restored = CacheStore::new();
        let report = state.restore(&restored);
        assert_eq!(report, RestoreReport { restored: 2, skipped: 0 });
        assert_eq!(sorted(&restored), sorted(&store));
    }

    #[test]
    fn test_saved_in_recency_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sample_store(dir.path());
        store.put(CacheEntry {
            remote_id: RemoteId::new("s3://bucket/0.txt"),
            local_path: dir.path().join("0.txt"),
            content_hash: ContentHash::Unavailable,
            last_access: 10,
        });
        let state = StateFile::new(dir.path().join("state.json"));
        state.save(&store).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(state.path()).unwrap()).unwrap();
        let paths: Vec<PathBuf> = doc["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| PathBuf::from(r["path"].as_str().unwrap()))
            .collect();
        // 时间相同按路径排列
        assert_eq!(
            paths,
            vec![
                dir.path().join("sub").join("b.txt"),
                dir.path().join("0.txt"),
                dir.path().join("a.txt"),
            ]
        );
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sample_store(dir.path());
        let state = StateFile::new(dir.path().join("state.json"));
        state.save(&store).unwrap();

        // 注入损坏的记录
        let mut doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(state.path()).unwrap()).unwrap();
        let entries = doc["entries"].as_array_mut().unwrap();
        entries.push(serde_json::json!({"path": "/x", "remoteId": 42}));
        entries.push(serde_json::json!("garbage"));
        entries.push(serde_json::json!({
            "path": "relative.txt", "remoteId": "s3://b/r", "hash": "HASH_ERROR", "lastAccessTime": 1
        }));
        fs::write(state.path(), doc.to_string()).unwrap();

        let restored = CacheStore::new();
        let report = state.restore(&restored);
        assert_eq!(report, RestoreReport { restored: 2, skipped: 3 });
        assert_eq!(sorted(&restored), sorted(&store));
    }

    #[test]
    fn test_missing_or_corrupt_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = CacheStore::new();

        let missing = StateFile::new(dir.path().join("none.json"));
        assert_eq!(missing.restore(&store), RestoreReport::default());

        let corrupt_path = dir.path().join("corrupt.json");
        fs::write(&corrupt_path, b"{not json").unwrap();
        assert_eq!(StateFile::new(corrupt_path).restore(&store), RestoreReport::default());
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_store_still_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join("state.json"));
        assert_eq!(state.save(&CacheStore::new()).unwrap(), 0);

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(state.path()).unwrap()).unwrap();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["entries"], serde_json::json!([]));
    }
}
