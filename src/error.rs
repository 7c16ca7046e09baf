//! 错误类型

use std::path::PathBuf;
use thiserror::Error;

/// 缓存同步错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// Pull/Push 传输失败（哈希保持不变或置为失败标记）
    #[error("传输失败 {path:?}: {message}")]
    Transfer { path: PathBuf, message: String },

    /// 哈希算法不可用，进入禁用哈希模式
    #[error("哈希算法不可用: {0}")]
    DigestUnavailable(String),

    /// 远程内容在上次同步后被外部修改
    #[error("远程内容已被修改 {path:?} ({remote})")]
    Conflict { path: PathBuf, remote: String },

    /// 写入后校验不一致
    #[error("写入校验失败 {path:?} ({remote})")]
    WriteIntegrity { path: PathBuf, remote: String },

    /// 状态文件损坏或缺失
    #[error("状态文件错误: {0}")]
    Persistence(String),

    /// 淘汰缓存时删除文件失败
    #[error("删除缓存文件失败 {path:?}: {source}")]
    EvictionIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("操作已取消: {0:?}")]
    Cancelled(PathBuf),

    #[error("操作超时: {0:?}")]
    TimedOut(PathBuf),

    #[error("未跟踪的路径: {0:?}")]
    NotTracked(PathBuf),

    /// 该路径正在进行另一个同步操作
    #[error("路径正在同步中: {0:?}")]
    Busy(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn transfer(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        SyncError::Transfer {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// 取消和超时按失败处理，但不修改条目哈希
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SyncError::Cancelled(_) | SyncError::TimedOut(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
