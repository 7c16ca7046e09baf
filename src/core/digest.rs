//! 内容哈希 - 所有传输路径共用的流式摘要

use crate::error::SyncError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

/// 读取缓冲区大小
const READ_BUF_SIZE: usize = 64 * 1024;

/// 失败标记的序列化值
const UNAVAILABLE: &str = "HASH_ERROR";

/// 内容哈希
///
/// `Unavailable` 表示哈希计算失败或哈希已禁用，它与任何值（包括自身）都不相等。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ContentHash {
    Known(String),
    Unavailable,
}

impl ContentHash {
    /// 两个哈希都可用且相同时才认为一致
    pub fn matches(&self, other: &ContentHash) -> bool {
        match (self, other) {
            (ContentHash::Known(a), ContentHash::Known(b)) => a == b,
            _ => false,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ContentHash::Known(_))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentHash::Known(hex) => f.write_str(hex),
            ContentHash::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

impl From<String> for ContentHash {
    fn from(s: String) -> Self {
        if s.is_empty() || s == UNAVAILABLE {
            ContentHash::Unavailable
        } else {
            ContentHash::Known(s)
        }
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.to_string()
    }
}

/// 哈希算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DigestAlgorithm {
    #[default]
    Blake3,
    /// 禁用哈希：所有比较都视为"未知"
    Disabled,
}

impl FromStr for DigestAlgorithm {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blake3" => Ok(DigestAlgorithm::Blake3),
            "none" | "disabled" => Ok(DigestAlgorithm::Disabled),
            other => Err(SyncError::DigestUnavailable(other.to_string())),
        }
    }
}

impl TryFrom<String> for DigestAlgorithm {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DigestAlgorithm> for String {
    fn from(a: DigestAlgorithm) -> Self {
        match a {
            DigestAlgorithm::Blake3 => "blake3".to_string(),
            DigestAlgorithm::Disabled => "none".to_string(),
        }
    }
}

/// 增量摘要
pub struct ContentDigest {
    hasher: Option<blake3::Hasher>,
    len: u64,
}

impl ContentDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let hasher = match algorithm {
            DigestAlgorithm::Blake3 => Some(blake3::Hasher::new()),
            DigestAlgorithm::Disabled => None,
        };
        Self { hasher, len: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(data);
        }
        self.len += data.len() as u64;
    }

    /// 已处理的字节数
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(&self) -> ContentHash {
        match &self.hasher {
            Some(hasher) => ContentHash::Known(hasher.finalize().to_hex().to_string()),
            None => ContentHash::Unavailable,
        }
    }
}

/// 一次性计算内存数据的哈希
pub fn hash_bytes(data: &[u8], algorithm: DigestAlgorithm) -> ContentHash {
    let mut digest = ContentDigest::new(algorithm);
    digest.update(data);
    digest.finalize()
}

/// 流式计算本地文件哈希
pub async fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> std::io::Result<ContentHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digest = ContentDigest::new(algorithm);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finalize())
}

/// 远程内容的摘要结果
#[derive(Debug, Clone)]
pub struct StreamDigest {
    pub hash: ContentHash,
    pub len: u64,
}

impl StreamDigest {
    /// 没有读到任何内容；读到内容但哈希未知时不算空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 消耗整个字节流并计算哈希，读取中途出错时哈希为 `Unavailable`
pub async fn hash_stream<S>(mut stream: S, algorithm: DigestAlgorithm) -> StreamDigest
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    let mut digest = ContentDigest::new(algorithm);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => digest.update(&bytes),
            Err(e) => {
                tracing::debug!("读取远程内容失败: {}", e);
                return StreamDigest {
                    hash: ContentHash::Unavailable,
                    len: digest.len(),
                };
            }
        }
    }
    StreamDigest {
        hash: digest.finalize(),
        len: digest.len(),
    }
}
