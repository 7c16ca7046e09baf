pub mod local;
pub mod s3;
pub mod webdav;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

pub use local::LocalStorage;
pub use s3::S3Storage;
pub use webdav::WebDavStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远程内容字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// 远程文档定位符（`scheme://authority/path`）
///
/// 定位符只标识一个文档，不会被复用到另一个文档上。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 协议部分，例如 `s3`、`file`
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// 去掉存储前缀后的键（已做百分号解码），前缀不匹配时返回 None
    pub fn key_under(&self, prefix: &str) -> Option<String> {
        let rest = self.0.strip_prefix(prefix)?;
        // 前缀必须在路径分隔处结束
        if !(prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/')) {
            return None;
        }
        let decoded = urlencoding::decode(rest).ok()?;
        Some(decoded.into_owned())
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 写入时的截断方式
///
/// 有些提供方打开写句柄时不会按打开标志截断，需要先通过通道截断再写入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncateStrategy {
    /// 以截断标志重新打开
    #[default]
    #[serde(alias = "reopen-with-truncate")]
    Reopen,
    /// 打开后先截断通道再写入
    #[serde(alias = "truncate-via-channel")]
    Channel,
}

/// 远程内容通道
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// 是否负责该定位符
    fn handles(&self, id: &RemoteId) -> bool;

    /// 打开读取通道
    async fn open_read(&self, id: &RemoteId) -> Result<ByteStream>;

    /// 将字节流写入远程文档，返回写入的字节数
    async fn write_stream(
        &self,
        id: &RemoteId,
        truncate: TruncateStrategy,
        stream: ByteStream,
    ) -> Result<u64>;

    /// 删除远程文档
    async fn delete(&self, id: &RemoteId) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 按定位符分派到具体存储
pub struct StorageRouter {
    backends: Vec<Arc<dyn RemoteStorage>>,
    name: String,
}

impl StorageRouter {
    pub fn new(backends: Vec<Arc<dyn RemoteStorage>>) -> Self {
        let name = backends
            .iter()
            .map(|b| b.name())
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            backends,
            name: format!("router[{}]", name),
        }
    }

    fn route(&self, id: &RemoteId) -> Result<&Arc<dyn RemoteStorage>> {
        self.backends
            .iter()
            .find(|b| b.handles(id))
            .ok_or_else(|| anyhow::anyhow!("没有可处理该定位符的存储: {}", id))
    }
}

#[async_trait]
impl RemoteStorage for StorageRouter {
    fn handles(&self, id: &RemoteId) -> bool {
        self.backends.iter().any(|b| b.handles(id))
    }

    async fn open_read(&self, id: &RemoteId) -> Result<ByteStream> {
        self.route(id)?.open_read(id).await
    }

    async fn write_stream(
        &self,
        id: &RemoteId,
        truncate: TruncateStrategy,
        stream: ByteStream,
    ) -> Result<u64> {
        self.route(id)?.write_stream(id, truncate, stream).await
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        self.route(id)?.delete(id).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// opendal 对象读取：一次取回整个对象
async fn operator_read(operator: &opendal::Operator, key: &str) -> Result<ByteStream> {
    let data = operator.read(key).await?;
    let bytes = data.to_bytes();
    Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
}

/// opendal 对象写入：对象存储总是整体替换，截断方式无影响
async fn operator_write(operator: &opendal::Operator, key: &str, mut stream: ByteStream) -> Result<u64> {
    use futures::StreamExt;

    let mut writer = operator.writer(key).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        };
        written += chunk.len() as u64;
        if let Err(e) = writer.write(chunk).await {
            let _ = writer.abort().await;
            return Err(e.into());
        }
    }
    writer.close().await?;
    Ok(written)
}

/// 根据配置创建存储实例
pub async fn create_storage(config: &crate::config::StorageConfig) -> Result<Arc<dyn RemoteStorage>> {
    use crate::config::StorageType;

    match config.typ {
        StorageType::Local => {
            tracing::info!("初始化本地存储: {} -> {:?}", config.prefix, config.path);
            Ok(Arc::new(LocalStorage::new(&config.prefix, config.path.as_deref())?)
                as Arc<dyn RemoteStorage>)
        }
        StorageType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(S3Storage::new(
                &config.prefix,
                bucket,
                region,
                access_key,
                secret_key,
                config.endpoint.clone(),
                config.root.clone(),
            )?) as Arc<dyn RemoteStorage>)
        }
        StorageType::WebDav => {
            let endpoint = config
                .endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires endpoint"))?;
            tracing::info!("初始化WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            Ok(Arc::new(WebDavStorage::new(
                &config.prefix,
                endpoint,
                config.username.as_deref(),
                config.password.as_deref(),
                config.root.clone(),
            )?) as Arc<dyn RemoteStorage>)
        }
    }
}

/// 根据配置列表创建路由；没有配置任何存储时使用本地 `file://` 存储
pub async fn create_router(configs: &[crate::config::StorageConfig]) -> Result<Arc<StorageRouter>> {
    let mut backends = Vec::with_capacity(configs.len().max(1));
    for config in configs {
        backends.push(create_storage(config).await?);
    }
    if backends.is_empty() {
        backends.push(Arc::new(LocalStorage::new(local::FILE_PREFIX, None)?) as Arc<dyn RemoteStorage>);
    }
    Ok(Arc::new(StorageRouter::new(backends)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_under_prefix() {
        let id = RemoteId::new("s3://bucket/docs/my%20notes.txt");
        assert_eq!(id.scheme(), Some("s3"));
        assert_eq!(id.key_under("s3://bucket").as_deref(), Some("/docs/my notes.txt"));
        assert_eq!(id.key_under("s3://bucket/").as_deref(), Some("docs/my notes.txt"));
        // 前缀必须落在路径分隔处
        assert_eq!(id.key_under("s3://buck"), None);
        assert_eq!(id.key_under("webdav://bucket"), None);
    }

    #[test]
    fn test_truncate_strategy_aliases() {
        let s: TruncateStrategy = serde_json::from_str("\"truncate-via-channel\"").unwrap();
        assert_eq!(s, TruncateStrategy::Channel);
        let s: TruncateStrategy = serde_json::from_str("\"reopen\"").unwrap();
        assert_eq!(s, TruncateStrategy::Reopen);
    }

    #[tokio::test]
    async fn test_router_dispatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = LocalStorage::new("file://", None).unwrap();
        let router = StorageRouter::new(vec![Arc::new(local)]);

        let path = dir.path().join("doc.txt");
        std::fs::write(&path, b"abc").unwrap();
        let id = RemoteId::new(format!("file://{}", path.display()));
        assert!(router.handles(&id));

        let stream = router.open_read(&id).await.unwrap();
        let digest = crate::core::digest::hash_stream(stream, Default::default()).await;
        assert_eq!(digest.len, 3);

        let other = RemoteId::new("s3://bucket/a");
        assert!(!router.handles(&other));
        assert!(router.open_read(&other).await.is_err());
    }
}
