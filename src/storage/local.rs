use super::{ByteStream, RemoteId, RemoteStorage, TruncateStrategy};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// 本地文件定位符前缀
pub const FILE_PREFIX: &str = "file://";

/// 本地文件系统上的"远程"文档
///
/// 没有 `base_path` 时键必须是绝对路径（`file:///home/u/a.txt`）。
pub struct LocalStorage {
    prefix: String,
    base_path: Option<PathBuf>,
    name: String,
}

impl LocalStorage {
    pub fn new(prefix: &str, path: Option<&str>) -> Result<Self> {
        let base_path = match path {
            Some(p) => {
                let base = PathBuf::from(p);
                if !base.exists() {
                    std::fs::create_dir_all(&base)?;
                }
                Some(base)
            }
            None => None,
        };
        let name = format!("local:{}", prefix);
        Ok(Self {
            prefix: prefix.to_string(),
            base_path,
            name,
        })
    }

    fn resolve_path(&self, id: &RemoteId) -> Result<PathBuf> {
        let key = id
            .key_under(&self.prefix)
            .ok_or_else(|| anyhow::anyhow!("定位符不属于本存储: {}", id))?;
        match &self.base_path {
            Some(base) => {
                let key = key.trim_start_matches('/').trim_start_matches('\\');
                Ok(if key.is_empty() { base.clone() } else { base.join(key) })
            }
            None => {
                let path = PathBuf::from(&key);
                if !path.is_absolute() {
                    anyhow::bail!("本地定位符需要绝对路径: {}", id);
                }
                Ok(path)
            }
        }
    }
}

#[async_trait]
impl RemoteStorage for LocalStorage {
    fn handles(&self, id: &RemoteId) -> bool {
        id.key_under(&self.prefix).is_some()
    }

    async fn open_read(&self, id: &RemoteId) -> Result<ByteStream> {
        let file = fs::File::open(self.resolve_path(id)?).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn write_stream(
        &self,
        id: &RemoteId,
        truncate: TruncateStrategy,
        mut stream: ByteStream,
    ) -> Result<u64> {
        let full_path = self.resolve_path(id)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = match truncate {
            TruncateStrategy::Reopen => {
                fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&full_path)
                    .await?
            }
            TruncateStrategy::Channel => {
                let file = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&full_path)
                    .await?;
                file.set_len(0).await?;
                file
            }
        };

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(written)
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        let full_path = self.resolve_path(id)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn stream_of(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn test_write_with_both_truncate_strategies() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = LocalStorage::new("file://", None).unwrap();
        let path = dir.path().join("sub").join("doc.txt");
        let id = RemoteId::new(format!("file://{}", path.display()));

        storage
            .write_stream(&id, TruncateStrategy::Reopen, stream_of(b"a long first version"))
            .await
            .unwrap();
        let n = storage
            .write_stream(&id, TruncateStrategy::Channel, stream_of(b"short"))
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"short");

        storage
            .write_stream(&id, TruncateStrategy::Reopen, stream_of(b"x"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_base_path_and_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().to_str().unwrap();
        let storage = LocalStorage::new("file://share", Some(base)).unwrap();
        let id = RemoteId::new("file://share/notes/a%20b.txt");
        assert!(storage.handles(&id));

        storage
            .write_stream(&id, TruncateStrategy::Reopen, stream_of(b"hi"))
            .await
            .unwrap();
        assert!(dir.path().join("notes").join("a b.txt").exists());

        storage.delete(&id).await.unwrap();
        assert!(!dir.path().join("notes").join("a b.txt").exists());
        // 删除不存在的文件不报错
        storage.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_relative_key_rejected_without_base() {
        let storage = LocalStorage::new("file://", None).unwrap();
        let id = RemoteId::new("file://relative/path.txt");
        assert!(storage.open_read(&id).await.is_err());
    }
}
