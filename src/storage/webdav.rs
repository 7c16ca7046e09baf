use super::{
    operator_read, operator_write, ByteStream, RemoteId, RemoteStorage, TruncateStrategy,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use anyhow::Result;
use async_trait::async_trait;
use opendal::{layers::TimeoutLayer, Operator};
use std::time::Duration;

pub struct WebDavStorage {
    prefix: String,
    operator: Operator,
    name: String,
}

impl WebDavStorage {
    pub fn new(
        prefix: &str,
        endpoint: &str,
        username: Option<&str>,
        password: Option<&str>,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default().endpoint(endpoint);

        if let Some(user) = username {
            builder = builder.username(user);
        }
        if let Some(pass) = password {
            builder = builder.password(pass);
        }
        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self {
            prefix: prefix.to_string(),
            operator,
            name,
        })
    }

    fn key(&self, id: &RemoteId) -> Result<String> {
        let key = id
            .key_under(&self.prefix)
            .ok_or_else(|| anyhow::anyhow!("定位符不属于本存储: {}", id))?;
        // 规范化路径
        Ok(key.replace('\\', "/").trim_start_matches('/').to_string())
    }

    /// 确保父目录存在（部分 WebDAV 服务器不会自动创建）
    async fn ensure_parent(&self, key: &str) {
        let Some(parent) = std::path::Path::new(key).parent() else {
            return;
        };
        let parent_str = parent.to_string_lossy().replace('\\', "/");
        if parent_str.is_empty() || parent_str == "." {
            return;
        }
        let mut current_path = String::new();
        for part in parent_str.split('/').filter(|s| !s.is_empty()) {
            current_path.push_str(part);
            current_path.push('/');
            // 忽略创建目录的错误（可能已存在）
            let _ = self.operator.create_dir(&current_path).await;
        }
    }
}

#[async_trait]
impl RemoteStorage for WebDavStorage {
    fn handles(&self, id: &RemoteId) -> bool {
        id.key_under(&self.prefix).is_some()
    }

    async fn open_read(&self, id: &RemoteId) -> Result<ByteStream> {
        operator_read(&self.operator, &self.key(id)?).await
    }

    async fn write_stream(
        &self,
        id: &RemoteId,
        _truncate: TruncateStrategy,
        stream: ByteStream,
    ) -> Result<u64> {
        let key = self.key(id)?;
        self.ensure_parent(&key).await;
        operator_write(&self.operator, &key, stream).await
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        match self.operator.delete(&self.key(id)?).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
