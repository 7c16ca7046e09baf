use super::{
    operator_read, operator_write, ByteStream, RemoteId, RemoteStorage, TruncateStrategy,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use anyhow::Result;
use async_trait::async_trait;
use opendal::{layers::TimeoutLayer, Operator};
use std::time::Duration;

pub struct S3Storage {
    prefix: String,
    operator: Operator,
    name: String,
}

impl S3Storage {
    pub fn new(
        prefix: &str,
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!("s3://{}", bucket);

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
        Ok(key.trim_start_matches('/').to_string())
    }
}

#[async_trait]
impl RemoteStorage for S3Storage {
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
        operator_write(&self.operator, &self.key(id)?, stream).await
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        // S3 删除不存在的文件不会报错
        self.operator.delete(&self.key(id)?).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
