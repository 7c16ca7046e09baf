//! 应用配置模块

use crate::core::digest::DigestAlgorithm;
use crate::core::eviction::MIN_ENTRIES;
use crate::core::policy::{CheckMode, ProviderRule, ProviderTable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

/// 同步配置（`config.json` 中的 `sync` 节）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// 缓存根目录
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// 推送失败时的备份目录
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// 最大缓存条目数，最小 100
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// 普通提供方的检查模式
    #[serde(default)]
    pub check_mode: CheckMode,
    /// 云存储提供方的检查模式
    #[serde(default)]
    pub cloud_check_mode: CheckMode,
    /// 远程文档被删除时是否请求确认
    #[serde(default)]
    pub delete_confirmation: bool,
    /// 哈希算法名称: "blake3" | "none"
    #[serde(default = "default_digest")]
    pub digest: String,
    /// 写入后校验的延迟（毫秒）
    #[serde(default = "default_write_check_delay_ms")]
    pub write_check_delay_ms: u64,
    /// 单次传输超时（秒），0 表示不限制
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// 提供方规则，按顺序匹配
    #[serde(default = "ProviderTable::default_rules")]
    pub providers: Vec<ProviderRule>,
    /// 状态文件名（相对配置目录）
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_cache_dir() -> PathBuf {
    crate::dirs::cache_dir()
        .map(|p| p.join("cachesync").join("documents"))
        .unwrap_or_else(|| PathBuf::from(".cachesync/documents"))
}

fn default_backup_dir() -> PathBuf {
    crate::dirs::data_dir()
        .map(|p| p.join("cachesync").join("backup"))
        .unwrap_or_else(|| PathBuf::from(".cachesync/backup"))
}

fn default_max_entries() -> usize {
    300
}

fn default_digest() -> String {
    "blake3".to_string()
}

fn default_write_check_delay_ms() -> u64 {
    3000
}

fn default_transfer_timeout_secs() -> u64 {
    300
}

fn default_state_file() -> String {
    "cache_state.json".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            backup_dir: default_backup_dir(),
            max_entries: default_max_entries(),
            check_mode: CheckMode::NONE,
            cloud_check_mode: CheckMode::NONE,
            delete_confirmation: false,
            digest: default_digest(),
            write_check_delay_ms: default_write_check_delay_ms(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            providers: ProviderTable::default_rules(),
            state_file: default_state_file(),
        }
    }
}

impl SyncConfig {
    /// 从配置文件加载同步配置，读取失败时使用默认值
    pub fn load(config_dir: &Path) -> Self {
        let mut config = read_section::<SyncConfig>(config_dir, "sync").unwrap_or_default();
        config.set_max_entries(config.max_entries);
        config
    }

    /// 保存同步配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "sync", self)
    }

    /// 设置最大条目数（低于下限时取下限）
    pub fn set_max_entries(&mut self, max_entries: usize) {
        if max_entries < MIN_ENTRIES {
            tracing::warn!("maxEntries={} 低于下限，使用 {}", max_entries, MIN_ENTRIES);
        }
        self.max_entries = max_entries.max(MIN_ENTRIES);
    }

    /// 解析哈希算法，未知名称时进入禁用哈希模式
    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        match self.digest.parse() {
            Ok(alg) => alg,
            Err(e) => {
                tracing::warn!("{}，所有哈希比较将视为未知", e);
                DigestAlgorithm::Disabled
            }
        }
    }

    pub fn provider_table(&self) -> ProviderTable {
        ProviderTable::new(self.providers.clone(), self.check_mode, self.cloud_check_mode)
    }

    pub fn state_path(&self, config_dir: &Path) -> PathBuf {
        config_dir.join(&self.state_file)
    }
}

/// 存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
    WebDav,
}

/// 远程存储配置（`config.json` 中的 `storages` 列表）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    /// 本存储负责的定位符前缀，例如 `s3://my-bucket`
    pub prefix: String,
    // Local
    pub path: Option<String>,
    // S3
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    // S3 / WebDAV
    pub endpoint: Option<String>,
    // WebDAV
    pub username: Option<String>,
    pub password: Option<String>,
    pub root: Option<String>,
}

impl StorageConfig {
    /// 加载存储列表，缺失或损坏时返回空列表
    pub fn load_all(config_dir: &Path) -> Vec<StorageConfig> {
        read_section::<Vec<StorageConfig>>(config_dir, "storages").unwrap_or_default()
    }

    pub fn save_all(configs: &[StorageConfig], config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "storages", &configs)
    }
}

fn read_section<T: serde::de::DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    let section = config.get(key)?;
    match serde_json::from_value::<T>(section.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("配置节 {} 解析失败，使用默认值: {}", key, e);
            None
        }
    }
}

fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[key] = serde_json::to_value(value)?;

    fs::create_dir_all(config_dir)?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
}
