//! 日志模块 - 提供文件日志和大小管理功能

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志文件名
pub const LOG_FILE: &str = "cachesync.log";

/// 日志配置（`config.json` 中的 `log` 节）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB），范围 1..=100
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        let mut config = fs::read_to_string(config_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value::<LogConfig>(log).ok())
            .unwrap_or_default();
        config.max_size_mb = config.max_size_mb.clamp(1, 100);
        config
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb as u64 * 1024 * 1024
    }
}

/// 带大小限制的日志文件
///
/// 超过上限时把当前文件改名为 `.old` 后重新打开，只保留一份旧日志。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE);

        let mut this = Self {
            file_path,
            max_size,
            written: 0,
            writer: None,
        };
        this.open()?;
        Ok(this)
    }

    fn open(&mut self) -> io::Result<()> {
        // 现有文件已超过上限则先轮转
        let existing = fs::metadata(&self.file_path).map(|m| m.len()).unwrap_or(0);
        if existing > self.max_size {
            self.rotate_file()?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        self.file_path.with_extension("log.old")
    }

    fn rotate_file(&self) -> io::Result<()> {
        let backup_path = self.backup_path();
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(&self.file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }
        self.rotate_file()?;
        self.open()
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > self.max_size {
            self.rotate()?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("Writer not available"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// 初始化日志系统，返回的守卫需要保持到进程退出
pub fn init(log_dir: &Path) -> Option<WorkerGuard> {
    let config = LogConfig::load(log_dir);

    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    // 创建日志级别过滤器
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["hyper=warn", "reqwest=warn", "opendal=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    // 在 debug 模式下也输出到控制台
    let console_layer = cfg!(debug_assertions).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    match SizeRotatingWriter::new(log_dir, config.max_size_bytes()) {
        Ok(file_writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .try_init();
            tracing::warn!("无法创建日志文件 {:?}: {}", log_dir, e);
            None
        }
    }
}
