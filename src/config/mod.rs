// 配置管理模块

pub mod chunk;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::ConfigError;
pub use chunk::ChunkUploadConfig;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 分片上传配置
    #[serde(default)]
    pub upload: UploadSection,
    /// 会话持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// `[upload]` 配置段
///
/// 未填写的字段使用 `ChunkUploadConfig` 的默认值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSection {
    /// 分片大小（字节）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<i64>,
    /// 分片上传阈值（字节）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,
    /// 最大并发分片数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<i64>,
    /// 单分片最大重试次数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    /// 重试基础延迟（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<i64>,
    /// 会话超时（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

impl UploadSection {
    /// 转换为经过校验的 `ChunkUploadConfig`
    pub fn to_chunk_config(&self) -> Result<ChunkUploadConfig, ConfigError> {
        let mut map = BTreeMap::new();
        let entries = [
            (chunk::KEY_CHUNK_SIZE, self.chunk_size),
            (chunk::KEY_THRESHOLD, self.threshold),
            (chunk::KEY_MAX_CONCURRENCY, self.max_concurrency),
            (chunk::KEY_MAX_RETRIES, self.max_retries),
            (chunk::KEY_RETRY_DELAY, self.retry_delay),
            (chunk::KEY_TIMEOUT, self.timeout),
        ];
        for (key, value) in entries {
            if let Some(v) = value {
                map.insert(key.to_string(), v);
            }
        }
        ChunkUploadConfig::from_map(&map)
    }

    /// 从已校验的配置生成完整配置段
    pub fn from_chunk_config(config: &ChunkUploadConfig) -> Self {
        let map = config.to_map();
        let get = |key: &str| map.get(key).copied();
        Self {
            chunk_size: get(chunk::KEY_CHUNK_SIZE),
            threshold: get(chunk::KEY_THRESHOLD),
            max_concurrency: get(chunk::KEY_MAX_CONCURRENCY),
            max_retries: get(chunk::KEY_MAX_RETRIES),
            retry_delay: get(chunk::KEY_RETRY_DELAY),
            timeout: get(chunk::KEY_TIMEOUT),
        }
    }
}

/// 会话持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 会话快照与 WAL 所在目录
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    /// 启动时是否扫描会话目录：清理无效会话，报告可续传与等待中止的会话
    ///
    /// 只做扫描，续传由 `resume` 命令执行
    #[serde(default = "default_scan_on_startup", alias = "auto_resume")]
    pub scan_on_startup: bool,
    /// 会话保留天数，超期的未完成会话会被清理
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: u64,
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_scan_on_startup() -> bool {
    true
}

fn default_session_retention_days() -> u64 {
    7
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            scan_on_startup: default_scan_on_startup(),
            session_retention_days: default_session_retention_days(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    ///
    /// `[upload]` 段会立即按分片配置的边界校验
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .to_chunk_config()
            .context("配置文件中的 [upload] 段校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 仅在文件不存在时写出默认配置，避免覆盖用户写错的文件
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }

    /// 分片上传配置
    pub fn chunk_config(&self) -> Result<ChunkUploadConfig> {
        self.upload
            .to_chunk_config()
            .context("invalid [upload] section")
    }
}
