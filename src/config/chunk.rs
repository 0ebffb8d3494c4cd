//! 分片上传配置
//!
//! 构造时校验所有字段，任何越界值都会直接返回 `ConfigError`，从不静默截断。

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// 分片大小下限 5MB（对象存储的最小分片限制）
pub const MIN_CHUNK_SIZE: u64 = 5 * MIB;
/// 分片大小上限 1GB
pub const MAX_CHUNK_SIZE: u64 = GIB;
pub const MIN_CONCURRENCY: u32 = 1;
pub const MAX_CONCURRENCY: u32 = 10;

pub const DEFAULT_CHUNK_SIZE: u64 = 10 * MIB;
pub const DEFAULT_THRESHOLD: u64 = 20 * MIB;
pub const DEFAULT_MAX_CONCURRENCY: u32 = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// `from_map` / `to_map` 使用的键
pub const KEY_CHUNK_SIZE: &str = "chunk_size";
pub const KEY_THRESHOLD: &str = "threshold";
pub const KEY_MAX_CONCURRENCY: &str = "max_concurrency";
pub const KEY_MAX_RETRIES: &str = "max_retries";
pub const KEY_RETRY_DELAY: &str = "retry_delay";
pub const KEY_TIMEOUT: &str = "timeout";

const KNOWN_KEYS: [&str; 6] = [
    KEY_CHUNK_SIZE,
    KEY_THRESHOLD,
    KEY_MAX_CONCURRENCY,
    KEY_MAX_RETRIES,
    KEY_RETRY_DELAY,
    KEY_TIMEOUT,
];

/// 分片上传配置（构造后不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkUploadConfig {
    chunk_size: u64,
    threshold: u64,
    max_concurrency: u32,
    max_retries: u32,
    retry_delay_ms: u64,
    timeout_secs: u64,
}

impl ChunkUploadConfig {
    /// 创建并校验配置
    ///
    /// # 参数
    /// * `chunk_size` - 分片大小（字节），范围 [5MB, 1GB]
    /// * `threshold` - 启用分片上传的文件大小阈值（字节）
    /// * `max_concurrency` - 最大并发分片数，范围 [1, 10]
    /// * `max_retries` - 单个分片失败后的最大重试次数
    /// * `retry_delay_ms` - 重试退避的基础延迟（毫秒）
    /// * `timeout_secs` - 整个会话的超时时间（秒），至少 1
    pub fn new(
        chunk_size: u64,
        threshold: u64,
        max_concurrency: u32,
        max_retries: u32,
        retry_delay_ms: u64,
        timeout_secs: u64,
    ) -> Result<Self, ConfigError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(ConfigError::new(
                KEY_CHUNK_SIZE,
                format!(
                    "{} is outside [{}, {}] bytes",
                    chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
                ),
            ));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&max_concurrency) {
            return Err(ConfigError::new(
                KEY_MAX_CONCURRENCY,
                format!(
                    "{} is outside [{}, {}]",
                    max_concurrency, MIN_CONCURRENCY, MAX_CONCURRENCY
                ),
            ));
        }
        if timeout_secs < 1 {
            return Err(ConfigError::new(KEY_TIMEOUT, "must be at least 1 second"));
        }

        Ok(Self {
            chunk_size,
            threshold,
            max_concurrency,
            max_retries,
            retry_delay_ms,
            timeout_secs,
        })
    }

    /// 默认配置：10MB 分片、20MB 阈值、并发 3、重试 3 次、1s 退避、300s 超时
    pub fn from_defaults() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            threshold: DEFAULT_THRESHOLD,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// 在默认值之上覆盖给定键，然后校验
    ///
    /// 未知键与负数都会被拒绝
    pub fn from_map(map: &BTreeMap<String, i64>) -> Result<Self, ConfigError> {
        if let Some(unknown) = map.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            return Err(ConfigError::new(unknown.clone(), "unknown configuration key"));
        }

        let defaults = Self::from_defaults();
        let chunk_size = read_u64(map, KEY_CHUNK_SIZE, defaults.chunk_size)?;
        let threshold = read_u64(map, KEY_THRESHOLD, defaults.threshold)?;
        let max_concurrency = read_u32(map, KEY_MAX_CONCURRENCY, defaults.max_concurrency)?;
        let max_retries = read_u32(map, KEY_MAX_RETRIES, defaults.max_retries)?;
        let retry_delay_ms = read_u64(map, KEY_RETRY_DELAY, defaults.retry_delay_ms)?;
        let timeout_secs = read_u64(map, KEY_TIMEOUT, defaults.timeout_secs)?;

        Self::new(
            chunk_size,
            threshold,
            max_concurrency,
            max_retries,
            retry_delay_ms,
            timeout_secs,
        )
    }

    /// 导出为扁平 map（与 `from_map` 互逆）
    pub fn to_map(&self) -> BTreeMap<String, i64> {
        let clamp = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        let mut map = BTreeMap::new();
        map.insert(KEY_CHUNK_SIZE.to_string(), clamp(self.chunk_size));
        map.insert(KEY_THRESHOLD.to_string(), clamp(self.threshold));
        map.insert(
            KEY_MAX_CONCURRENCY.to_string(),
            i64::from(self.max_concurrency),
        );
        map.insert(KEY_MAX_RETRIES.to_string(), i64::from(self.max_retries));
        map.insert(KEY_RETRY_DELAY.to_string(), clamp(self.retry_delay_ms));
        map.insert(KEY_TIMEOUT.to_string(), clamp(self.timeout_secs));
        map
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.retry_delay_ms
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// 文件大小达到阈值时走分片上传，否则走简单上传
    pub fn should_use_chunked_upload(&self, file_size: u64) -> bool {
        file_size >= self.threshold
    }
}

impl Default for ChunkUploadConfig {
    fn default() -> Self {
        Self::from_defaults()
    }
}

fn read_i64(map: &BTreeMap<String, i64>, key: &str) -> Result<Option<i64>, ConfigError> {
    match map.get(key) {
        Some(v) if *v < 0 => Err(ConfigError::new(key, format!("{} must be >= 0", v))),
        other => Ok(other.copied()),
    }
}

fn read_u64(map: &BTreeMap<String, i64>, key: &str, default: u64) -> Result<u64, ConfigError> {
    Ok(read_i64(map, key)?.map(|v| v as u64).unwrap_or(default))
}

fn read_u32(map: &BTreeMap<String, i64>, key: &str, default: u32) -> Result<u32, ConfigError> {
    match read_i64(map, key)? {
        Some(v) => u32::try_from(v)
            .map_err(|_| ConfigError::new(key, format!("{} does not fit in 32 bits", v))),
        None => Ok(default),
    }
}
