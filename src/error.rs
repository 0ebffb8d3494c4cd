//! 错误类型定义
//!
//! - `StorageError`：存储后端（远端对象存储或本地目录）返回的错误
//! - `ConfigError`：分片上传配置校验失败
//! - `UploadError`：上传编排层向调用方暴露的错误，带稳定的数字错误码

use std::fmt;
use thiserror::Error;

/// 上传编排层的 Result 别名
pub type UploadResult<T> = Result<T, UploadError>;

// ============================================================================
// 存储后端错误
// ============================================================================

/// 存储后端错误类型
///
/// 用于判断分片失败后是否值得重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// 网络错误（连接失败、连接重置等）
    Network,
    /// 请求超时
    Timeout,
    /// 服务端 5xx
    ServerError,
    /// 被限流
    RateLimited,
    /// 对象不存在
    NotFound,
    /// 无权限
    Forbidden,
    /// 请求参数错误
    BadRequest,
    /// 远端找不到该 upload_id（已过期或已中止）
    UploadNotFound,
    /// 配额不足
    QuotaExceeded,
    /// 本地文件读取失败
    LocalIo,
    /// 未分类错误
    Unknown,
}

impl StorageErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::Network
                | StorageErrorKind::Timeout
                | StorageErrorKind::ServerError
                | StorageErrorKind::RateLimited
                | StorageErrorKind::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorKind::Network => "network",
            StorageErrorKind::Timeout => "timeout",
            StorageErrorKind::ServerError => "server_error",
            StorageErrorKind::RateLimited => "rate_limited",
            StorageErrorKind::NotFound => "not_found",
            StorageErrorKind::Forbidden => "forbidden",
            StorageErrorKind::BadRequest => "bad_request",
            StorageErrorKind::UploadNotFound => "upload_not_found",
            StorageErrorKind::QuotaExceeded => "quota_exceeded",
            StorageErrorKind::LocalIo => "local_io",
            StorageErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 存储后端返回的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Network, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::BadRequest, message)
    }

    pub fn upload_not_found(upload_id: &str) -> Self {
        Self::new(
            StorageErrorKind::UploadNotFound,
            format!("upload {} does not exist", upload_id),
        )
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::Forbidden,
            _ => StorageErrorKind::LocalIo,
        };
        Self::new(kind, e.to_string())
    }
}

// ============================================================================
// 配置错误
// ============================================================================

/// 配置校验错误，指明出错字段和违反的约束
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// 上传错误
// ============================================================================

/// 失败分片摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPart {
    pub part_number: u32,
    pub retry_count: u32,
    pub error: Option<StorageError>,
}

impl fmt::Display for FailedPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(e) => write!(f, "part {} ({})", self.part_number, e),
            None => write!(f, "part {}", self.part_number),
        }
    }
}

fn join_failed(parts: &[FailedPart]) -> String {
    parts
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// 上传编排错误
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("too many chunks: {count} exceeds the limit of {max}")]
    TooManyChunks { count: u64, max: u64 },

    #[error("failed to initiate multipart upload for {key}: {source}")]
    Initiation {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("{completed}/{total} parts uploaded for {upload_id}, failed: {}", join_failed(.failed))]
    PartialFailure {
        upload_id: String,
        completed: usize,
        total: usize,
        failed: Vec<FailedPart>,
    },

    #[error("failed to complete multipart upload {upload_id}: {source}")]
    Completion {
        upload_id: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to abort multipart upload {upload_id}: {source}")]
    Abort {
        upload_id: String,
        #[source]
        source: StorageError,
    },

    #[error("upload {upload_id} timed out with {} parts pending", .remaining.len())]
    Timeout {
        upload_id: String,
        remaining: Vec<u32>,
    },

    #[error("upload {upload_id} cancelled with {} parts pending", .remaining.len())]
    Cancelled {
        upload_id: String,
        remaining: Vec<u32>,
    },

    #[error("cannot {operation} a session in state {state}")]
    InvalidState { state: String, operation: String },

    #[error("simple upload of {key} failed: {source}")]
    SimpleUpload {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session persistence error: {message}")]
    Persistence { message: String },
}

impl UploadError {
    /// 稳定的数字错误码
    pub fn code(&self) -> u32 {
        match self {
            UploadError::Initiation { .. } => 1001,
            UploadError::Completion { .. } => 1003,
            UploadError::Abort { .. } => 1004,
            UploadError::Configuration(_) | UploadError::InvalidPlan(_) => 1005,
            UploadError::TooManyChunks { .. } => 1006,
            UploadError::PartialFailure { .. } => 1007,
            UploadError::Timeout { .. } => 1008,
            UploadError::Cancelled { .. } => 1009,
            UploadError::InvalidState { .. } => 1010,
            UploadError::SimpleUpload { .. } => 1011,
            UploadError::Io(_) => 1012,
            UploadError::Persistence { .. } => 1013,
        }
    }

    /// 调用方重新发起是否可能成功
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Initiation { source, .. }
            | UploadError::Completion { source, .. }
            | UploadError::SimpleUpload { source, .. } => source.is_retriable(),
            UploadError::PartialFailure { .. }
            | UploadError::Timeout { .. }
            | UploadError::Cancelled { .. } => true,
            _ => false,
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        UploadError::Persistence {
            message: message.into(),
        }
    }
}
