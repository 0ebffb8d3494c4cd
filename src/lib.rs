// Cloudfile Uploader Library
// 对象存储分片上传核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 会话持久化模块（断点续传）
pub mod persistence;

// 上传模块
pub mod uploader;

// 导出常用类型
pub use config::{chunk::ChunkUploadConfig, AppConfig};
pub use error::{StorageError, StorageErrorKind, UploadError, UploadResult};
pub use persistence::{FileSessionStore, MemorySessionStore, PersistedSession, SessionStore};
pub use uploader::{
    resume_upload, should_use_chunked_upload, upload_file, ChunkState, ConcurrencyScheduler,
    LocalDirBackend, MultipartSession, SessionOutcome, SessionState, StorageBackend, UploadReceipt,
    Uploader,
};
