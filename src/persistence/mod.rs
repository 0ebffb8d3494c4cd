//! 会话持久化模块
//!
//! 该模块负责分片上传会话的持久化和恢复，包括：
//! - 会话快照：记录会话基本信息和全部分片状态
//! - WAL (Write-Ahead Log) 日志：分片上传成功后立即追加记录
//! - 断点恢复：程序重启后合并快照与 WAL，继续未完成的会话
//!
//! ## 文件结构
//!
//! ```text
//! sessions/
//! ├── {session_id}.session  # 会话快照（JSON 格式）
//! └── {session_id}.wal      # WAL 日志（行格式，每行一个分片）
//! ```

pub mod recovery;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod wal;

pub use recovery::{
    cleanup_expired_sessions, cleanup_invalid_sessions, load_session, merge_wal,
    scan_recoverable_sessions, RecoveryScanResult,
};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use types::{PersistedSession, WalRecord};
