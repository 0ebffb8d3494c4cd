//! 会话存储
//!
//! `SessionStore` 是上传会话与持久化介质之间的接口：
//! - `FileSessionStore`：快照 + WAL 文件（默认）
//! - `MemorySessionStore`：进程内存（测试与无需续传的场景）

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::recovery::{cleanup_expired_sessions, load_session, merge_wal};
use super::snapshot::{delete_session_files, save_snapshot, scan_session_ids};
use super::types::{PersistedSession, WalRecord};
use super::wal::append_records;
use crate::error::{UploadError, UploadResult};

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 保存完整快照
    async fn save(&self, session: &PersistedSession) -> UploadResult<()>;

    /// 记录一个分片上传成功（增量）
    async fn record_part(&self, session_id: &str, part_number: u32, etag: &str)
        -> UploadResult<()>;

    /// 加载会话（包含所有已记录的分片）
    async fn load(&self, session_id: &str) -> UploadResult<Option<PersistedSession>>;

    /// 删除会话
    async fn remove(&self, session_id: &str) -> UploadResult<()>;

    /// 列出所有会话
    async fn list(&self) -> UploadResult<Vec<PersistedSession>>;
}

// ============================================================================
// FileSessionStore
// ============================================================================

/// 基于文件的会话存储
///
/// 文件 I/O 在阻塞线程池中执行；同一进程内的写操作通过互斥锁串行化
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 清理超过保留天数的会话，返回被清理的会话
    pub async fn cleanup_expired(&self, retention_days: u64) -> UploadResult<Vec<PersistedSession>> {
        self.blocking(move |dir| cleanup_expired_sessions(dir, retention_days))
            .await
    }

    async fn blocking<T, F>(&self, f: F) -> UploadResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> std::io::Result<T> + Send + 'static,
    {
        let dir = self.dir.clone();
        let lock = self.write_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            f(&dir)
        })
        .await
        .map_err(|e| UploadError::persistence(format!("session store task failed: {}", e)))?
        .map_err(|e| UploadError::persistence(e.to_string()))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session: &PersistedSession) -> UploadResult<()> {
        let session = session.clone();
        self.blocking(move |dir| save_snapshot(dir, &session)).await
    }

    async fn record_part(
        &self,
        session_id: &str,
        part_number: u32,
        etag: &str,
    ) -> UploadResult<()> {
        let session_id = session_id.to_string();
        let record = WalRecord::new(part_number, etag);
        self.blocking(move |dir| append_records(dir, &session_id, &[record]))
            .await
    }

    async fn load(&self, session_id: &str) -> UploadResult<Option<PersistedSession>> {
        let session_id = session_id.to_string();
        self.blocking(move |dir| load_session(dir, &session_id)).await
    }

    async fn remove(&self, session_id: &str) -> UploadResult<()> {
        let session_id = session_id.to_string();
        let deleted = self
            .blocking(move |dir| delete_session_files(dir, &session_id))
            .await?;
        debug!("已删除 {} 个会话文件", deleted);
        Ok(())
    }

    async fn list(&self) -> UploadResult<Vec<PersistedSession>> {
        self.blocking(|dir| {
            let mut sessions = Vec::new();
            for id in scan_session_ids(dir)? {
                match load_session(dir, &id) {
                    Ok(Some(session)) => sessions.push(session),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("会话 {} 加载失败，已跳过: {}", id, e),
                }
            }
            Ok(sessions)
        })
        .await
    }
}

// ============================================================================
// MemorySessionStore
// ============================================================================

/// 内存会话存储
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, PersistedSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &PersistedSession) -> UploadResult<()> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn record_part(
        &self,
        session_id: &str,
        part_number: u32,
        etag: &str,
    ) -> UploadResult<()> {
        let mut entry = self.sessions.get_mut(session_id).ok_or_else(|| {
            UploadError::persistence(format!("session {} does not exist", session_id))
        })?;
        merge_wal(entry.value_mut(), &[WalRecord::new(part_number, etag)]);
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn load(&self, session_id: &str) -> UploadResult<Option<PersistedSession>> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn remove(&self, session_id: &str) -> UploadResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> UploadResult<Vec<PersistedSession>> {
        let mut sessions: Vec<PersistedSession> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }
}
