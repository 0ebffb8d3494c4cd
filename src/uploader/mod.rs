// 上传模块
//
// - 分片规划与分片状态（chunk）
// - 有界并发调度 + 指数退避重试（scheduler / backoff）
// - 分片上传会话状态机（session）
// - 存储后端接口与本地目录实现（backend / local）
//
// 小于阈值的文件直接单次上传，其余走分片上传会话

pub mod backend;
pub mod backoff;
pub mod chunk;
pub mod local;
pub mod progress;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{ObjectHead, StorageBackend};
pub use backoff::calculate_backoff_delay;
pub use chunk::{plan_chunks, Chunk, ChunkRoster, ChunkState, CompletePart, MAX_PART_COUNT};
pub use local::LocalDirBackend;
pub use progress::{LoggingProgress, NoopProgress, UploadProgressListener};
pub use scheduler::{ConcurrencyScheduler, SchedulerOutcome, SchedulerReport};
pub use session::{
    FailureReason, MultipartSession, SessionOutcome, SessionState, UploadMode, UploadReceipt,
    DEFAULT_CONTENT_TYPE,
};

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::chunk::ChunkUploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::persistence::{PersistedSession, SessionStore};

/// 文件大小达到阈值时走分片上传
pub fn should_use_chunked_upload(file_size: u64, config: &ChunkUploadConfig) -> bool {
    config.should_use_chunked_upload(file_size)
}

/// 上传本地文件（无持久化）
pub async fn upload_file(
    local_path: impl AsRef<Path>,
    key: &str,
    config: ChunkUploadConfig,
    backend: Arc<dyn StorageBackend>,
) -> UploadResult<UploadReceipt> {
    Uploader::new(backend, config)
        .upload_file(local_path, key)
        .await
}

/// 续传一个已持久化的会话
pub async fn resume_upload(
    persisted: PersistedSession,
    backend: Arc<dyn StorageBackend>,
) -> UploadResult<UploadReceipt> {
    Uploader::new(backend, ChunkUploadConfig::from_defaults())
        .resume_upload(persisted)
        .await
}

/// 上传器
///
/// 持有存储后端、分片配置与可选的会话存储。
/// 配置了会话存储时，失败的会话保留给后续续传；否则分片层面的失败会中止远端上传。
pub struct Uploader {
    backend: Arc<dyn StorageBackend>,
    config: ChunkUploadConfig,
    store: Option<Arc<dyn SessionStore>>,
    listener: Arc<dyn UploadProgressListener>,
    cancel_token: CancellationToken,
}

impl Uploader {
    pub fn new(backend: Arc<dyn StorageBackend>, config: ChunkUploadConfig) -> Self {
        Self {
            backend,
            config,
            store: None,
            listener: Arc::new(NoopProgress),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn UploadProgressListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn config(&self) -> &ChunkUploadConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// 上传文件，类型为 `application/octet-stream`
    pub async fn upload_file(
        &self,
        local_path: impl AsRef<Path>,
        key: &str,
    ) -> UploadResult<UploadReceipt> {
        self.upload_file_with_content_type(local_path, key, DEFAULT_CONTENT_TYPE)
            .await
    }

    /// 上传文件
    ///
    /// # 参数
    /// * `local_path` - 本地文件
    /// * `key` - 目标对象 key
    /// * `content_type` - 对象类型
    ///
    /// # 返回
    /// 成功时返回对象位置与分片清单（单次上传时清单为空）
    pub async fn upload_file_with_content_type(
        &self,
        local_path: impl AsRef<Path>,
        key: &str,
        content_type: &str,
    ) -> UploadResult<UploadReceipt> {
        let local_path = local_path.as_ref();
        let file_size = tokio::fs::metadata(local_path).await?.len();

        if file_size == 0 || !self.config.should_use_chunked_upload(file_size) {
            return self
                .simple_upload(local_path, key, content_type, file_size)
                .await;
        }

        info!(
            "文件 {:?} ({} bytes) 达到分片阈值 {}，使用分片上传",
            local_path,
            file_size,
            self.config.threshold()
        );
        let session =
            MultipartSession::create(local_path, key, self.config, self.backend.clone())
                .await?
                .with_content_type(content_type);
        self.drive(self.attach(session)).await
    }

    /// 续传已持久化的会话
    pub async fn resume_upload(&self, persisted: PersistedSession) -> UploadResult<UploadReceipt> {
        let session = MultipartSession::from_persisted(persisted, self.backend.clone()).await?;
        self.drive(self.attach(session)).await
    }

    /// 按会话 ID 从会话存储中续传
    pub async fn resume_by_id(&self, session_id: &str) -> UploadResult<UploadReceipt> {
        let persisted = self.load_persisted(session_id).await?;
        self.resume_upload(persisted).await
    }

    /// 续传会话存储中的所有会话
    ///
    /// # 返回
    /// 每个会话的 (session_id, 结果)
    pub async fn resume_all(&self) -> UploadResult<Vec<(String, UploadResult<UploadReceipt>)>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        for persisted in store.list().await? {
            let session_id = persisted.session_id.clone();
            info!("自动续传会话: session_id={}, key={}", session_id, persisted.key);
            let result = self.resume_upload(persisted).await;
            if let Err(e) = &result {
                warn!("会话 {} 续传失败: {}", session_id, e);
            }
            results.push((session_id, result));
        }
        Ok(results)
    }

    /// 中止会话存储中的会话并删除持久化记录
    ///
    /// 不要求本地源文件仍然存在。远端中止失败时会话被标记为等待中止，
    /// 之后只能再次中止，不能续传。
    pub async fn abort_session(&self, session_id: &str) -> UploadResult<()> {
        let mut persisted = self.load_persisted(session_id).await?;

        if !persisted.upload_id.is_empty() {
            if let Err(source) = self.backend.abort(&persisted.upload_id).await {
                error!(
                    "中止会话失败: session_id={}, upload_id={}, 错误: {}",
                    session_id, persisted.upload_id, source
                );
                if !persisted.abort_requested {
                    persisted.abort_requested = true;
                    if let Some(store) = &self.store {
                        if let Err(e) = store.save(&persisted).await {
                            warn!("保存中止请求失败: session_id={}, 错误: {}", session_id, e);
                        }
                    }
                }
                return Err(UploadError::Abort {
                    upload_id: persisted.upload_id,
                    source,
                });
            }
        }

        if let Some(store) = &self.store {
            store.remove(session_id).await?;
        }
        info!(
            "已中止会话: session_id={}, upload_id={}",
            session_id, persisted.upload_id
        );
        Ok(())
    }

    // ========================================================================
    // 内部实现
    // ========================================================================

    fn attach(&self, mut session: MultipartSession) -> MultipartSession {
        if let Some(store) = &self.store {
            session = session.with_store(store.clone());
        }
        session
            .with_listener(self.listener.clone())
            .with_cancel_token(self.cancel_token.clone())
    }

    async fn load_persisted(&self, session_id: &str) -> UploadResult<PersistedSession> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| UploadError::persistence("no session store configured"))?;
        store
            .load(session_id)
            .await?
            .ok_or_else(|| UploadError::persistence(format!("session {} not found", session_id)))
    }

    /// 运行会话并把结果转换为回执或错误
    async fn drive(&self, mut session: MultipartSession) -> UploadResult<UploadReceipt> {
        let reason = match session.run().await? {
            SessionOutcome::Completed(receipt) => return Ok(receipt),
            SessionOutcome::Failed(reason) => reason,
        };

        // 没有会话存储就无法续传，分片层面的失败直接中止远端上传
        if self.store.is_none() && reason.is_chunk_failure() {
            if let Err(e) = session.abort().await {
                error!("会话失败后中止远端上传失败: {}", e);
            }
        }

        let upload_id = session.upload_id().unwrap_or_default().to_string();
        Err(reason.into_error(
            &upload_id,
            session.roster().completed_count(),
            session.roster().chunk_count(),
        ))
    }

    /// 单次上传整个文件
    async fn simple_upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        file_size: u64,
    ) -> UploadResult<UploadReceipt> {
        info!(
            "文件 {:?} ({} bytes) 小于分片阈值，使用单次上传",
            local_path, file_size
        );
        let data = tokio::fs::read(local_path).await?;
        let location = self
            .backend
            .put(key, data, content_type)
            .await
            .map_err(|source| {
                error!("单次上传失败: key={}, 错误: {}", key, source);
                UploadError::SimpleUpload {
                    key: key.to_string(),
                    source,
                }
            })?;

        Ok(UploadReceipt {
            key: key.to_string(),
            location,
            upload_id: None,
            parts: Vec::new(),
            size: file_size,
            mode: UploadMode::Simple,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::chunk::MIB;
    use crate::error::StorageErrorKind;
    use crate::persistence::{FileSessionStore, MemorySessionStore};
    use crate::uploader::testing::{pattern_bytes, pattern_file, ScriptedBackend};
    use tempfile::TempDir;

    fn config() -> ChunkUploadConfig {
        ChunkUploadConfig::new(10 * MIB, 20 * MIB, 3, 3, 1, 60).unwrap()
    }

    #[test]
    fn test_dispatch_decision() {
        let cfg = config();
        assert!(!should_use_chunked_upload(20 * MIB - 1, &cfg));
        assert!(should_use_chunked_upload(20 * MIB, &cfg));
    }

    #[tokio::test]
    async fn test_upload_25mib_in_three_parts() {
        let size = 25 * 1024 * 1024;
        let file = pattern_file(size);
        let backend = Arc::new(ScriptedBackend::new());

        let receipt = upload_file(file.path(), "big.bin", config(), backend.clone())
            .await
            .unwrap();

        assert_eq!(receipt.mode, UploadMode::Multipart);
        assert_eq!(receipt.parts.len(), 3);
        assert_eq!(receipt.location, "mem://big.bin");
        assert_eq!(backend.object("big.bin").unwrap(), pattern_bytes(size));
        assert_eq!(backend.put_calls(), 0);
    }

    #[tokio::test]
    async fn test_small_file_uses_simple_path() {
        let file = pattern_file(1024);
        let backend = Arc::new(ScriptedBackend::new());

        let receipt = upload_file(file.path(), "small.bin", config(), backend.clone())
            .await
            .unwrap();

        assert_eq!(receipt.mode, UploadMode::Simple);
        assert!(receipt.parts.is_empty());
        assert!(receipt.upload_id.is_none());
        assert_eq!(backend.put_calls(), 1);
        assert_eq!(backend.initiate_calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_file_uses_simple_path() {
        let file = pattern_file(0);
        let backend = Arc::new(ScriptedBackend::new());
        let receipt = upload_file(file.path(), "empty", config(), backend.clone())
            .await
            .unwrap();
        assert_eq!(receipt.size, 0);
        assert_eq!(backend.put_calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_without_store_aborts() {
        let file = pattern_file(25 * 1024 * 1024);
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_part(3, usize::MAX, StorageErrorKind::ServerError);

        let err = upload_file(file.path(), "big.bin", config(), backend.clone())
            .await
            .unwrap_err();

        let UploadError::PartialFailure {
            completed,
            total,
            failed,
            ..
        } = &err
        else {
            panic!("expected partial failure, got {}", err);
        };
        assert_eq!((*completed, *total), (2, 3));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].part_number, 3);
        assert_eq!(failed[0].retry_count, 4);
        assert!(failed[0].error.is_some());
        assert_eq!(err.code(), 1007);
        assert_eq!(backend.complete_calls(), 0);
        assert_eq!(backend.abort_calls(), 1);
    }

    #[tokio::test]
    async fn test_completion_failure_never_aborts() {
        let file = pattern_file(25 * 1024 * 1024);
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_complete(1, StorageErrorKind::ServerError);

        let err = upload_file(file.path(), "big.bin", config(), backend.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 1003);
        assert!(err.is_retriable());
        assert_eq!(backend.abort_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_session_is_kept_and_resumed_by_id() {
        let file = pattern_file(25 * 1024 * 1024);
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_part(2, 1, StorageErrorKind::Forbidden);
        let store = Arc::new(FileSessionStore::new(dir.path()));
        let uploader = Uploader::new(backend.clone(), config()).with_store(store.clone());

        let err = uploader.upload_file(file.path(), "big.bin").await.unwrap_err();
        assert_eq!(err.code(), 1007);
        assert_eq!(backend.abort_calls(), 0);

        let sessions = store.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].pending_parts(), vec![2]);

        let receipt = uploader
            .resume_by_id(&sessions[0].session_id)
            .await
            .unwrap();
        assert_eq!(receipt.parts.len(), 3);
        assert_eq!(backend.part_attempts(1), 1);
        assert_eq!(backend.part_attempts(2), 2);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_upload_free_function() {
        let file = pattern_file(25 * 1024 * 1024);
        let backend = Arc::new(ScriptedBackend::new());
        let store = Arc::new(MemorySessionStore::new());
        backend.fail_part(1, 1, StorageErrorKind::Forbidden);

        let uploader = Uploader::new(backend.clone(), config()).with_store(store.clone());
        assert!(uploader.upload_file(file.path(), "big.bin").await.is_err());

        let persisted = store.list().await.unwrap().remove(0);
        let receipt = resume_upload(persisted, backend.clone()).await.unwrap();
        assert_eq!(
            receipt.parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(backend.part_attempts(3), 1);
    }

    #[tokio::test]
    async fn test_abort_session_by_id() {
        let file = pattern_file(25 * 1024 * 1024);
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_part(1, usize::MAX, StorageErrorKind::Forbidden);
        let store = Arc::new(MemorySessionStore::new());
        let uploader = Uploader::new(backend.clone(), config()).with_store(store.clone());

        assert!(uploader.upload_file(file.path(), "big.bin").await.is_err());
        let session_id = store.list().await.unwrap()[0].session_id.clone();

        uploader.abort_session(&session_id).await.unwrap();
        assert_eq!(backend.abort_calls(), 1);
        assert!(store.is_empty());

        let err = uploader.abort_session(&session_id).await.unwrap_err();
        assert_eq!(err.code(), 1013);
    }

    #[tokio::test]
    async fn test_failed_abort_blocks_resume() {
        let file = pattern_file(25 * 1024 * 1024);
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_part(2, 1, StorageErrorKind::Forbidden);
        let store = Arc::new(MemorySessionStore::new());
        let uploader = Uploader::new(backend.clone(), config()).with_store(store.clone());

        assert!(uploader.upload_file(file.path(), "big.bin").await.is_err());
        let session_id = store.list().await.unwrap()[0].session_id.clone();

        backend.fail_abort(1, StorageErrorKind::ServerError);
        let err = uploader.abort_session(&session_id).await.unwrap_err();
        assert_eq!(err.code(), 1004);
        assert!(store.load(&session_id).await.unwrap().unwrap().abort_requested);

        let err = uploader.resume_by_id(&session_id).await.unwrap_err();
        assert_eq!(err.code(), 1010);
        let results = uploader.resume_all().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.as_ref().unwrap_err().code(), 1010);
        assert_eq!(backend.part_attempts(2), 1);
        assert_eq!(backend.complete_calls(), 0);

        uploader.abort_session(&session_id).await.unwrap();
        assert_eq!(backend.abort_calls(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_without_store_aborts() {
        let file = pattern_file(25 * 1024 * 1024);
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_part(1, std::time::Duration::from_millis(1500));
        let cfg = ChunkUploadConfig::new(10 * MIB, 20 * MIB, 1, 3, 1, 1).unwrap();

        let err = upload_file(file.path(), "big.bin", cfg, backend.clone())
            .await
            .unwrap_err();

        assert_eq!(err.code(), 1008);
        assert!(err.is_retriable());
        let UploadError::Timeout { remaining, .. } = &err else {
            panic!("expected timeout, got {}", err);
        };
        assert_eq!(remaining, &vec![2, 3]);
        assert_eq!(backend.part_attempts(1), 1);
        assert_eq!(backend.part_attempts(2), 0);
        assert_eq!(backend.complete_calls(), 0);
        assert_eq!(backend.abort_calls(), 1);
    }

    #[tokio::test]
    async fn test_initiation_failure_is_surfaced() {
        let file = pattern_file(25 * 1024 * 1024);
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_initiate(1, StorageErrorKind::RateLimited);

        let err = upload_file(file.path(), "big.bin", config(), backend.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 1001);
        assert!(err.is_retriable());
    }
}
