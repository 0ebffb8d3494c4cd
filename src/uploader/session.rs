//! 分片上传会话
//!
//! 一个会话对应一次远端 multipart upload，生命周期：
//!
//! ```text
//! Created ──initiate──▶ Initiated ──run──▶ InProgress ──▶ Completing ──▶ Completed
//!    │                      │                  │               │
//!    │                      └──────abort───────┴──▶ Aborting ──┼──▶ Aborted
//!    │                                         │               │
//!    └── 发起失败保持 Created                   └──▶ Failed ◀───┘
//! ```
//!
//! - 分片失败、超时、取消都会进入 `Failed`，可以 `retry_failed` 或 `abort`
//! - 合并失败不会自动中止远端上传，已上传的分片保留给调用方决定
//! - 中止失败后会话只允许再次中止，不能续传或合并
//! - 每次状态变化都会保存快照，分片成功时追加 WAL 记录

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::chunk::ChunkUploadConfig;
use crate::error::{FailedPart, StorageError, UploadError, UploadResult};
use crate::persistence::{PersistedSession, SessionStore};
use crate::uploader::backend::StorageBackend;
use crate::uploader::chunk::{plan_chunks, Chunk, ChunkRoster, ChunkState, CompletePart};
use crate::uploader::progress::{NoopProgress, UploadProgressListener};
use crate::uploader::scheduler::{ConcurrencyScheduler, SchedulerOutcome};

/// 默认对象类型
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const ABORT_PENDING: &str = "failed (abort pending)";

/// 会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 已创建，尚未在远端发起
    Created,
    /// 已发起，持有 upload_id
    Initiated,
    /// 分片上传中
    InProgress,
    /// 合并中
    Completing,
    /// 已完成
    Completed,
    /// 中止中
    Aborting,
    /// 已中止
    Aborted,
    /// 失败
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Initiated => "initiated",
            SessionState::InProgress => "in_progress",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Aborting => "aborting",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上传方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    Simple,
    Multipart,
}

/// 上传成功的回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub key: String,
    /// 后端返回的对象位置
    pub location: String,
    /// 分片上传时为远端 upload_id
    pub upload_id: Option<String>,
    /// 提交的分片清单（按分片号升序）
    pub parts: Vec<CompletePart>,
    pub size: u64,
    pub mode: UploadMode,
}

/// 会话失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// 部分分片耗尽重试
    PartialFailure { failed_chunks: Vec<ChunkState> },
    /// 会话超时
    TimedOut { remaining_chunks: Vec<ChunkState> },
    /// 被取消
    Cancelled { remaining_chunks: Vec<ChunkState> },
    /// 所有分片已上传，但合并失败
    Completion { error: StorageError },
    /// 调用方请求中止，但远端中止失败
    Abort { error: StorageError },
}

impl FailureReason {
    /// 转换为对外的错误类型
    pub fn into_error(self, upload_id: &str, completed: usize, total: usize) -> UploadError {
        let upload_id = upload_id.to_string();
        match self {
            FailureReason::PartialFailure { failed_chunks } => UploadError::PartialFailure {
                upload_id,
                completed,
                total,
                failed: failed_chunks
                    .iter()
                    .map(|c| FailedPart {
                        part_number: c.part_number(),
                        retry_count: c.retry_count(),
                        error: c.last_error().cloned(),
                    })
                    .collect(),
            },
            FailureReason::TimedOut { remaining_chunks } => UploadError::Timeout {
                upload_id,
                remaining: remaining_chunks.iter().map(|c| c.part_number()).collect(),
            },
            FailureReason::Cancelled { remaining_chunks } => UploadError::Cancelled {
                upload_id,
                remaining: remaining_chunks.iter().map(|c| c.part_number()).collect(),
            },
            FailureReason::Completion { error } => UploadError::Completion {
                upload_id,
                source: error,
            },
            FailureReason::Abort { error } => UploadError::Abort {
                upload_id,
                source: error,
            },
        }
    }

    /// 是否为分片层面的失败（可以通过重新派发分片恢复）
    pub fn is_chunk_failure(&self) -> bool {
        matches!(
            self,
            FailureReason::PartialFailure { .. }
                | FailureReason::TimedOut { .. }
                | FailureReason::Cancelled { .. }
        )
    }
}

/// 会话运行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(UploadReceipt),
    Failed(FailureReason),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed(_))
    }
}

/// 分片上传会话
pub struct MultipartSession {
    session_id: String,
    upload_id: Option<String>,
    key: String,
    local_path: PathBuf,
    content_type: String,
    file_size: u64,
    config: ChunkUploadConfig,
    roster: ChunkRoster,
    state: SessionState,
    last_failure: Option<FailureReason>,
    abort_requested: bool,
    created_at: DateTime<Utc>,
    backend: Arc<dyn StorageBackend>,
    store: Option<Arc<dyn SessionStore>>,
    listener: Arc<dyn UploadProgressListener>,
    cancel_token: CancellationToken,
}

impl fmt::Debug for MultipartSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartSession")
            .field("session_id", &self.session_id)
            .field("upload_id", &self.upload_id)
            .field("key", &self.key)
            .field("local_path", &self.local_path)
            .field("file_size", &self.file_size)
            .field("state", &self.state)
            .field("abort_requested", &self.abort_requested)
            .field("completed", &self.roster.completed_count())
            .field("total", &self.roster.chunk_count())
            .finish()
    }
}

impl MultipartSession {
    /// 创建会话并规划分片
    ///
    /// # 参数
    /// * `local_path` - 本地源文件
    /// * `key` - 目标对象 key
    /// * `config` - 分片配置
    /// * `backend` - 存储后端
    pub async fn create(
        local_path: impl AsRef<Path>,
        key: impl Into<String>,
        config: ChunkUploadConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> UploadResult<Self> {
        let local_path = local_path.as_ref().to_path_buf();
        let key = key.into();
        let file_size = tokio::fs::metadata(&local_path).await?.len();
        let plan = plan_chunks(file_size, config.chunk_size())?;

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "创建分片上传会话: session_id={}, key={}, 文件大小={} bytes, 分片数={}",
            session_id,
            key,
            file_size,
            plan.len()
        );

        Ok(Self {
            session_id,
            upload_id: None,
            key,
            local_path,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            file_size,
            config,
            roster: ChunkRoster::from_plan(plan),
            state: SessionState::Created,
            last_failure: None,
            abort_requested: false,
            created_at: Utc::now(),
            backend,
            store: None,
            listener: Arc::new(NoopProgress),
            cancel_token: CancellationToken::new(),
        })
    }

    /// 从持久化快照重建会话
    ///
    /// 会话进入 `InProgress`，已上传的分片保持完成状态，
    /// 未完成分片的重试计数清零。源文件大小变化或会话等待中止时拒绝恢复。
    pub async fn from_persisted(
        persisted: PersistedSession,
        backend: Arc<dyn StorageBackend>,
    ) -> UploadResult<Self> {
        if persisted.abort_requested {
            return Err(UploadError::InvalidState {
                state: ABORT_PENDING.to_string(),
                operation: "resume".to_string(),
            });
        }
        if persisted.upload_id.trim().is_empty() {
            return Err(UploadError::persistence(format!(
                "session {} was never initiated",
                persisted.session_id
            )));
        }

        let actual_size = tokio::fs::metadata(&persisted.local_path).await?.len();
        if actual_size != persisted.file_size {
            return Err(UploadError::persistence(format!(
                "source file {:?} changed size: recorded {} bytes, found {} bytes",
                persisted.local_path, persisted.file_size, actual_size
            )));
        }

        let config = if persisted.upload_config.is_empty() {
            ChunkUploadConfig::from_defaults()
        } else {
            ChunkUploadConfig::from_map(&persisted.upload_config)?
        };

        let states = persisted
            .chunks
            .iter()
            .map(ChunkState::from_persisted)
            .collect::<UploadResult<Vec<_>>>()?;
        let mut roster = ChunkRoster::from_states(states)?;
        if roster.total_size() != persisted.file_size {
            return Err(UploadError::persistence(format!(
                "chunks cover {} bytes but the file has {} bytes",
                roster.total_size(),
                persisted.file_size
            )));
        }
        roster.reset_retry_counts();

        info!(
            "恢复分片上传会话: session_id={}, upload_id={}, 已完成 {}/{}",
            persisted.session_id,
            persisted.upload_id,
            roster.completed_count(),
            roster.chunk_count()
        );

        Ok(Self {
            session_id: persisted.session_id,
            upload_id: Some(persisted.upload_id),
            key: persisted.key,
            local_path: persisted.local_path,
            content_type: persisted.content_type,
            file_size: persisted.file_size,
            config,
            roster,
            state: SessionState::InProgress,
            last_failure: None,
            abort_requested: false,
            created_at: persisted.created_at,
            backend,
            store: None,
            listener: Arc::new(NoopProgress),
            cancel_token: CancellationToken::new(),
        })
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

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    // ========================================================================
    // 访问器
    // ========================================================================

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn config(&self) -> &ChunkUploadConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn roster(&self) -> &ChunkRoster {
        &self.roster
    }

    /// 中止失败后等待再次中止
    pub fn is_abort_pending(&self) -> bool {
        self.abort_requested
    }

    /// 最近一次失败的原因
    pub fn last_failure(&self) -> Option<&FailureReason> {
        self.last_failure.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// 导出持久化快照
    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            session_id: self.session_id.clone(),
            upload_id: self.upload_id.clone().unwrap_or_default(),
            key: self.key.clone(),
            local_path: self.local_path.clone(),
            content_type: self.content_type.clone(),
            file_size: self.file_size,
            chunk_size: self.config.chunk_size(),
            chunks: self.roster.to_persisted(),
            upload_config: self.config.to_map(),
            abort_requested: self.abort_requested,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    // ========================================================================
    // 生命周期操作
    // ========================================================================

    /// 在远端发起分片上传
    ///
    /// 失败时会话保持 `Created`，可以再次调用
    pub async fn initiate(&mut self) -> UploadResult<()> {
        self.require_not_abort_pending("initiate")?;
        self.require_state("initiate", &[SessionState::Created])?;

        let upload_id = self
            .backend
            .initiate(&self.key, &self.content_type)
            .await
            .map_err(|source| {
                error!("发起分片上传失败: key={}, 错误: {}", self.key, source);
                UploadError::Initiation {
                    key: self.key.clone(),
                    source,
                }
            })?;

        info!(
            "已发起分片上传: session_id={}, upload_id={}",
            self.session_id, upload_id
        );
        self.upload_id = Some(upload_id);
        self.state = SessionState::Initiated;
        self.persist().await;
        Ok(())
    }

    /// 上传所有未完成的分片，全部成功后合并
    ///
    /// 尚未发起时先调用 `initiate`。超时从本次调用开始计算。
    ///
    /// # 返回
    /// - `Ok(SessionOutcome::Completed)` - 对象已提交
    /// - `Ok(SessionOutcome::Failed)` - 分片失败/超时/取消/合并失败，会话进入 `Failed`
    /// - `Err` - 发起失败或状态不允许
    pub async fn run(&mut self) -> UploadResult<SessionOutcome> {
        self.require_not_abort_pending("run")?;
        if self.state == SessionState::Created {
            self.initiate().await?;
        }
        self.require_state("run", &[SessionState::Initiated, SessionState::InProgress])?;
        self.dispatch().await
    }

    /// 重新上传失败的分片
    ///
    /// 只在 `Failed` 状态下可用。分片已全部完成（上次是合并失败）时直接重新合并。
    /// 中止失败的会话不能重试。
    pub async fn retry_failed(&mut self) -> UploadResult<SessionOutcome> {
        self.require_not_abort_pending("retry")?;
        self.require_state("retry", &[SessionState::Failed])?;

        if self.roster.is_completed() {
            info!("所有分片已完成，重新合并: session_id={}", self.session_id);
            return self.complete().await;
        }

        info!(
            "重试失败分片: session_id={}, 待上传 {} 个",
            self.session_id,
            self.roster.chunk_count() - self.roster.completed_count()
        );
        self.roster.reset_retry_counts();
        self.last_failure = None;
        self.state = SessionState::InProgress;
        self.dispatch().await
    }

    /// 合并所有分片
    ///
    /// 要求全部分片已上传，清单按分片号升序提交。
    /// 合并失败时进入 `Failed`，不自动中止远端上传。
    pub async fn complete(&mut self) -> UploadResult<SessionOutcome> {
        self.require_not_abort_pending("complete")?;
        self.require_state("complete", &[SessionState::InProgress, SessionState::Failed])?;
        let upload_id = self.require_upload_id("complete")?;

        if !self.roster.is_completed() {
            return Err(UploadError::InvalidState {
                state: format!(
                    "{} ({}/{} parts uploaded)",
                    self.state,
                    self.roster.completed_count(),
                    self.roster.chunk_count()
                ),
                operation: "complete".to_string(),
            });
        }

        self.state = SessionState::Completing;
        let parts = self.roster.complete_parts();

        match self.backend.complete(&upload_id, &parts).await {
            Ok(location) => {
                info!(
                    "分片上传完成: key={}, upload_id={}, 分片数={}",
                    self.key,
                    upload_id,
                    parts.len()
                );
                self.state = SessionState::Completed;
                self.last_failure = None;
                self.forget().await;
                Ok(SessionOutcome::Completed(UploadReceipt {
                    key: self.key.clone(),
                    location,
                    upload_id: Some(upload_id),
                    parts,
                    size: self.file_size,
                    mode: UploadMode::Multipart,
                }))
            }
            Err(e) => {
                error!(
                    "合并分片失败: key={}, upload_id={}, 错误: {}",
                    self.key, upload_id, e
                );
                Ok(self.fail(FailureReason::Completion { error: e }).await)
            }
        }
    }

    /// 中止远端分片上传
    ///
    /// 中止失败时会话进入 `Failed` 并记录中止请求（随快照持久化），
    /// 之后只能再次中止
    pub async fn abort(&mut self) -> UploadResult<()> {
        if self.state == SessionState::Created {
            self.state = SessionState::Aborted;
            self.forget().await;
            return Ok(());
        }
        self.require_state(
            "abort",
            &[
                SessionState::Initiated,
                SessionState::InProgress,
                SessionState::Failed,
            ],
        )?;
        let upload_id = self.require_upload_id("abort")?;

        self.state = SessionState::Aborting;
        match self.backend.abort(&upload_id).await {
            Ok(()) => {
                info!(
                    "已中止分片上传: key={}, upload_id={}",
                    self.key, upload_id
                );
                self.state = SessionState::Aborted;
                self.forget().await;
                Ok(())
            }
            Err(source) => {
                error!(
                    "中止分片上传失败: key={}, upload_id={}, 错误: {}",
                    self.key, upload_id, source
                );
                self.state = SessionState::Failed;
                self.abort_requested = true;
                self.last_failure = Some(FailureReason::Abort {
                    error: source.clone(),
                });
                self.persist().await;
                Err(UploadError::Abort { upload_id, source })
            }
        }
    }

    // ========================================================================
    // 内部实现
    // ========================================================================

    async fn dispatch(&mut self) -> UploadResult<SessionOutcome> {
        let upload_id = self.require_upload_id("run")?;
        self.state = SessionState::InProgress;
        self.persist().await;

        let scheduler = ConcurrencyScheduler::new(&self.config)
            .with_listener(self.listener.clone())
            .with_cancel_token(self.cancel_token.clone());

        let backend = self.backend.clone();
        let store = self.store.clone();
        let upload_id: Arc<str> = Arc::from(upload_id);
        let session_id: Arc<str> = Arc::from(self.session_id.as_str());
        let local_path: Arc<Path> = Arc::from(self.local_path.as_path());

        let report = scheduler
            .run(self.roster.chunks().to_vec(), move |chunk: Chunk| {
                let backend = backend.clone();
                let store = store.clone();
                let upload_id = upload_id.clone();
                let session_id = session_id.clone();
                let local_path = local_path.clone();
                async move {
                    let data = chunk.read_from(&local_path).await?;
                    let etag = backend
                        .upload_part(&upload_id, chunk.part_number, data)
                        .await?;
                    if let Some(store) = store.filter(|_| !etag.trim().is_empty()) {
                        if let Err(e) = store
                            .record_part(&session_id, chunk.part_number, &etag)
                            .await
                        {
                            warn!(
                                "记录分片进度失败: session_id={}, part={}, 错误: {}",
                                session_id, chunk.part_number, e
                            );
                        }
                    }
                    Ok::<String, StorageError>(etag)
                }
            })
            .await;

        self.roster.apply(report.chunks);

        let reason = match report.outcome {
            SchedulerOutcome::AllSucceeded => {
                self.persist().await;
                return self.complete().await;
            }
            SchedulerOutcome::PartialFailure { failed_chunks } => {
                FailureReason::PartialFailure { failed_chunks }
            }
            SchedulerOutcome::TimedOut { remaining_chunks } => {
                FailureReason::TimedOut { remaining_chunks }
            }
            SchedulerOutcome::Cancelled { remaining_chunks } => {
                FailureReason::Cancelled { remaining_chunks }
            }
        };

        warn!(
            "分片上传未完成: session_id={}, 已完成 {}/{}",
            self.session_id,
            self.roster.completed_count(),
            self.roster.chunk_count()
        );
        Ok(self.fail(reason).await)
    }

    async fn fail(&mut self, reason: FailureReason) -> SessionOutcome {
        self.state = SessionState::Failed;
        self.last_failure = Some(reason.clone());
        self.persist().await;
        SessionOutcome::Failed(reason)
    }

    fn require_state(&self, operation: &str, allowed: &[SessionState]) -> UploadResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(UploadError::InvalidState {
                state: self.state.to_string(),
                operation: operation.to_string(),
            })
        }
    }

    fn require_not_abort_pending(&self, operation: &str) -> UploadResult<()> {
        if self.abort_requested {
            return Err(UploadError::InvalidState {
                state: ABORT_PENDING.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn require_upload_id(&self, operation: &str) -> UploadResult<String> {
        self.upload_id.clone().ok_or_else(|| UploadError::InvalidState {
            state: self.state.to_string(),
            operation: operation.to_string(),
        })
    }

    /// 保存快照（失败只记录警告，不影响上传本身）
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if self.upload_id.is_none() {
            return;
        }
        if let Err(e) = store.save(&self.to_persisted()).await {
            warn!("保存会话快照失败: session_id={}, 错误: {}", self.session_id, e);
        }
    }

    /// 删除持久化记录
    async fn forget(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.remove(&self.session_id).await {
            warn!("删除会话记录失败: session_id={}, 错误: {}", self.session_id, e);
        }
    }
}
