// 上传分片管理
//
// 分片规则：
// - 分片号从 1 开始连续递增
// - 除最后一个分片外，每个分片大小都等于配置的分片大小
// - 单个文件最多 10000 个分片（对象存储的分片数上限）

use crate::error::{StorageError, StorageErrorKind, UploadError, UploadResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// 单个文件最多允许的分片数
pub const MAX_PART_COUNT: u64 = 10_000;

/// 分片（计划阶段，不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// 分片号（从 1 开始）
    pub part_number: u32,
    /// 起始偏移（包含）
    pub start: u64,
    /// 结束偏移（不包含）
    pub end: u64,
    /// 分片大小
    pub size: u64,
}

impl Chunk {
    /// 读取分片数据
    ///
    /// 每个分片独立打开文件并只读自己的字节范围，可以安全并发
    ///
    /// # 参数
    /// * `file_path` - 本地文件路径
    ///
    /// # 返回
    /// 分片数据字节数组
    pub async fn read_from(&self, file_path: &Path) -> Result<Vec<u8>, StorageError> {
        let mut file = File::open(file_path).await.map_err(|e| {
            StorageError::new(
                StorageErrorKind::LocalIo,
                format!("打开上传文件失败 {:?}: {}", file_path, e),
            )
        })?;

        file.seek(std::io::SeekFrom::Start(self.start))
            .await
            .map_err(|e| StorageError::new(StorageErrorKind::LocalIo, format!("文件定位失败: {}", e)))?;

        let mut buffer = vec![0u8; self.size as usize];
        file.read_exact(&mut buffer).await.map_err(|e| {
            StorageError::new(
                StorageErrorKind::LocalIo,
                format!("读取分片 #{} 数据失败: {}", self.part_number, e),
            )
        })?;

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            self.part_number,
            self.start,
            self.end - 1,
            self.size
        );

        Ok(buffer)
    }
}

/// 计算分片计划
///
/// 纯函数，不做任何 I/O。文件小于分片大小时返回覆盖整个文件的单个分片。
///
/// # 参数
/// * `file_size` - 文件大小，必须大于 0
/// * `chunk_size` - 分片大小，必须大于 0
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> UploadResult<Vec<Chunk>> {
    if file_size == 0 {
        return Err(UploadError::InvalidPlan(
            "file size must be greater than 0".to_string(),
        ));
    }
    if chunk_size == 0 {
        return Err(UploadError::InvalidPlan(
            "chunk size must be greater than 0".to_string(),
        ));
    }

    let count = file_size.div_ceil(chunk_size);
    if count > MAX_PART_COUNT {
        return Err(UploadError::TooManyChunks {
            count,
            max: MAX_PART_COUNT,
        });
    }

    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut part_number = 1u32;

    while offset < file_size {
        let end = std::cmp::min(offset + chunk_size, file_size);
        chunks.push(Chunk {
            part_number,
            start: offset,
            end,
            size: end - offset,
        });
        offset = end;
        part_number += 1;
    }

    debug!(
        "计算分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        file_size,
        chunk_size,
        chunks.len()
    );

    Ok(chunks)
}

// ============================================================================
// ChunkState
// ============================================================================

/// 分片运行时状态
///
/// 只由负责该分片的上传 worker 修改；`uploaded == true` 之后不再变化。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkState {
    chunk: Chunk,
    etag: String,
    uploaded: bool,
    retry_count: u32,
    /// 最近一次失败原因（不持久化）
    last_error: Option<StorageError>,
}

impl ChunkState {
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            etag: String::new(),
            uploaded: false,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn chunk(&self) -> Chunk {
        self.chunk
    }

    pub fn part_number(&self) -> u32 {
        self.chunk.part_number
    }

    pub fn size(&self) -> u64 {
        self.chunk.size
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&StorageError> {
        self.last_error.as_ref()
    }

    /// 标记上传成功
    ///
    /// 已完成的分片或空 ETag 不会改变状态，返回 false
    pub fn mark_completed(&mut self, etag: impl Into<String>) -> bool {
        let etag = etag.into();
        if self.uploaded || etag.trim().is_empty() {
            return false;
        }
        self.etag = etag;
        self.uploaded = true;
        self.last_error = None;
        true
    }

    /// 标记一次失败尝试，返回累计失败次数
    pub fn mark_failed(&mut self, error: StorageError) -> u32 {
        if self.uploaded {
            return self.retry_count;
        }
        self.last_error = Some(error);
        self.retry_count += 1;
        self.retry_count
    }

    /// 清零重试计数（会话决定让分片重新开始时使用）
    pub fn reset_retry_count(&mut self) {
        self.retry_count = 0;
    }

    /// 导出持久化形式（不包含 last_error）
    pub fn to_persisted(&self) -> PersistedChunk {
        PersistedChunk {
            part_number: self.chunk.part_number,
            start: self.chunk.start,
            end: self.chunk.end,
            size: self.chunk.size,
            etag: self.etag.clone(),
            uploaded: self.uploaded,
            retry_count: self.retry_count,
        }
    }

    /// 从持久化形式恢复，并校验字段一致性
    pub fn from_persisted(p: &PersistedChunk) -> UploadResult<Self> {
        if p.part_number == 0 {
            return Err(UploadError::persistence("part_number must start at 1"));
        }
        if p.end < p.start || p.end - p.start != p.size || p.size == 0 {
            return Err(UploadError::persistence(format!(
                "part {} has inconsistent range {}..{} (size {})",
                p.part_number, p.start, p.end, p.size
            )));
        }
        if p.uploaded && p.etag.trim().is_empty() {
            return Err(UploadError::persistence(format!(
                "part {} is marked uploaded without an etag",
                p.part_number
            )));
        }

        Ok(Self {
            chunk: Chunk {
                part_number: p.part_number,
                start: p.start,
                end: p.end,
                size: p.size,
            },
            etag: p.etag.clone(),
            uploaded: p.uploaded,
            retry_count: p.retry_count,
            last_error: None,
        })
    }

    /// 生成完成清单条目，未上传的分片返回 None
    pub fn to_complete_part(&self) -> Option<CompletePart> {
        self.uploaded.then(|| CompletePart {
            part_number: self.chunk.part_number,
            etag: self.etag.clone(),
        })
    }
}

/// 分片的持久化形式（扁平结构）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChunk {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default)]
    pub retry_count: u32,
}

/// 完成清单条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}

// ============================================================================
// ChunkRoster
// ============================================================================

/// 会话持有的完整分片名册
#[derive(Debug, Clone)]
pub struct ChunkRoster {
    chunks: Vec<ChunkState>,
    total_size: u64,
}

impl ChunkRoster {
    /// 根据分片计划创建名册
    pub fn from_plan(plan: Vec<Chunk>) -> Self {
        let total_size = plan.iter().map(|c| c.size).sum();
        let chunks: Vec<ChunkState> = plan.into_iter().map(ChunkState::new).collect();
        info!(
            "创建分片名册: 文件大小={} bytes, 分片数量={}",
            total_size,
            chunks.len()
        );
        Self { chunks, total_size }
    }

    /// 从已有状态创建名册，校验分片号连续且范围首尾相接
    pub fn from_states(mut states: Vec<ChunkState>) -> UploadResult<Self> {
        states.sort_by_key(|s| s.part_number());
        let mut expected_start = 0u64;
        for (i, state) in states.iter().enumerate() {
            let chunk = state.chunk();
            if chunk.part_number as usize != i + 1 {
                return Err(UploadError::persistence(format!(
                    "part numbers are not contiguous at part {}",
                    chunk.part_number
                )));
            }
            if chunk.start != expected_start {
                return Err(UploadError::persistence(format!(
                    "part {} starts at {} but {} was expected",
                    chunk.part_number, chunk.start, expected_start
                )));
            }
            expected_start = chunk.end;
        }
        if states.is_empty() {
            return Err(UploadError::persistence("session has no chunks"));
        }
        Ok(Self {
            total_size: expected_start,
            chunks: states,
        })
    }

    pub fn chunks(&self) -> &[ChunkState] {
        &self.chunks
    }

    pub fn get(&self, part_number: u32) -> Option<&ChunkState> {
        let idx = (part_number as usize).checked_sub(1)?;
        self.chunks.get(idx)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 尚未上传的分片
    pub fn pending(&self) -> Vec<ChunkState> {
        self.chunks
            .iter()
            .filter(|c| !c.is_uploaded())
            .cloned()
            .collect()
    }

    /// 写回调度器返回的分片状态（按分片号定位）
    pub fn apply(&mut self, updated: impl IntoIterator<Item = ChunkState>) {
        for state in updated {
            let Some(idx) = (state.part_number() as usize).checked_sub(1) else {
                continue;
            };
            if let Some(slot) = self.chunks.get_mut(idx) {
                if slot.chunk() == state.chunk() {
                    *slot = state;
                }
            }
        }
    }

    /// 记录某个分片的 ETag（WAL 回放时使用）
    pub fn mark_completed(&mut self, part_number: u32, etag: &str) -> bool {
        let idx = match (part_number as usize).checked_sub(1) {
            Some(idx) => idx,
            None => return false,
        };
        match self.chunks.get_mut(idx) {
            Some(state) => state.mark_completed(etag),
            None => false,
        }
    }

    /// 清零所有未完成分片的重试计数
    pub fn reset_retry_counts(&mut self) {
        for state in self.chunks.iter_mut().filter(|c| !c.is_uploaded()) {
            state.reset_retry_count();
        }
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_uploaded()).count()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.is_uploaded())
            .map(|c| c.size())
            .sum()
    }

    /// 上传进度（百分比）
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_bytes() as f64 / self.total_size as f64) * 100.0
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.is_uploaded())
    }

    /// 完成清单，按分片号升序
    pub fn complete_parts(&self) -> Vec<CompletePart> {
        let mut parts: Vec<CompletePart> = self
            .chunks
            .iter()
            .filter_map(|c| c.to_complete_part())
            .collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    pub fn to_persisted(&self) -> Vec<PersistedChunk> {
        self.chunks.iter().map(|c| c.to_persisted()).collect()
    }
}
