//! 持久化模块核心类型定义
//!
//! 定义会话续传所需的数据结构

use crate::uploader::chunk::PersistedChunk;
use crate::uploader::session::DEFAULT_CONTENT_TYPE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 分片上传会话的持久化形式
///
/// 续传时只需要这份快照（加上 WAL 中的增量记录）即可在 InProgress 状态重建会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    /// 本地会话 ID
    pub session_id: String,

    /// 远端 upload_id
    pub upload_id: String,

    /// 目标对象 key
    pub key: String,

    /// 本地源文件
    pub local_path: PathBuf,

    /// 对象类型
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// 文件大小
    pub file_size: u64,

    /// 分片大小
    pub chunk_size: u64,

    /// 全部分片状态
    pub chunks: Vec<PersistedChunk>,

    /// 创建会话时使用的分片配置（`ChunkUploadConfig::to_map` 形式）
    #[serde(default)]
    pub upload_config: BTreeMap<String, i64>,

    /// 调用方已请求中止但远端中止失败，只能再次中止，不能续传
    #[serde(default)]
    pub abort_requested: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

pub fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

impl PersistedSession {
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.uploaded).count()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.uploaded)
            .map(|c| c.size)
            .sum()
    }

    /// 未完成的分片号
    pub fn pending_parts(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| !c.uploaded)
            .map(|c| c.part_number)
            .collect()
    }

    pub fn is_all_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.uploaded)
    }

    /// 上传进度（百分比）
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 0.0;
        }
        self.uploaded_bytes() as f64 / self.file_size as f64 * 100.0
    }
}

/// WAL 记录：一个分片上传成功
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// 分片号（从 1 开始）
    pub part_number: u32,

    /// 远端返回的 ETag
    pub etag: String,

    /// 记录时间戳（Unix 毫秒）
    pub timestamp_ms: i64,
}

impl WalRecord {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// 序列化为 WAL 行格式
    ///
    /// 格式：`{part_number},{timestamp_ms},{etag}`，ETag 写成 JSON 字符串，
    /// 放在最后一个字段，内容可以包含逗号和引号
    pub fn to_wal_line(&self) -> String {
        format!(
            "{},{},{}",
            self.part_number,
            self.timestamp_ms,
            serde_json::Value::String(self.etag.clone())
        )
    }

    /// 从 WAL 行格式解析（容错）
    ///
    /// 任一字段缺失或损坏（包括写了一半的 ETag）时返回 `None`
    pub fn from_wal_line(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, ',');

        let part_number = parts.next()?.trim().parse::<u32>().ok()?;
        if part_number == 0 {
            return None;
        }

        let timestamp_ms = parts.next()?.trim().parse::<i64>().ok()?;

        let etag = serde_json::from_str::<String>(parts.next()?.trim()).ok()?;
        if etag.trim().is_empty() {
            return None;
        }

        Some(Self {
            part_number,
            etag,
            timestamp_ms,
        })
    }
}
