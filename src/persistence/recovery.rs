//! 会话恢复模块
//!
//! 实现启动时的续传恢复，包括：
//! - 合并快照与 WAL 记录
//! - 扫描可恢复的会话
//! - 清理无效和过期的会话文件
//!
//! ## 恢复流程
//!
//! 1. 扫描会话目录中的快照文件
//! 2. 读取 WAL，把快照之后完成的分片合并进去
//! 3. 验证本地源文件仍然存在且大小不变
//! 4. 返回可恢复的会话，由上传器负责实际续传

use std::path::Path;

use bit_set::BitSet;
use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use super::snapshot::{delete_session_files, load_snapshot, scan_session_ids, scan_snapshots};
use super::types::{PersistedSession, WalRecord};
use super::wal::read_records;

/// 保留天数上限，更大的配置按此值处理
const MAX_RETENTION_DAYS: i64 = 365 * 10_000;

/// 把 WAL 记录合并进会话快照
///
/// 只会把未完成的分片标记为完成，已完成分片的 ETag 以快照为准。
///
/// # 返回
/// 本次新标记为完成的分片号集合
pub fn merge_wal(session: &mut PersistedSession, records: &[WalRecord]) -> BitSet {
    let mut applied = BitSet::with_capacity(session.chunks.len() + 1);

    for record in records {
        let Some(chunk) = (record.part_number as usize)
            .checked_sub(1)
            .and_then(|idx| session.chunks.get_mut(idx))
        else {
            warn!(
                "WAL 记录的分片号超出范围 (session_id={}, part={})",
                session.session_id, record.part_number
            );
            continue;
        };

        if chunk.part_number != record.part_number {
            warn!(
                "快照分片顺序异常，忽略 WAL 记录 (session_id={}, part={})",
                session.session_id, record.part_number
            );
            continue;
        }

        if chunk.uploaded {
            if chunk.etag != record.etag {
                warn!(
                    "WAL 记录与快照 ETag 不一致，以快照为准 (session_id={}, part={})",
                    session.session_id, record.part_number
                );
            }
            continue;
        }

        chunk.etag = record.etag.clone();
        chunk.uploaded = true;
        applied.insert(record.part_number as usize);
    }

    applied
}

/// 加载会话（快照 + WAL）
///
/// # 返回
/// - `Ok(Some(session))` - 已合并 WAL 的会话
/// - `Ok(None)` - 快照不存在
pub fn load_session(dir: &Path, session_id: &str) -> std::io::Result<Option<PersistedSession>> {
    let Some(mut session) = load_snapshot(dir, session_id)? else {
        return Ok(None);
    };

    let records = read_records(dir, session_id)?;
    let applied = merge_wal(&mut session, &records);
    if !applied.is_empty() {
        debug!(
            "从 WAL 恢复了 {} 个分片 (session_id={})",
            applied.len(),
            session_id
        );
    }

    Ok(Some(session))
}

/// 恢复扫描结果
#[derive(Debug, Default)]
pub struct RecoveryScanResult {
    /// 可续传的会话（已合并 WAL）
    pub recoverable: Vec<PersistedSession>,

    /// 无效会话 ID（快照损坏、源文件缺失或被修改）
    pub invalid: Vec<String>,

    /// 中止失败、等待再次中止的会话（不续传，也不清理）
    pub pending_abort: Vec<PersistedSession>,
}

impl RecoveryScanResult {
    pub fn has_recoverable(&self) -> bool {
        !self.recoverable.is_empty()
    }
}

/// 扫描可恢复的会话
pub fn scan_recoverable_sessions(dir: &Path) -> std::io::Result<RecoveryScanResult> {
    info!("开始扫描可恢复的上传会话: {:?}", dir);

    let mut result = RecoveryScanResult::default();

    for session_id in scan_session_ids(dir)? {
        let session = match load_session(dir, &session_id) {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                warn!("会话 {} 加载失败: {}", session_id, e);
                result.invalid.push(session_id);
                continue;
            }
        };

        if session.abort_requested {
            debug!("会话 {} 等待中止，跳过续传检查", session_id);
            result.pending_abort.push(session);
            continue;
        }

        if let Err(reason) = validate_session(&session) {
            warn!("会话 {} 验证失败: {}", session_id, reason);
            result.invalid.push(session_id);
            continue;
        }

        result.recoverable.push(session);
    }

    info!(
        "扫描完成: 可恢复 {} 个，无效 {} 个，等待中止 {} 个",
        result.recoverable.len(),
        result.invalid.len(),
        result.pending_abort.len()
    );

    Ok(result)
}

/// 验证会话仍可续传
fn validate_session(session: &PersistedSession) -> Result<(), String> {
    if session.upload_id.is_empty() {
        return Err("会话尚未在远端发起".to_string());
    }

    let meta = std::fs::metadata(&session.local_path)
        .map_err(|e| format!("源文件不可访问 {:?}: {}", session.local_path, e))?;
    if meta.len() != session.file_size {
        return Err(format!(
            "源文件大小已变化: 记录 {} bytes, 实际 {} bytes",
            session.file_size,
            meta.len()
        ));
    }

    let planned: u64 = session.chunks.iter().map(|c| c.size).sum();
    if planned != session.file_size {
        return Err(format!(
            "分片总大小 {} 与文件大小 {} 不一致",
            planned, session.file_size
        ));
    }

    Ok(())
}

/// 清理无效会话的持久化文件
///
/// # 返回
/// 成功清理的会话数
pub fn cleanup_invalid_sessions(dir: &Path, session_ids: &[String]) -> usize {
    let mut cleaned = 0;

    for session_id in session_ids {
        match delete_session_files(dir, session_id) {
            Ok(count) if count > 0 => {
                warn!("已清理无效会话 {} 的 {} 个文件", session_id, count);
                cleaned += 1;
            }
            Ok(_) => {}
            Err(e) => {
                error!("清理无效会话 {} 失败: {}", session_id, e);
            }
        }
    }

    cleaned
}

/// 清理过期会话
///
/// 删除超过保留天数未更新的会话文件（远端分片需调用方自行中止）
///
/// # 返回
/// 被清理的会话
pub fn cleanup_expired_sessions(
    dir: &Path,
    retention_days: u64,
) -> std::io::Result<Vec<PersistedSession>> {
    info!("开始清理过期会话（保留天数: {}）", retention_days);

    let now = Utc::now();
    let retention = Duration::days(
        i64::try_from(retention_days)
            .unwrap_or(i64::MAX)
            .min(MAX_RETENTION_DAYS),
    );
    let mut cleaned = Vec::new();

    for session in scan_snapshots(dir)? {
        let age = now.signed_duration_since(session.updated_at);
        if age <= retention {
            continue;
        }

        info!(
            "会话 {} 已过期（{}天前更新），清理中",
            session.session_id,
            age.num_days()
        );
        match delete_session_files(dir, &session.session_id) {
            Ok(count) if count > 0 => cleaned.push(session),
            Ok(_) => {}
            Err(e) => error!("清理过期会话 {} 失败: {}", session.session_id, e),
        }
    }

    if cleaned.is_empty() {
        debug!("无过期会话需要清理");
    } else {
        info!("已清理 {} 个过期会话", cleaned.len());
    }

    Ok(cleaned)
}
