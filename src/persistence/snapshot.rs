//! 会话快照文件操作
//!
//! 快照为 JSON 格式，扩展名为 `.session`：
//! ```json
//! {
//!   "session_id": "xxx",
//!   "upload_id": "yyy",
//!   "key": "backups/db.tar",
//!   "chunks": [{ "part_number": 1, "start": 0, ... }],
//!   ...
//! }
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::types::PersistedSession;
use super::wal::get_wal_path;

/// 快照文件扩展名
pub const SNAPSHOT_EXTENSION: &str = "session";

/// 获取快照文件路径：`{dir}/{session_id}.session`
pub fn get_snapshot_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", session_id, SNAPSHOT_EXTENSION))
}

/// 确保目录存在
pub(crate) fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

/// 保存会话快照
///
/// 先写入临时文件，再原子重命名，写入中断不会破坏旧快照
pub fn save_snapshot(dir: &Path, session: &PersistedSession) -> io::Result<()> {
    ensure_dir(dir)?;

    let path = get_snapshot_path(dir, &session.session_id);
    let temp_path = path.with_extension("session.tmp");

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);

    serde_json::to_writer_pretty(&mut writer, session).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize session: {}", e),
        )
    })?;

    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, &path)?;

    debug!(
        "已保存会话快照: {:?} (session_id={})",
        path, session.session_id
    );
    Ok(())
}

/// 加载会话快照
///
/// # 返回
/// - `Ok(Some(session))` - 加载成功
/// - `Ok(None)` - 快照不存在
/// - `Err` - 读取或解析失败
pub fn load_snapshot(dir: &Path, session_id: &str) -> io::Result<Option<PersistedSession>> {
    let path = get_snapshot_path(dir, session_id);

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let session: PersistedSession =
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse session snapshot {:?}: {}", path, e),
            )
        })?;

    Ok(Some(session))
}

/// 扫描目录中的所有会话 ID
pub fn scan_session_ids(dir: &Path) -> io::Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
            continue;
        }
        if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
            ids.push(id.to_string());
        }
    }
    ids.sort();

    debug!("扫描到 {} 个会话快照", ids.len());
    Ok(ids)
}

/// 加载目录中的所有会话快照（跳过损坏的文件）
pub fn scan_snapshots(dir: &Path) -> io::Result<Vec<PersistedSession>> {
    let mut sessions = Vec::new();
    for id in scan_session_ids(dir)? {
        match load_snapshot(dir, &id) {
            Ok(Some(session)) => sessions.push(session),
            Ok(None) => {}
            Err(e) => warn!("会话快照损坏，已跳过 (session_id={}): {}", id, e),
        }
    }
    Ok(sessions)
}

/// 删除会话的快照与 WAL 文件
///
/// # 返回
/// 实际删除的文件数
pub fn delete_session_files(dir: &Path, session_id: &str) -> io::Result<usize> {
    let mut deleted = 0;
    for path in [
        get_snapshot_path(dir, session_id),
        get_wal_path(dir, session_id),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    debug!("已删除会话文件 {} 个 (session_id={})", deleted, session_id);
    Ok(deleted)
}
