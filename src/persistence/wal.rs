//! WAL (Write-Ahead Log) 文件操作
//!
//! 每个分片上传成功后立即追加一行，进程在两次快照之间崩溃也不会丢失已完成的分片。
//!
//! ## 文件格式
//!
//! 每行一条记录：`{part_number},{timestamp_ms},{etag}`，ETag 为 JSON 字符串
//!
//! 示例：
//! ```text
//! 1,1733356800000,"9e107d9d372bb6826bd81d3542a419d6"
//! 3,1733356800100,"\"e4d909c290d0fb1ca068ffaddf22cbd0-2\""
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::snapshot::ensure_dir;
use super::types::WalRecord;

/// WAL 文件扩展名
pub const WAL_EXTENSION: &str = "wal";

/// 获取 WAL 文件路径：`{dir}/{session_id}.wal`
pub fn get_wal_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", session_id, WAL_EXTENSION))
}

/// 追加记录到 WAL 文件并落盘
pub fn append_records(dir: &Path, session_id: &str, records: &[WalRecord]) -> io::Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    ensure_dir(dir)?;

    let path = get_wal_path(dir, session_id);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

    let mut buf = String::new();
    for record in records {
        buf.push_str(&record.to_wal_line());
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())?;
    file.sync_data()?;

    debug!(
        "已追加 {} 条记录到 WAL (session_id={})",
        records.len(),
        session_id
    );
    Ok(())
}

/// 读取 WAL 文件中的所有记录
///
/// 容错处理：跳过无法解析的行（例如崩溃时写了一半的最后一行），并记录警告日志。
/// 文件不存在时返回空列表。
pub fn read_records(dir: &Path, session_id: &str) -> io::Result<Vec<WalRecord>> {
    let path = get_wal_path(dir, session_id);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    let mut skipped = 0;

    for (line_number, line) in BufReader::new(file).lines().enumerate() {
        match line {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match WalRecord::from_wal_line(line) {
                    Some(record) => records.push(record),
                    None => {
                        warn!(
                            "WAL 解析失败 (行 {}): {:?} in {:?}",
                            line_number + 1,
                            line,
                            path
                        );
                        skipped += 1;
                    }
                }
            }
            Err(e) => {
                warn!("WAL 读取失败 (行 {}): {} in {:?}", line_number + 1, e, path);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("WAL 读取完成，跳过 {} 行无效记录 in {:?}", skipped, path);
    }
    debug!("已读取 {} 条 WAL 记录 from {:?}", records.len(), path);

    Ok(records)
}

/// 删除 WAL 文件
///
/// # 返回
/// - `Ok(true)` - 删除成功
/// - `Ok(false)` - 文件不存在
pub fn delete_wal_file(dir: &Path, session_id: &str) -> io::Result<bool> {
    match fs::remove_file(get_wal_path(dir, session_id)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
