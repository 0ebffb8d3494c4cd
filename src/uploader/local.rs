//! 本地目录存储后端
//!
//! 用本地文件系统模拟对象存储的分片上传语义：
//!
//! ```text
//! <root>/
//!   objects/<key>              已提交对象
//!   .meta/<key>.json           对象元信息（ObjectHead）
//!   .uploads/<upload_id>/
//!     upload.json              分片上传元信息
//!     part-000001              已上传分片
//! ```
//!
//! 分片 ETag 为分片内容的 MD5（十六进制），合并后对象的 ETag 为
//! `md5(各分片 MD5 拼接)-分片数`。

use crate::error::{StorageError, StorageErrorKind};
use crate::uploader::backend::{ObjectHead, StorageBackend};
use crate::uploader::chunk::CompletePart;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = ".meta";
const UPLOADS_DIR: &str = ".uploads";
const UPLOAD_META_FILE: &str = "upload.json";

/// 分片上传元信息
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadMeta {
    key: String,
    content_type: String,
    created_at: i64,
}

/// 本地目录存储后端
#[derive(Debug)]
pub struct LocalDirBackend {
    root: PathBuf,
    /// upload_id -> 元信息缓存（磁盘为准）
    uploads: DashMap<String, UploadMeta>,
}

impl LocalDirBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            uploads: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 已提交对象的本地路径
    pub fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(OBJECTS_DIR).join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.json", key))
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        if upload_id.is_empty()
            || !upload_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(StorageError::bad_request(format!(
                "invalid upload id {:?}",
                upload_id
            )));
        }
        Ok(self.root.join(UPLOADS_DIR).join(upload_id))
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part-{:06}", part_number))
    }

    async fn load_upload(&self, upload_id: &str) -> Result<(PathBuf, UploadMeta), StorageError> {
        let dir = self.upload_dir(upload_id)?;
        if let Some(meta) = self.uploads.get(upload_id) {
            if fs::try_exists(&dir).await.unwrap_or(false) {
                return Ok((dir, meta.clone()));
            }
        }

        let content = match fs::read(dir.join(UPLOAD_META_FILE)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.uploads.remove(upload_id);
                return Err(StorageError::upload_not_found(upload_id));
            }
            Err(e) => return Err(e.into()),
        };
        let meta: UploadMeta = serde_json::from_slice(&content).map_err(|e| {
            StorageError::new(
                StorageErrorKind::LocalIo,
                format!("corrupt upload metadata for {}: {}", upload_id, e),
            )
        })?;
        self.uploads.insert(upload_id.to_string(), meta.clone());
        Ok((dir, meta))
    }

    /// 写入对象与元信息（先写临时文件再重命名）
    async fn commit_object(&self, head: &ObjectHead, tmp: &Path) -> Result<(), StorageError> {
        let target = self.object_path(&head.key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(tmp, &target).await?;

        let meta_path = self.meta_path(&head.key);
        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(head)
            .map_err(|e| StorageError::new(StorageErrorKind::LocalIo, e.to_string()))?;
        write_atomic(&meta_path, &json).await?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        self.root
            .join(UPLOADS_DIR)
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl StorageBackend for LocalDirBackend {
    async fn initiate(&self, key: &str, content_type: &str) -> Result<String, StorageError> {
        validate_key(key)?;

        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;

        let meta = UploadMeta {
            key: key.to_string(),
            content_type: content_type.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::new(StorageErrorKind::LocalIo, e.to_string()))?;
        write_atomic(&dir.join(UPLOAD_META_FILE), &json).await?;
        self.uploads.insert(upload_id.clone(), meta);

        info!("[本地存储] 发起分片上传: key={}, upload_id={}", key, upload_id);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, StorageError> {
        if part_number == 0 {
            return Err(StorageError::bad_request("part number must start at 1"));
        }
        let (dir, _) = self.load_upload(upload_id).await?;

        let etag = hex::encode(md5::compute(&data).0);
        write_atomic(&Self::part_path(&dir, part_number), &data).await?;

        debug!(
            "[本地存储] 分片已写入: upload_id={}, part={}, size={}",
            upload_id,
            part_number,
            data.len()
        );
        Ok(etag)
    }

    async fn complete(
        &self,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> Result<String, StorageError> {
        let (dir, meta) = self.load_upload(upload_id).await?;

        if parts.is_empty() {
            return Err(StorageError::bad_request("no parts to complete"));
        }
        for pair in parts.windows(2) {
            if pair[0].part_number >= pair[1].part_number {
                return Err(StorageError::bad_request(format!(
                    "parts must be in ascending order ({} before {})",
                    pair[0].part_number, pair[1].part_number
                )));
            }
        }

        let tmp = self.tmp_path();
        let mut out = fs::File::create(&tmp).await?;
        let mut size = 0u64;
        let mut digests = Vec::with_capacity(parts.len() * 16);

        for part in parts {
            let data = match fs::read(Self::part_path(&dir, part.part_number)).await {
                Ok(data) => data,
                Err(e) => {
                    let _ = fs::remove_file(&tmp).await;
                    return Err(if e.kind() == std::io::ErrorKind::NotFound {
                        StorageError::bad_request(format!("part {} was never uploaded", part.part_number))
                    } else {
                        e.into()
                    });
                }
            };
            let digest = md5::compute(&data);
            if hex::encode(digest.0) != part.etag {
                let _ = fs::remove_file(&tmp).await;
                return Err(StorageError::bad_request(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            digests.extend_from_slice(&digest.0);
            size += data.len() as u64;
            out.write_all(&data).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        let head = ObjectHead {
            key: meta.key.clone(),
            size,
            etag: format!("{}-{}", hex::encode(md5::compute(&digests).0), parts.len()),
            content_type: Some(meta.content_type.clone()),
        };
        self.commit_object(&head, &tmp).await?;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            warn!("[本地存储] 清理分片目录失败 {:?}: {}", dir, e);
        }
        self.uploads.remove(upload_id);

        info!(
            "[本地存储] ✓ 分片合并完成: key={}, parts={}, size={}",
            meta.key,
            parts.len(),
            size
        );
        Ok(format!("local://{}", meta.key))
    }

    async fn abort(&self, upload_id: &str) -> Result<(), StorageError> {
        let (dir, meta) = self.load_upload(upload_id).await?;
        fs::remove_dir_all(&dir).await?;
        self.uploads.remove(upload_id);
        info!("[本地存储] 已中止分片上传: key={}, upload_id={}", meta.key, upload_id);
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        fs::create_dir_all(self.root.join(UPLOADS_DIR)).await?;

        let tmp = self.tmp_path();
        write_atomic(&tmp, &data).await?;

        let head = ObjectHead {
            key: key.to_string(),
            size: data.len() as u64,
            etag: hex::encode(md5::compute(&data).0),
            content_type: Some(content_type.to_string()),
        };
        self.commit_object(&head, &tmp).await?;

        info!("[本地存储] ✓ 简单上传完成: key={}, size={}", key, head.size);
        Ok(format!("local://{}", key))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, StorageError> {
        validate_key(key)?;
        match fs::read(self.meta_path(key)).await {
            Ok(content) => serde_json::from_slice(&content).map(Some).map_err(|e| {
                StorageError::new(
                    StorageErrorKind::LocalIo,
                    format!("corrupt object metadata for {}: {}", key, e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// 对象 key 只允许普通的相对路径片段
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::bad_request("object key must not be empty"));
    }
    let path = Path::new(key);
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(StorageError::bad_request(format!(
            "object key {:?} must be a relative path without '..'",
            key
        )));
    }
    Ok(())
}

/// 先写临时文件再原子重命名
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
