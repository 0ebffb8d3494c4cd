//! 存储后端接口
//!
//! 上传编排只依赖这个 trait，具体的对象存储（OSS/TOS/OBS/S3 等）各自实现。

use crate::error::StorageError;
use crate::uploader::chunk::CompletePart;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 已提交对象的元信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub content_type: Option<String>,
}

/// 对象存储后端
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// 发起分片上传，返回远端 upload_id
    async fn initiate(&self, key: &str, content_type: &str) -> Result<String, StorageError>;

    /// 上传一个分片，返回该分片的 ETag
    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, StorageError>;

    /// 合并分片，返回对象位置
    ///
    /// `parts` 已按分片号升序排列
    async fn complete(&self, upload_id: &str, parts: &[CompletePart])
        -> Result<String, StorageError>;

    /// 中止分片上传，丢弃已上传的分片
    async fn abort(&self, upload_id: &str) -> Result<(), StorageError>;

    /// 单次上传整个对象（小文件），返回对象位置
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str)
        -> Result<String, StorageError>;

    /// 查询已提交对象，不存在时返回 None
    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, StorageError>;
}
