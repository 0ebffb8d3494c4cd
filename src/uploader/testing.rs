//! 测试辅助：可编排故障的存储后端与记录型进度监听器

use crate::error::{StorageError, StorageErrorKind};
use crate::uploader::backend::{ObjectHead, StorageBackend};
use crate::uploader::chunk::CompletePart;
use crate::uploader::progress::UploadProgressListener;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;

/// 生成一个内容可校验的临时文件
pub fn pattern_file(size: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&pattern_bytes(size)).unwrap();
    file.flush().unwrap();
    file
}

pub fn pattern_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

pub fn etag_of(data: &[u8]) -> String {
    hex::encode(md5::compute(data).0)
}

/// 某个操作的故障脚本：前 `times` 次调用返回 `kind` 错误
#[derive(Debug, Clone, Copy)]
struct Fault {
    times: usize,
    kind: StorageErrorKind,
}

#[derive(Default)]
struct Faults {
    initiate: Option<Fault>,
    complete: Option<Fault>,
    abort: Option<Fault>,
    parts: HashMap<u32, Fault>,
    part_delays: HashMap<u32, Duration>,
}

/// 内存存储后端，可以按操作/分片注入失败
#[derive(Default)]
pub struct ScriptedBackend {
    faults: Mutex<Faults>,
    uploads: Mutex<HashMap<String, (String, String)>>,
    parts: Mutex<BTreeMap<(String, u32), Vec<u8>>>,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    part_attempts: Mutex<HashMap<u32, usize>>,
    manifests: Mutex<Vec<Vec<CompletePart>>>,
    initiate_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    abort_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_initiate(&self, times: usize, kind: StorageErrorKind) {
        self.faults.lock().initiate = Some(Fault { times, kind });
    }

    pub fn fail_complete(&self, times: usize, kind: StorageErrorKind) {
        self.faults.lock().complete = Some(Fault { times, kind });
    }

    pub fn fail_abort(&self, times: usize, kind: StorageErrorKind) {
        self.faults.lock().abort = Some(Fault { times, kind });
    }

    /// 让分片 `part_number` 的前 `times` 次上传失败
    pub fn fail_part(&self, part_number: u32, times: usize, kind: StorageErrorKind) {
        self.faults
            .lock()
            .parts
            .insert(part_number, Fault { times, kind });
    }

    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.faults.lock().part_delays.insert(part_number, delay);
    }

    /// 清除所有故障
    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn part_attempts(&self, part_number: u32) -> usize {
        self.part_attempts
            .lock()
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// 每次 complete 调用收到的清单
    pub fn manifests(&self) -> Vec<Vec<CompletePart>> {
        self.manifests.lock().clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|(data, _)| data.clone())
    }

    fn take_fault(slot: &mut Option<Fault>) -> Option<StorageErrorKind> {
        let fault = slot.as_mut()?;
        if fault.times == 0 {
            return None;
        }
        fault.times -= 1;
        Some(fault.kind)
    }
}

#[async_trait]
impl StorageBackend for ScriptedBackend {
    async fn initiate(&self, key: &str, content_type: &str) -> Result<String, StorageError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = Self::take_fault(&mut self.faults.lock().initiate) {
            return Err(StorageError::new(kind, "initiate failed"));
        }
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.lock().insert(
            upload_id.clone(),
            (key.to_string(), content_type.to_string()),
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, StorageError> {
        *self.part_attempts.lock().entry(part_number).or_insert(0) += 1;

        let (fault, delay) = {
            let mut faults = self.faults.lock();
            let delay = faults.part_delays.get(&part_number).copied();
            let fault = match faults.parts.get_mut(&part_number) {
                Some(f) if f.times > 0 => {
                    f.times -= 1;
                    Some(f.kind)
                }
                _ => None,
            };
            (fault, delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(kind) = fault {
            return Err(StorageError::new(
                kind,
                format!("part {} rejected", part_number),
            ));
        }

        if !self.uploads.lock().contains_key(upload_id) {
            return Err(StorageError::upload_not_found(upload_id));
        }
        let etag = etag_of(&data);
        self.parts
            .lock()
            .insert((upload_id.to_string(), part_number), data);
        Ok(etag)
    }

    async fn complete(
        &self,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> Result<String, StorageError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.manifests.lock().push(parts.to_vec());
        if let Some(kind) = Self::take_fault(&mut self.faults.lock().complete) {
            return Err(StorageError::new(kind, "complete failed"));
        }

        let (key, content_type) = self
            .uploads
            .lock()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| StorageError::upload_not_found(upload_id))?;

        let stored = self.parts.lock();
        let mut object = Vec::new();
        for part in parts {
            let data = stored
                .get(&(upload_id.to_string(), part.part_number))
                .ok_or_else(|| StorageError::bad_request("missing part"))?;
            if etag_of(data) != part.etag {
                return Err(StorageError::bad_request("etag mismatch"));
            }
            object.extend_from_slice(data);
        }
        drop(stored);

        self.objects.lock().insert(key.clone(), (object, content_type));
        self.uploads.lock().remove(upload_id);
        Ok(format!("mem://{}", key))
    }

    async fn abort(&self, upload_id: &str) -> Result<(), StorageError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = Self::take_fault(&mut self.faults.lock().abort) {
            return Err(StorageError::new(kind, "abort failed"));
        }
        self.uploads
            .lock()
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::upload_not_found(upload_id))
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(format!("mem://{}", key))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectHead>, StorageError> {
        Ok(self.objects.lock().get(key).map(|(data, content_type)| ObjectHead {
            key: key.to_string(),
            size: data.len() as u64,
            etag: etag_of(data),
            content_type: Some(content_type.clone()),
        }))
    }
}

/// 记录所有回调的监听器
#[derive(Default)]
pub struct RecordingListener {
    starts: Mutex<Vec<u32>>,
    completes: Mutex<Vec<u32>>,
    errors: Mutex<Vec<(u32, u32)>>,
    progress: Mutex<Vec<(usize, usize, u64, u64)>>,
}

impl RecordingListener {
    pub fn starts(&self) -> Vec<u32> {
        self.starts.lock().clone()
    }

    pub fn completes(&self) -> Vec<u32> {
        self.completes.lock().clone()
    }

    /// (分片号, 累计失败次数)
    pub fn errors(&self) -> Vec<(u32, u32)> {
        self.errors.lock().clone()
    }

    pub fn last_progress(&self) -> Option<(usize, usize, u64, u64)> {
        self.progress.lock().last().copied()
    }
}

impl UploadProgressListener for RecordingListener {
    fn on_chunk_start(&self, part_number: u32, _size: u64) {
        self.starts.lock().push(part_number);
    }

    fn on_chunk_complete(&self, part_number: u32, _size: u64, _etag: &str) {
        self.completes.lock().push(part_number);
    }

    fn on_chunk_error(&self, part_number: u32, _size: u64, _error: &StorageError, retry_count: u32) {
        self.errors.lock().push((part_number, retry_count));
    }

    fn on_progress(&self, completed: usize, total: usize, uploaded: u64, total_bytes: u64) {
        self.progress
            .lock()
            .push((completed, total, uploaded, total_bytes));
    }
}
