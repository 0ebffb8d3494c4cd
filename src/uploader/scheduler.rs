// 分片并发调度器
//
// 设计要点：
// - 使用 Semaphore 控制最大并发分片数，JoinSet 管理并发任务
// - 每个分片由一个 worker 独占，所有重试都在该 worker 内顺序进行
// - 会话超时与取消都是协作式的：正在进行的上传允许完成，但不再派发新分片
// - 单个分片耗尽重试不会中断其他分片

use crate::config::ChunkUploadConfig;
use crate::error::{StorageError, StorageErrorKind};
use crate::uploader::backoff::calculate_backoff_delay;
use crate::uploader::chunk::{Chunk, ChunkState};
use crate::uploader::progress::{NoopProgress, UploadProgressListener};
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 调度结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerOutcome {
    /// 所有分片上传成功
    AllSucceeded,
    /// 至少一个分片耗尽重试（或遇到不可重试错误）
    PartialFailure { failed_chunks: Vec<ChunkState> },
    /// 会话超时，仍有分片未完成
    TimedOut { remaining_chunks: Vec<ChunkState> },
    /// 被取消，仍有分片未完成
    Cancelled { remaining_chunks: Vec<ChunkState> },
}

impl SchedulerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SchedulerOutcome::AllSucceeded)
    }
}

/// 一次调度的完整报告
#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub outcome: SchedulerOutcome,
    /// 所有输入分片的最终状态，按分片号升序
    pub chunks: Vec<ChunkState>,
}

/// 单个 worker 的结束状态
enum WorkerResult {
    Uploaded(ChunkState),
    Failed(ChunkState),
    /// 因超时或取消在重试前停止
    Interrupted(ChunkState),
}

/// 派发循环的停止原因
enum Dispatch {
    Permit(tokio::sync::OwnedSemaphorePermit),
    Cancelled,
    DeadlineReached,
    Closed,
}

struct WorkerContext {
    max_retries: u32,
    retry_delay_ms: u64,
    deadline: Instant,
    cancel_token: CancellationToken,
    listener: Arc<dyn UploadProgressListener>,
}

/// 分片并发调度器
pub struct ConcurrencyScheduler {
    max_concurrency: usize,
    max_retries: u32,
    retry_delay_ms: u64,
    timeout: std::time::Duration,
    deadline: Option<Instant>,
    cancel_token: CancellationToken,
    listener: Arc<dyn UploadProgressListener>,
}

impl ConcurrencyScheduler {
    pub fn new(config: &ChunkUploadConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency() as usize,
            max_retries: config.max_retries(),
            retry_delay_ms: config.retry_delay_ms(),
            timeout: config.timeout(),
            deadline: None,
            cancel_token: CancellationToken::new(),
            listener: Arc::new(NoopProgress),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn UploadProgressListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// 指定截止时间（默认为 run 开始时刻 + 配置超时）
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 执行调度
    ///
    /// 输入中已上传的分片原样保留，只派发 `uploaded == false` 的分片。
    ///
    /// # 参数
    /// * `chunks` - 分片状态列表
    /// * `upload_one` - 上传单个分片，成功时返回 ETag
    pub async fn run<F, Fut>(&self, chunks: Vec<ChunkState>, upload_one: F) -> SchedulerReport
    where
        F: Fn(Chunk) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, StorageError>> + Send + 'static,
    {
        let deadline = self.deadline.unwrap_or_else(|| Instant::now() + self.timeout);
        let total_parts = chunks.len();
        let total_bytes: u64 = chunks.iter().map(|c| c.size()).sum();

        let (uploaded, pending): (Vec<ChunkState>, Vec<ChunkState>) =
            chunks.into_iter().partition(|c| c.is_uploaded());

        let mut completed_parts = uploaded.len();
        let mut uploaded_bytes: u64 = uploaded.iter().map(|c| c.size()).sum();

        info!(
            "[调度器] 开始调度: 待上传 {} 个分片, 已完成 {} 个, 最大并发 {}",
            pending.len(),
            completed_parts,
            self.max_concurrency
        );

        let mut done: Vec<ChunkState> = uploaded;
        let mut failed: Vec<ChunkState> = Vec::new();
        let mut interrupted: Vec<ChunkState> = Vec::new();
        let mut queue: VecDeque<ChunkState> = pending.into();

        // 正在运行的分片（任务异常退出时用于找回状态）
        let mut in_flight: BTreeMap<u32, ChunkState> = BTreeMap::new();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let upload_one = Arc::new(upload_one);
        let ctx = Arc::new(WorkerContext {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            deadline,
            cancel_token: self.cancel_token.clone(),
            listener: self.listener.clone(),
        });
        let mut join_set: JoinSet<WorkerResult> = JoinSet::new();

        let mut handle = |result: WorkerResult,
                          in_flight: &mut BTreeMap<u32, ChunkState>,
                          done: &mut Vec<ChunkState>,
                          failed: &mut Vec<ChunkState>,
                          interrupted: &mut Vec<ChunkState>| {
            match result {
                WorkerResult::Uploaded(state) => {
                    in_flight.remove(&state.part_number());
                    completed_parts += 1;
                    uploaded_bytes += state.size();
                    self.listener.on_progress(
                        completed_parts,
                        total_parts,
                        uploaded_bytes,
                        total_bytes,
                    );
                    done.push(state);
                }
                WorkerResult::Failed(state) => {
                    in_flight.remove(&state.part_number());
                    failed.push(state);
                }
                WorkerResult::Interrupted(state) => {
                    in_flight.remove(&state.part_number());
                    interrupted.push(state);
                }
            }
        };

        while let Some(state) = queue.pop_front() {
            let dispatch = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => Dispatch::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Dispatch::DeadlineReached,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => Dispatch::Permit(p),
                    Err(_) => Dispatch::Closed,
                },
            };

            let permit = match dispatch {
                Dispatch::Permit(p) => p,
                Dispatch::Cancelled => {
                    info!("[调度器] 已取消，停止派发新分片");
                    queue.push_front(state);
                    break;
                }
                Dispatch::DeadlineReached => {
                    warn!("[调度器] 会话超时，停止派发新分片");
                    queue.push_front(state);
                    break;
                }
                Dispatch::Closed => {
                    queue.push_front(state);
                    break;
                }
            };

            in_flight.insert(state.part_number(), state.clone());

            let upload_one = upload_one.clone();
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let fallback = state.clone();
                match AssertUnwindSafe(drive_chunk(state, upload_one, ctx))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        let mut state = fallback;
                        error!("[分片#{}] 上传任务 panic", state.part_number());
                        state.mark_failed(StorageError::new(
                            StorageErrorKind::Unknown,
                            "chunk worker panicked",
                        ));
                        WorkerResult::Failed(state)
                    }
                }
            });

            // 非阻塞收集已完成的任务
            while let Some(joined) = join_set.try_join_next() {
                match joined {
                    Ok(result) => {
                        handle(result, &mut in_flight, &mut done, &mut failed, &mut interrupted)
                    }
                    Err(e) => error!("[调度器] 分片任务异常退出: {}", e),
                }
            }
        }

        // 等待所有剩余任务完成
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    handle(result, &mut in_flight, &mut done, &mut failed, &mut interrupted)
                }
                Err(e) => error!("[调度器] 分片任务异常退出: {}", e),
            }
        }

        // 任务异常退出而没有回报的分片按失败处理
        for (_, mut state) in std::mem::take(&mut in_flight) {
            state.mark_failed(StorageError::new(
                StorageErrorKind::Unknown,
                "chunk task terminated unexpectedly",
            ));
            failed.push(state);
        }

        let mut remaining: Vec<ChunkState> = queue.into_iter().chain(interrupted).collect();

        let outcome = if !remaining.is_empty() {
            remaining.extend(failed.iter().cloned());
            remaining.sort_by_key(|c| c.part_number());
            if self.cancel_token.is_cancelled() {
                SchedulerOutcome::Cancelled {
                    remaining_chunks: remaining.clone(),
                }
            } else {
                SchedulerOutcome::TimedOut {
                    remaining_chunks: remaining.clone(),
                }
            }
        } else if !failed.is_empty() {
            failed.sort_by_key(|c| c.part_number());
            SchedulerOutcome::PartialFailure {
                failed_chunks: failed.clone(),
            }
        } else {
            SchedulerOutcome::AllSucceeded
        };

        let mut chunks: Vec<ChunkState> = done;
        match &outcome {
            SchedulerOutcome::TimedOut { remaining_chunks }
            | SchedulerOutcome::Cancelled { remaining_chunks } => {
                chunks.extend(remaining_chunks.iter().cloned())
            }
            _ => chunks.extend(failed),
        }
        chunks.sort_by_key(|c| c.part_number());

        match &outcome {
            SchedulerOutcome::AllSucceeded => {
                info!("[调度器] ✓ 所有 {} 个分片上传完成", total_parts)
            }
            SchedulerOutcome::PartialFailure { failed_chunks } => error!(
                "[调度器] {} 个分片失败: {:?}",
                failed_chunks.len(),
                failed_chunks.iter().map(|c| c.part_number()).collect::<Vec<_>>()
            ),
            SchedulerOutcome::TimedOut { remaining_chunks } => warn!(
                "[调度器] 超时，剩余 {} 个分片未完成",
                remaining_chunks.len()
            ),
            SchedulerOutcome::Cancelled { remaining_chunks } => info!(
                "[调度器] 已取消，剩余 {} 个分片未完成",
                remaining_chunks.len()
            ),
        }

        SchedulerReport { outcome, chunks }
    }
}

/// 上传单个分片（含重试）
///
/// 同一分片的所有尝试严格顺序执行。首次尝试外共最多重试 `max_retries` 次。
async fn drive_chunk<F, Fut>(
    mut state: ChunkState,
    upload_one: Arc<F>,
    ctx: Arc<WorkerContext>,
) -> WorkerResult
where
    F: Fn(Chunk) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, StorageError>> + Send + 'static,
{
    let chunk = state.chunk();

    loop {
        debug!(
            "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes, 已失败 {} 次)",
            chunk.part_number,
            chunk.start,
            chunk.end - 1,
            chunk.size,
            state.retry_count()
        );
        ctx.listener.on_chunk_start(chunk.part_number, chunk.size);

        let err = match (upload_one.as_ref())(chunk).await {
            Ok(etag) if state.mark_completed(etag.as_str()) => {
                debug!("[分片#{}] ✓ 上传成功, etag={}", chunk.part_number, etag);
                ctx.listener
                    .on_chunk_complete(chunk.part_number, chunk.size, state.etag());
                return WorkerResult::Uploaded(state);
            }
            Ok(_) => StorageError::new(
                StorageErrorKind::ServerError,
                "storage backend returned an empty etag",
            ),
            Err(e) => e,
        };

        let retry_count = state.mark_failed(err.clone());
        ctx.listener
            .on_chunk_error(chunk.part_number, chunk.size, &err, retry_count);

        if !err.is_retriable() {
            error!(
                "[分片#{}] 上传失败（不可重试）: {}",
                chunk.part_number, err
            );
            return WorkerResult::Failed(state);
        }

        if retry_count > ctx.max_retries {
            error!(
                "[分片#{}] 重试次数已耗尽 ({} 次失败): {}",
                chunk.part_number, retry_count, err
            );
            return WorkerResult::Failed(state);
        }

        let delay = calculate_backoff_delay(ctx.retry_delay_ms, retry_count);
        warn!(
            "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
            chunk.part_number,
            delay.as_millis(),
            retry_count,
            ctx.max_retries,
            err
        );

        let wake_at = std::cmp::min(Instant::now() + delay, ctx.deadline);
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => {
                return WorkerResult::Interrupted(state);
            }
            _ = tokio::time::sleep_until(wake_at) => {}
        }

        if Instant::now() >= ctx.deadline {
            debug!("[分片#{}] 会话超时，放弃重试", chunk.part_number);
            return WorkerResult::Interrupted(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::{plan_chunks, ChunkRoster};
    use crate::uploader::testing::RecordingListener;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn config(max_concurrency: u32, max_retries: u32) -> ChunkUploadConfig {
        ChunkUploadConfig::new(5 * MIB, 0, max_concurrency, max_retries, 0, 30).unwrap()
    }

    fn states(parts: u64) -> Vec<ChunkState> {
        ChunkRoster::from_plan(plan_chunks(parts * 5 * MIB, 5 * MIB).unwrap())
            .chunks()
            .to_vec()
    }

    fn part_numbers(chunks: &[ChunkState]) -> Vec<u32> {
        chunks.iter().map(|c| c.part_number()).collect()
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));

        let scheduler = ConcurrencyScheduler::new(&config(3, 0));
        let upload = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let gate = gate.clone();
            move |chunk: Chunk| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let gate = gate.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    gate.acquire().await.unwrap().forget();
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, StorageError>(format!("etag-{}", chunk.part_number))
                }
            }
        };

        let run = tokio::spawn(async move { scheduler.run(states(8), upload).await });

        // 等待三个槽位全部占满
        for _ in 0..200 {
            if in_flight.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(in_flight.load(Ordering::SeqCst), 3);

        gate.add_permits(8);
        let report = run.await.unwrap();

        assert_eq!(report.outcome, SchedulerOutcome::AllSucceeded);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(report.chunks.iter().all(|c| c.is_uploaded()));
        assert_eq!(part_numbers(&report.chunks), (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let scheduler = ConcurrencyScheduler::new(&config(2, 3));
        let counter = attempts.clone();

        let report = scheduler
            .run(states(1), move |_chunk| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(StorageError::network("connection reset"))
                }
            })
            .await;

        // 首次尝试 + 3 次重试
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match report.outcome {
            SchedulerOutcome::PartialFailure { failed_chunks } => {
                assert_eq!(part_numbers(&failed_chunks), vec![1]);
                assert_eq!(failed_chunks[0].retry_count(), 4);
                assert_eq!(
                    failed_chunks[0].last_error().unwrap().message,
                    "connection reset"
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let failures: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let scheduler = ConcurrencyScheduler::new(&config(3, 3));
        let seen = failures.clone();

        let report = scheduler
            .run(states(3), move |chunk| {
                let seen = seen.clone();
                async move {
                    let mut seen = seen.lock();
                    let count = seen.entry(chunk.part_number).or_insert(0);
                    if chunk.part_number == 2 && *count < 2 {
                        *count += 1;
                        return Err(StorageError::new(StorageErrorKind::Timeout, "slow"));
                    }
                    Ok(format!("etag-{}", chunk.part_number))
                }
            })
            .await;

        assert_eq!(report.outcome, SchedulerOutcome::AllSucceeded);
        assert_eq!(report.chunks[1].retry_count(), 2);
        assert_eq!(report.chunks[0].retry_count(), 0);
        assert_eq!(report.chunks[1].etag(), "etag-2");
    }

    #[tokio::test]
    async fn test_one_exhausted_chunk_does_not_stop_others() {
        let scheduler = ConcurrencyScheduler::new(&config(2, 1));
        let report = scheduler
            .run(states(4), |chunk| async move {
                if chunk.part_number == 3 {
                    Err(StorageError::network("reset"))
                } else {
                    Ok(format!("etag-{}", chunk.part_number))
                }
            })
            .await;

        match &report.outcome {
            SchedulerOutcome::PartialFailure { failed_chunks } => {
                assert_eq!(part_numbers(failed_chunks), vec![3]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let uploaded: Vec<u32> = report
            .chunks
            .iter()
            .filter(|c| c.is_uploaded())
            .map(|c| c.part_number())
            .collect();
        assert_eq!(uploaded, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_non_retriable_error_fails_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let scheduler = ConcurrencyScheduler::new(&config(1, 5));

        let report = scheduler
            .run(states(1), move |_chunk| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(StorageError::new(StorageErrorKind::Forbidden, "denied"))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(
            report.outcome,
            SchedulerOutcome::PartialFailure { .. }
        ));
        assert_eq!(report.chunks[0].retry_count(), 1);
    }

    #[tokio::test]
    async fn test_already_uploaded_chunks_are_skipped() {
        let mut chunks = states(4);
        chunks[0].mark_completed("old-1");
        chunks[2].mark_completed("old-3");

        let called = Arc::new(Mutex::new(Vec::new()));
        let record = called.clone();
        let scheduler = ConcurrencyScheduler::new(&config(4, 0));

        let report = scheduler
            .run(chunks, move |chunk| {
                let record = record.clone();
                async move {
                    record.lock().push(chunk.part_number);
                    Ok(format!("new-{}", chunk.part_number))
                }
            })
            .await;

        let mut called = called.lock().clone();
        called.sort();
        assert_eq!(called, vec![2, 4]);
        assert_eq!(report.outcome, SchedulerOutcome::AllSucceeded);
        assert_eq!(report.chunks[0].etag(), "old-1");
        assert_eq!(report.chunks[1].etag(), "new-2");
    }

    #[tokio::test]
    async fn test_empty_etag_is_a_failed_attempt() {
        let scheduler = ConcurrencyScheduler::new(&config(1, 1));
        let report = scheduler
            .run(states(1), |_chunk| async { Ok(String::new()) })
            .await;

        match report.outcome {
            SchedulerOutcome::PartialFailure { failed_chunks } => {
                assert!(!failed_chunks[0].is_uploaded());
                assert_eq!(failed_chunks[0].retry_count(), 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_stops_dispatch_but_lets_in_flight_finish() {
        let scheduler = ConcurrencyScheduler::new(&config(1, 0))
            .with_deadline(Instant::now() + Duration::from_millis(150));

        let report = scheduler
            .run(states(5), |chunk| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(format!("etag-{}", chunk.part_number))
            })
            .await;

        match &report.outcome {
            SchedulerOutcome::TimedOut { remaining_chunks } => {
                assert_eq!(part_numbers(remaining_chunks), vec![3, 4, 5]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        // 第二个分片在截止前派发，允许跑完
        assert!(report.chunks[0].is_uploaded());
        assert!(report.chunks[1].is_uploaded());
        assert_eq!(report.chunks.len(), 5);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_backoff() {
        let config = ChunkUploadConfig::new(5 * MIB, 0, 1, 5, 10_000, 30).unwrap();
        let scheduler = ConcurrencyScheduler::new(&config)
            .with_deadline(Instant::now() + Duration::from_millis(100));

        let started = std::time::Instant::now();
        let report = scheduler
            .run(states(1), |_chunk| async {
                Err::<String, _>(StorageError::network("reset"))
            })
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        match report.outcome {
            SchedulerOutcome::TimedOut { remaining_chunks } => {
                assert_eq!(remaining_chunks[0].retry_count(), 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let scheduler = ConcurrencyScheduler::new(&config(2, 0)).with_cancel_token(token);
        let report = scheduler
            .run(states(3), move |_chunk| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("etag".to_string())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match report.outcome {
            SchedulerOutcome::Cancelled { remaining_chunks } => {
                assert_eq!(part_numbers(&remaining_chunks), vec![1, 2, 3]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_panic_is_contained() {
        let scheduler = ConcurrencyScheduler::new(&config(2, 0));
        let report = scheduler
            .run(states(3), |chunk| async move {
                if chunk.part_number == 2 {
                    panic!("boom");
                }
                Ok(format!("etag-{}", chunk.part_number))
            })
            .await;

        match report.outcome {
            SchedulerOutcome::PartialFailure { failed_chunks } => {
                assert_eq!(part_numbers(&failed_chunks), vec![2]);
                assert_eq!(
                    failed_chunks[0].last_error().unwrap().kind,
                    StorageErrorKind::Unknown
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_callbacks() {
        let listener = Arc::new(RecordingListener::default());
        let scheduler = ConcurrencyScheduler::new(&config(1, 1)).with_listener(listener.clone());
        let first = Arc::new(AtomicUsize::new(0));

        scheduler
            .run(states(2), move |chunk| {
                let first = first.clone();
                async move {
                    if chunk.part_number == 1 && first.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(StorageError::network("reset"));
                    }
                    Ok(format!("etag-{}", chunk.part_number))
                }
            })
            .await;

        assert_eq!(listener.starts(), vec![1, 1, 2]);
        assert_eq!(listener.errors(), vec![(1, 1)]);
        assert_eq!(listener.completes(), vec![1, 2]);
        assert_eq!(listener.last_progress(), Some((2, 2, 10 * MIB, 10 * MIB)));
    }
}
