//! 分片重试退避策略
//!
//! 指数退避：第 n 次重试（n >= 1）前等待 `retry_delay * 2^(n-1)`，上限 60 秒。
//! 曲线单调不减，base 为 0 时不等待。
//!
//! - retry_count=1: base
//! - retry_count=2: base * 2
//! - retry_count=3: base * 4
//! - 最大: 60000ms

use std::time::Duration;

/// 最大退避时间（毫秒）
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// 计算第 `retry_count` 次重试前的等待时间
///
/// # 参数
/// * `base_delay_ms` - 配置的基础延迟（毫秒）
/// * `retry_count` - 已失败次数（从 1 开始），0 按 1 处理
pub fn calculate_backoff_delay(base_delay_ms: u64, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(63);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let delay = base_delay_ms.saturating_mul(factor).min(MAX_BACKOFF_MS);
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_curve() {
        assert_eq!(calculate_backoff_delay(1000, 1), Duration::from_millis(1000));
        assert_eq!(calculate_backoff_delay(1000, 2), Duration::from_millis(2000));
        assert_eq!(calculate_backoff_delay(1000, 3), Duration::from_millis(4000));
        assert_eq!(calculate_backoff_delay(1000, 0), Duration::from_millis(1000));
    }

    #[test]
    fn test_cap_and_overflow() {
        assert_eq!(
            calculate_backoff_delay(1000, 10),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
        assert_eq!(
            calculate_backoff_delay(u64::MAX, u32::MAX),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
        assert_eq!(calculate_backoff_delay(0, 5), Duration::ZERO);
    }

    #[test]
    fn test_monotonic() {
        for base in [0u64, 1, 250, 1000, 7_000] {
            let mut last = Duration::ZERO;
            for retry in 1..80 {
                let delay = calculate_backoff_delay(base, retry);
                assert!(delay >= last, "base={} retry={}", base, retry);
                last = delay;
            }
        }
    }
}
