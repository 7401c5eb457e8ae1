//! 时间源模块
//!
//! 所有过期计算（令牌、会话、滑动窗口）都通过 `Clock` 取当前时间，
//! 测试中使用 `ManualClock` 精确控制时间推进。

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// 时间源
pub trait Clock: Send + Sync {
    /// 当前时刻（UTC）
    fn now(&self) -> DateTime<Utc>;

    /// 当前 Unix 时间戳（秒）
    fn timestamp(&self) -> i64 {
        self.now().timestamp()
    }

    /// 当前 Unix 时间戳（毫秒）
    fn timestamp_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟
///
/// 以毫秒精度保存时间，只有显式调用 `advance`/`set` 才会变化。
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// 从指定时刻开始
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// 从指定 Unix 时间戳（秒）开始
    pub fn at_timestamp(secs: i64) -> Self {
        Self {
            millis: AtomicI64::new(secs.saturating_mul(1000)),
        }
    }

    /// 时间前进
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// 时间前进若干秒
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// 设置为指定时刻
    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_told() {
        let clock = ManualClock::at_timestamp(1_700_000_000);
        assert_eq!(clock.timestamp(), 1_700_000_000);
        assert_eq!(clock.timestamp(), 1_700_000_000);

        clock.advance_secs(90);
        assert_eq!(clock.timestamp(), 1_700_000_090);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.timestamp_millis(), 1_700_000_091_500);
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::at_timestamp(0);
        let target = Utc.timestamp_opt(1_234_567_890, 0).unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn test_system_clock_is_recent() {
        let now = SystemClock.timestamp();
        assert!(now > 1_600_000_000);
    }
}
