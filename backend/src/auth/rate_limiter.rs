//! 速率限制器模块
//!
//! 滑动窗口算法，按 `identity:action` 计数：
//! 1. `window_start = now - window`
//! 2. 移除时间戳 `<= window_start` 的记录
//! 3. 剩余记录数 `>= limit` 时拒绝，且不记录本次请求
//! 4. 否则记录 `now`，把键的过期时间刷新为一个窗口长度，放行
//!
//! 第 2~4 步必须在计数存储上作为一个原子操作执行，
//! 否则两个并发请求可能同时读到 `count < limit` 而一起放行。

use crate::auth::clock::Clock;
use crate::auth::config::RateLimitConfig;
use crate::auth::error::AuthError;
use crate::auth::types::RateDecision;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 计数键前缀
pub const RATE_LIMIT_KEY_PREFIX: &str = "rate_limit";

/// 内存计数存储清理任务间隔（秒）：5 分钟
pub const CLEANUP_INTERVAL_SECS: u64 = 5 * 60;

/// 一次原子检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    /// 本次请求是否被记录（放行）
    pub admitted: bool,
    /// 操作完成后窗口内的记录数
    pub count: u32,
}

/// 计数存储
///
/// 每个键是一个按时间排序的集合，`check_and_record` 把
/// 剪枝、计数、插入、刷新过期合并为一个原子步骤。
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn check_and_record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<CounterOutcome, AuthError>;

    /// 删除一个键的全部记录
    async fn reset(&self, key: &str) -> Result<(), AuthError>;
}

/// 单个键的窗口记录
#[derive(Debug, Default)]
struct WindowEntry {
    /// 放行请求的时间戳（毫秒），按时间升序
    hits: VecDeque<i64>,
    /// 键自身的过期时间（毫秒）
    expires_at_ms: i64,
}

/// 内存计数存储
///
/// 每个键的检查在 DashMap 分片写锁内完成。
/// 过期键由两处回收：`check_and_record` 每隔一个窗口顺带清理一次，
/// 以及可选的定时清理任务（应对长时间没有请求的情况）。
pub struct InMemoryCounterStore {
    entries: DashMap<String, WindowEntry>,
    clock: Arc<dyn Clock>,
    /// 上一次顺带清理的时间（毫秒）
    last_sweep_ms: AtomicI64,
    /// 清理任务取消令牌
    cleanup_cancel_token: RwLock<Option<CancellationToken>>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            last_sweep_ms: AtomicI64::new(i64::MIN),
            cleanup_cancel_token: RwLock::new(None),
        }
    }

    /// 启动定时清理任务
    pub async fn start_cleanup_task(self: &Arc<Self>) {
        self.start_cleanup_task_with_interval(Duration::from_secs(CLEANUP_INTERVAL_SECS))
            .await;
    }

    pub async fn start_cleanup_task_with_interval(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.cleanup_cancel_token.write().await;

        // 如果已有清理任务在运行，先停止它
        if let Some(token) = guard.take() {
            token.cancel();
        }

        let cancel_token = CancellationToken::new();
        *guard = Some(cancel_token.clone());
        drop(guard);

        let store = Arc::clone(self);

        tokio::spawn(async move {
            debug!("RateLimiter cleanup task started");

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("RateLimiter cleanup task cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        store.cleanup_expired(store.clock.timestamp_millis());
                    }
                }
            }
        });
    }

    /// 停止定时清理任务
    pub async fn stop_cleanup_task(&self) {
        let mut guard = self.cleanup_cancel_token.write().await;
        if let Some(token) = guard.take() {
            token.cancel();
            debug!("RateLimiter cleanup task stop requested");
        }
    }

    /// 清理已过期的键
    pub fn cleanup_expired(&self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(
                "RateLimiter cleanup: removed {} expired keys ({} left)",
                removed,
                self.entries.len()
            );
        }
        removed
    }

    /// 距上次清理已超过一个窗口时清理一次
    ///
    /// 只有抢到 `last_sweep_ms` 的调用者执行清理；调用时不能持有任何条目锁。
    fn sweep_if_due(&self, now_ms: i64, window_ms: i64) {
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < window_ms {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.cleanup_expired(now_ms);
        }
    }

    /// 活跃键数量（用于监控）
    pub fn active_keys_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn check_and_record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<CounterOutcome, AuthError> {
        self.sweep_if_due(now_ms, window_ms);

        let mut entry = self.entries.entry(key.to_string()).or_default();

        if entry.expires_at_ms <= now_ms {
            entry.hits.clear();
        }

        let window_start = now_ms - window_ms;
        while entry.hits.front().is_some_and(|&ts| ts <= window_start) {
            entry.hits.pop_front();
        }

        let count = u32::try_from(entry.hits.len()).unwrap_or(u32::MAX);
        if count >= limit {
            return Ok(CounterOutcome {
                admitted: false,
                count,
            });
        }

        entry.hits.push_back(now_ms);
        entry.expires_at_ms = now_ms + window_ms;

        Ok(CounterOutcome {
            admitted: true,
            count: count + 1,
        })
    }

    async fn reset(&self, key: &str) -> Result<(), AuthError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// 速率限制器
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    window_secs: u64,
    default_limit: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, window_secs: u64, default_limit: u32) -> Self {
        Self {
            store,
            window_secs,
            default_limit,
        }
    }

    pub fn from_config(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self::new(store, config.window_secs, config.default_limit)
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// 计数键：`rate_limit:{identity}:{action}`
    pub fn key_for(identity: &str, action: &str) -> String {
        format!("{}:{}:{}", RATE_LIMIT_KEY_PREFIX, identity, action)
    }

    /// 检查并记录一次请求
    ///
    /// # Arguments
    /// * `limit` - 覆盖默认上限，为空时使用 `default_limit`
    /// * `now_ms` - 当前时间（毫秒）
    pub async fn check(
        &self,
        identity: &str,
        action: &str,
        limit: Option<u32>,
        now_ms: i64,
    ) -> Result<RateDecision, AuthError> {
        let limit = limit.unwrap_or(self.default_limit);
        let key = Self::key_for(identity, action);
        let window_ms = i64::try_from(self.window_secs.saturating_mul(1000)).unwrap_or(i64::MAX);

        let outcome = self
            .store
            .check_and_record(&key, now_ms, window_ms, limit)
            .await?;

        if outcome.admitted {
            Ok(RateDecision::Allowed {
                remaining: limit.saturating_sub(outcome.count),
            })
        } else {
            warn!(action, count = outcome.count, limit, "rate limit exceeded");
            Ok(RateDecision::Denied {
                retry_after_secs: self.window_secs,
            })
        }
    }

    /// 检查并在超限时返回 `AuthError::RateLimited`
    pub async fn enforce(
        &self,
        identity: &str,
        action: &str,
        limit: Option<u32>,
        now_ms: i64,
    ) -> Result<(), AuthError> {
        match self.check(identity, action, limit, now_ms).await? {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Denied { retry_after_secs } => {
                Err(AuthError::RateLimited { retry_after_secs })
            }
        }
    }

    /// 清空某个 `identity:action` 的计数
    pub async fn reset(&self, identity: &str, action: &str) -> Result<(), AuthError> {
        self.store.reset(&Self::key_for(identity, action)).await
    }
}
