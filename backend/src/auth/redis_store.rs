//! Redis 协作方
//!
//! 滑动窗口计数器存储和事件发布器，多实例部署时共享限流状态。

use crate::auth::error::AuthError;
use crate::auth::events::EventPublisher;
use crate::auth::rate_limiter::{CounterOutcome, CounterStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

/// 滑动窗口脚本：剪枝、计数、插入、刷新过期在服务端一步完成
///
/// KEYS[1] = 计数键
/// ARGV = now_ms, window_ms, limit, member（成员标识）
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count >= limit then
    return {0, count}
end

redis.call('ZADD', key, now, ARGV[4])
redis.call('PEXPIRE', key, window)
return {1, count + 1}
"#;

/// 建立连接管理器，并用 PING 确认连接可用
pub async fn connect(redis_url: &str, timeout: Duration) -> Result<ConnectionManager, AuthError> {
    let client = Client::open(redis_url)
        .map_err(|e| AuthError::ConfigError(format!("无效的 Redis URL: {}", e)))?;

    let mut manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            AuthError::Unavailable(format!(
                "连接 Redis 超时（{}ms）",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| AuthError::Unavailable(format!("连接 Redis 失败: {}", e)))?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut manager)
        .await
        .map_err(|e| AuthError::Unavailable(format!("Redis PING 失败: {}", e)))?;
    if pong != "PONG" {
        return Err(AuthError::Unavailable(format!(
            "Redis PING 返回了意外的响应: {}",
            pong
        )));
    }

    tracing::info!("Redis connection established");
    Ok(manager)
}

/// Redis 计数存储
///
/// 每个键是一个有序集合，score 为请求时间戳（毫秒）。
pub struct RedisCounterStore {
    connection_manager: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
    ) -> Result<CounterOutcome, AuthError> {
        let mut conn = self.connection_manager.clone();
        // 成员带随机后缀，同一毫秒内的请求分别计数
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let (admitted, count): (i64, i64) = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AuthError::StorageError(format!("限流脚本执行失败: {}", e)))?;

        Ok(CounterOutcome {
            admitted: admitted == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), AuthError> {
        let mut conn = self.connection_manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| AuthError::StorageError(format!("重置计数失败: {}", e)))
    }
}

/// Redis 事件发布器
///
/// 以 JSON 字符串 PUBLISH 到与主题同名的频道。
pub struct RedisEventPublisher {
    connection_manager: ConnectionManager,
}

impl RedisEventPublisher {
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self { connection_manager }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), AuthError> {
        let mut conn = self.connection_manager.clone();
        let body = serde_json::to_string(&payload)?;

        conn.publish::<_, _, ()>(topic, body)
            .await
            .map_err(|e| AuthError::Unavailable(format!("发布事件失败: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::rate_limiter::RateLimiter;
    use std::sync::Arc;

    fn redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok()
    }

    #[test]
    fn test_script_covers_all_steps() {
        for command in ["ZREMRANGEBYSCORE", "ZCARD", "ZADD", "PEXPIRE"] {
            assert!(SLIDING_WINDOW_SCRIPT.contains(command));
        }
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let result = connect("not-a-redis-url", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(AuthError::ConfigError(_))));
    }

    // 需要可用的 Redis，未设置 REDIS_URL 时跳过
    #[tokio::test]
    async fn test_sliding_window_against_redis() {
        let Some(url) = redis_url() else {
            return;
        };
        let manager = connect(&url, Duration::from_secs(5)).await.unwrap();
        let limiter = RateLimiter::new(Arc::new(RedisCounterStore::new(manager)), 60, 2);
        let identity = uuid::Uuid::new_v4().to_string();
        let t0 = 1_700_000_000_000;

        assert!(limiter.check(&identity, "login", None, t0).await.unwrap().is_allowed());
        assert!(limiter.check(&identity, "login", None, t0).await.unwrap().is_allowed());
        assert!(!limiter.check(&identity, "login", None, t0 + 1).await.unwrap().is_allowed());
        assert!(limiter.check(&identity, "login", None, t0 + 60_000).await.unwrap().is_allowed());

        limiter.reset(&identity, "login").await.unwrap();
    }
}
