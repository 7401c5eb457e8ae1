//! 领域事件模块
//!
//! 注册和登录成功后发布事件。发布失败或超时只记录日志，
//! 不会让登录失败，也不会无限期阻塞请求。

use crate::auth::error::{within, AuthError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// 用户注册事件主题
pub const TOPIC_USER_CREATED: &str = "user.created";

/// 用户登录事件主题
pub const TOPIC_USER_LOGIN: &str = "user.login";

/// 用户注册事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreatedEvent {
    pub user_id: Uuid,
    pub email: String,
    pub timestamp: DateTime<Utc>,
}

/// 用户登录事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoginEvent {
    pub user_id: Uuid,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// 事件发布器
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), AuthError>;
}

/// 只写日志的发布器（未接入消息总线时使用）
#[derive(Debug, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), AuthError> {
        debug!(topic, %payload, "event published");
        Ok(())
    }
}

/// 内存发布器，保存所有已发布事件
#[derive(Debug, Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().await.clone()
    }

    /// 某个主题下的全部事件
    pub async fn events_for(&self, topic: &str) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), AuthError> {
        self.events.lock().await.push((topic.to_string(), payload));
        Ok(())
    }
}

/// 事件发送器
///
/// 包装 `EventPublisher`，加上超时并吞掉错误。
pub struct EventEmitter {
    publisher: Arc<dyn EventPublisher>,
    timeout: Duration,
}

impl EventEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    /// 发布事件
    ///
    /// # Returns
    /// 是否发布成功；失败已记录日志，调用方无需处理
    pub async fn emit<T: Serialize>(&self, topic: &str, event: &T) -> bool {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic, error = %e, "failed to serialize event");
                return false;
            }
        };

        match within(self.timeout, "events.publish", self.publisher.publish(topic, payload)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, error = %e, "event delivery failed, continuing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, _topic: &str, _payload: serde_json::Value) -> Result<(), AuthError> {
            Err(AuthError::Unavailable("bus down".to_string()))
        }
    }

    struct HangingPublisher;

    #[async_trait]
    impl EventPublisher for HangingPublisher {
        async fn publish(&self, _topic: &str, _payload: serde_json::Value) -> Result<(), AuthError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn login_event() -> UserLoginEvent {
        UserLoginEvent {
            user_id: Uuid::new_v4(),
            email: "u1@x.com".to_string(),
            timestamp: Utc::now(),
            ip_address: Some("10.0.0.1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_emit_records_payload() {
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let emitter = EventEmitter::new(publisher.clone(), Duration::from_millis(500));
        let event = login_event();

        assert!(emitter.emit(TOPIC_USER_LOGIN, &event).await);

        let events = publisher.events_for(TOPIC_USER_LOGIN).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["email"], "u1@x.com");
        assert_eq!(events[0]["ip_address"], "10.0.0.1");
        assert_eq!(events[0]["user_id"], event.user_id.to_string());
        assert!(publisher.events_for(TOPIC_USER_CREATED).await.is_empty());
    }

    #[tokio::test]
    async fn test_login_event_omits_missing_ip() {
        let event = UserLoginEvent {
            ip_address: None,
            ..login_event()
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("ip_address").is_none());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_swallowed() {
        let emitter = EventEmitter::new(Arc::new(FailingPublisher), Duration::from_millis(500));
        assert!(!emitter.emit(TOPIC_USER_LOGIN, &login_event()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_publisher_times_out() {
        let emitter = EventEmitter::new(Arc::new(HangingPublisher), Duration::from_millis(500));
        assert!(!emitter.emit(TOPIC_USER_LOGIN, &login_event()).await);
    }

    #[tokio::test]
    async fn test_tracing_publisher_accepts_everything() {
        let emitter = EventEmitter::new(Arc::new(TracingEventPublisher), Duration::from_millis(500));
        assert!(emitter.emit(TOPIC_USER_CREATED, &login_event()).await);
    }
}
