//! 会话存储模块
//!
//! 每个会话对应一个已签发的 Refresh Token，支持多设备并存。
//! - 只保存 Refresh Token 的 SHA-256 哈希
//! - `find` 只返回 `active && now < expires_at` 的会话
//! - 吊销在同一个分片写锁内完成“检查 active + 置为 false”，
//!   并发刷新同一个已吊销令牌时都只能看到“不存在”
//! - 可选的定时清理任务移除过期和已吊销的记录

use crate::auth::clock::Clock;
use crate::auth::error::AuthError;
use crate::auth::token::TokenService;
use crate::auth::types::Session;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// 清理任务间隔（秒）：10 分钟
pub const SESSION_CLEANUP_INTERVAL_SECS: u64 = 10 * 60;

/// 会话仓库
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// 记录新会话
    async fn create(
        &self,
        user_id: Uuid,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<Session, AuthError>;

    /// 查找可用会话，已吊销或已过期的会话视为不存在
    async fn find(&self, refresh_token: &str) -> Result<Option<Session>, AuthError>;

    /// 吊销会话
    ///
    /// # Returns
    /// * `true` - 本次调用把一个活跃会话置为失效
    /// * `false` - 会话不存在或早已失效
    async fn revoke(&self, refresh_token: &str) -> Result<bool, AuthError>;

    /// 吊销用户的全部活跃会话，返回被吊销的数量
    async fn revoke_all(&self, user_id: Uuid) -> Result<usize, AuthError>;
}

/// 内存会话存储
pub struct InMemorySessionStore {
    /// refresh_token_hash -> Session
    sessions: DashMap<String, Session>,
    clock: Arc<dyn Clock>,
    /// 清理任务取消令牌
    cleanup_cancel_token: RwLock<Option<CancellationToken>>,
}

impl InMemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            cleanup_cancel_token: RwLock::new(None),
        }
    }

    /// 启动定时清理任务
    ///
    /// `find` 已按过期时间过滤，清理只用于回收内存。
    pub async fn start_cleanup_task(self: &Arc<Self>) {
        self.start_cleanup_task_with_interval(Duration::from_secs(SESSION_CLEANUP_INTERVAL_SECS))
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
            debug!("SessionStore cleanup task started");

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("SessionStore cleanup task cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            debug!(
                                "SessionStore cleanup: removed {} stale sessions ({} left)",
                                removed,
                                store.session_count()
                            );
                        }
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
            debug!("SessionStore cleanup task stop requested");
        }
    }

    /// 移除已过期或已吊销的会话，返回移除数量
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.timestamp();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.is_usable(now));
        before.saturating_sub(self.sessions.len())
    }

    /// 记录总数（含已失效但未清理的记录）
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 用户当前可用的会话数量
    pub fn active_session_count(&self, user_id: Uuid) -> usize {
        let now = self.clock.timestamp();
        self.sessions
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.is_usable(now))
            .count()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionStore {
    async fn create(
        &self,
        user_id: Uuid,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<Session, AuthError> {
        let token_hash = TokenService::hash_token(refresh_token);

        match self.sessions.entry(token_hash.clone()) {
            Entry::Occupied(_) => Err(AuthError::Conflict("session already recorded".to_string())),
            Entry::Vacant(slot) => {
                let session = Session {
                    id: Uuid::new_v4(),
                    user_id,
                    refresh_token_hash: token_hash,
                    expires_at,
                    created_at: self.clock.timestamp(),
                    active: true,
                };
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    async fn find(&self, refresh_token: &str) -> Result<Option<Session>, AuthError> {
        let token_hash = TokenService::hash_token(refresh_token);
        let now = self.clock.timestamp();

        Ok(self
            .sessions
            .get(&token_hash)
            .filter(|session| session.is_usable(now))
            .map(|session| session.value().clone()))
    }

    async fn revoke(&self, refresh_token: &str) -> Result<bool, AuthError> {
        let token_hash = TokenService::hash_token(refresh_token);

        // get_mut 持有分片写锁，检查与翻转是一个原子步骤
        let flipped = match self.sessions.get_mut(&token_hash) {
            Some(mut session) if session.active => {
                session.active = false;
                true
            }
            _ => false,
        };

        if flipped {
            debug!(token = %&token_hash[..8], "session revoked");
        }
        Ok(flipped)
    }

    async fn revoke_all(&self, user_id: Uuid) -> Result<usize, AuthError> {
        let mut revoked = 0;
        for mut session in self.sessions.iter_mut() {
            if session.user_id == user_id && session.active {
                session.active = false;
                revoked += 1;
            }
        }

        debug!(%user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;

    const NOW: i64 = 1_700_000_000;
    const WEEK: i64 = 7 * 24 * 60 * 60;

    fn store() -> (Arc<ManualClock>, Arc<InMemorySessionStore>) {
        let clock = Arc::new(ManualClock::at_timestamp(NOW));
        let store = Arc::new(InMemorySessionStore::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let (_clock, store) = store();
        let user_id = Uuid::new_v4();

        let session = store.create(user_id, "rt-1", NOW + WEEK).await.unwrap();
        assert!(session.active);
        assert_eq!(session.created_at, NOW);
        assert_ne!(session.refresh_token_hash, "rt-1");

        let found = store.find("rt-1").await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert!(store.find("rt-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_token_conflicts() {
        let (_clock, store) = store();
        let user_id = Uuid::new_v4();

        store.create(user_id, "rt-1", NOW + WEEK).await.unwrap();
        let result = store.create(user_id, "rt-1", NOW + WEEK).await;
        assert!(matches!(result, Err(AuthError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_find_filters_expired() {
        let (clock, store) = store();
        store.create(Uuid::new_v4(), "rt-1", NOW + 60).await.unwrap();

        clock.advance_secs(59);
        assert!(store.find("rt-1").await.unwrap().is_some());

        clock.advance_secs(1);
        assert!(store.find("rt-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let (_clock, store) = store();
        store.create(Uuid::new_v4(), "rt-1", NOW + WEEK).await.unwrap();

        assert!(store.revoke("rt-1").await.unwrap());
        assert!(!store.revoke("rt-1").await.unwrap());
        assert!(!store.revoke("rt-missing").await.unwrap());
        assert!(store.find("rt-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_all_only_touches_one_user() {
        let (_clock, store) = store();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        store.create(alice, "rt-a1", NOW + WEEK).await.unwrap();
        store.create(alice, "rt-a2", NOW + WEEK).await.unwrap();
        store.create(bob, "rt-b1", NOW + WEEK).await.unwrap();
        assert_eq!(store.active_session_count(alice), 2);

        assert_eq!(store.revoke_all(alice).await.unwrap(), 2);
        assert_eq!(store.revoke_all(alice).await.unwrap(), 0);

        assert!(store.find("rt-a1").await.unwrap().is_none());
        assert!(store.find("rt-a2").await.unwrap().is_none());
        assert!(store.find("rt-b1").await.unwrap().is_some());
        assert_eq!(store.active_session_count(bob), 1);
    }

    #[tokio::test]
    async fn test_concurrent_revoke_flips_once() {
        let (_clock, store) = store();
        store.create(Uuid::new_v4(), "rt-1", NOW + WEEK).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.revoke("rt-1").await.unwrap() }));
        }

        let mut flipped = 0;
        for handle in handles {
            if handle.await.unwrap() {
                flipped += 1;
            }
        }
        assert_eq!(flipped, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = store();
        let user_id = Uuid::new_v4();
        store.create(user_id, "rt-short", NOW + 60).await.unwrap();
        store.create(user_id, "rt-long", NOW + WEEK).await.unwrap();
        store.create(user_id, "rt-revoked", NOW + WEEK).await.unwrap();
        store.revoke("rt-revoked").await.unwrap();

        clock.advance_secs(120);
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.session_count(), 1);
        assert!(store.find("rt-long").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_runs_and_stops() {
        let (clock, store) = store();
        store.create(Uuid::new_v4(), "rt-1", NOW + 60).await.unwrap();
        clock.advance_secs(120);

        store
            .start_cleanup_task_with_interval(Duration::from_secs(5))
            .await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.session_count(), 0);

        store.stop_cleanup_task().await;
        assert!(store.cleanup_cancel_token.read().await.is_none());
    }
}
