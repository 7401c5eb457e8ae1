//! 用户仓库模块
//!
//! 用户记录由持久化协作方拥有，认证核心只通过 `UserRepository` 读写。
//! 邮箱全局唯一，比较前统一转为小写。

use crate::auth::clock::Clock;
use crate::auth::error::AuthError;
use crate::auth::types::User;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// 用户仓库
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_email(&self, email: &str) -> Result<Option<User>, AuthError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError>;

    /// 创建用户，邮箱已存在时返回 `Conflict`
    async fn create(&self, email: &str, password_hash: &str) -> Result<User, AuthError>;

    async fn set_totp_secret(&self, id: Uuid, secret: &str) -> Result<(), AuthError>;

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), AuthError>;

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), AuthError>;
}

/// 内存用户存储
pub struct InMemoryUserStore {
    /// id -> User
    users: DashMap<Uuid, User>,
    /// email -> id
    emails: DashMap<String, Uuid>,
    clock: Arc<dyn Clock>,
}

impl InMemoryUserStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            users: DashMap::new(),
            emails: DashMap::new(),
            clock,
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn update<F>(&self, id: Uuid, apply: F) -> Result<(), AuthError>
    where
        F: FnOnce(&mut User),
    {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| AuthError::NotFound("user".to_string()))?;
        apply(user.value_mut());
        Ok(())
    }
}

#[async_trait]
impl UserRepository for InMemoryUserStore {
    async fn get_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let id = match self.emails.get(&email.to_lowercase()) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.users.get(&id).map(|user| user.value().clone()))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, AuthError> {
        Ok(self.users.get(&id).map(|user| user.value().clone()))
    }

    async fn create(&self, email: &str, password_hash: &str) -> Result<User, AuthError> {
        let email = email.to_lowercase();

        match self.emails.entry(email.clone()) {
            Entry::Occupied(_) => Err(AuthError::Conflict("email already registered".to_string())),
            Entry::Vacant(slot) => {
                let user = User {
                    id: Uuid::new_v4(),
                    email,
                    password_hash: password_hash.to_string(),
                    is_active: true,
                    totp_secret: None,
                    created_at: self.clock.now(),
                };
                self.users.insert(user.id, user.clone());
                slot.insert(user.id);
                Ok(user)
            }
        }
    }

    async fn set_totp_secret(&self, id: Uuid, secret: &str) -> Result<(), AuthError> {
        self.update(id, |user| user.totp_secret = Some(secret.to_string()))
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), AuthError> {
        self.update(id, |user| user.password_hash = password_hash.to_string())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), AuthError> {
        self.update(id, |user| user.is_active = active)
    }
}
