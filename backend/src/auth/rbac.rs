//! 角色授权模块
//!
//! 成员关系按角色 id 判断而非名称，角色改名不影响已有授权。
//! 授权检查失败即拒绝：角色不存在、无成员关系、仓库出错都返回 false。

use crate::auth::clock::Clock;
use crate::auth::error::AuthError;
use crate::auth::types::{Role, UserRole};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 管理员角色名
pub const ADMIN_ROLE: &str = "admin";

/// 角色 / 用户角色仓库
#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn get_role_by_name(&self, name: &str) -> Result<Option<Role>, AuthError>;

    async fn list_user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>, AuthError>;

    /// 为用户分配角色，已分配时返回原有记录
    async fn assign_role(&self, user_id: Uuid, role_id: Uuid) -> Result<UserRole, AuthError>;

    /// 创建角色，名称重复时返回 `Conflict`
    async fn create_role(&self, name: &str, description: Option<&str>) -> Result<Role, AuthError>;

    /// 删除用户角色关联，返回是否删除了记录
    async fn remove_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool, AuthError>;
}

/// 内存角色存储
pub struct InMemoryRoleStore {
    /// role_id -> Role
    roles: DashMap<Uuid, Role>,
    /// name -> role_id
    names: DashMap<String, Uuid>,
    /// user_id -> 成员关系
    memberships: DashMap<Uuid, Vec<UserRole>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRoleStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            roles: DashMap::new(),
            names: DashMap::new(),
            memberships: DashMap::new(),
            clock,
        }
    }

    /// 角色改名
    pub fn rename_role(&self, role_id: Uuid, new_name: &str) -> Result<Role, AuthError> {
        let old_name = self
            .roles
            .get(&role_id)
            .map(|role| role.name.clone())
            .ok_or_else(|| AuthError::NotFound("role".to_string()))?;

        match self.names.entry(new_name.to_string()) {
            Entry::Occupied(_) => {
                return Err(AuthError::Conflict(format!("role {} already exists", new_name)))
            }
            Entry::Vacant(slot) => {
                slot.insert(role_id);
            }
        }
        self.names.remove(&old_name);

        let mut role = self
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| AuthError::NotFound("role".to_string()))?;
        role.name = new_name.to_string();
        Ok(role.value().clone())
    }
}

#[async_trait]
impl RoleRepository for InMemoryRoleStore {
    async fn get_role_by_name(&self, name: &str) -> Result<Option<Role>, AuthError> {
        let role_id = match self.names.get(name) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.roles.get(&role_id).map(|role| role.value().clone()))
    }

    async fn list_user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>, AuthError> {
        Ok(self
            .memberships
            .get(&user_id)
            .map(|links| links.value().clone())
            .unwrap_or_default())
    }

    async fn assign_role(&self, user_id: Uuid, role_id: Uuid) -> Result<UserRole, AuthError> {
        if !self.roles.contains_key(&role_id) {
            return Err(AuthError::NotFound("role".to_string()));
        }

        let mut links = self.memberships.entry(user_id).or_default();
        if let Some(existing) = links.iter().find(|link| link.role_id == role_id) {
            return Ok(existing.clone());
        }

        let link = UserRole {
            user_id,
            role_id,
            assigned_at: self.clock.now(),
        };
        links.push(link.clone());
        Ok(link)
    }

    async fn create_role(&self, name: &str, description: Option<&str>) -> Result<Role, AuthError> {
        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => Err(AuthError::Conflict(format!("role {} already exists", name))),
            Entry::Vacant(slot) => {
                let role = Role {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    description: description.map(str::to_string),
                };
                self.roles.insert(role.id, role.clone());
                slot.insert(role.id);
                Ok(role)
            }
        }
    }

    async fn remove_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool, AuthError> {
        let Some(mut links) = self.memberships.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = links.len();
        links.retain(|link| link.role_id != role_id);
        Ok(links.len() != before)
    }
}

/// RBAC 授权器
pub struct RbacAuthorizer {
    roles: Arc<dyn RoleRepository>,
}

impl RbacAuthorizer {
    pub fn new(roles: Arc<dyn RoleRepository>) -> Self {
        Self { roles }
    }

    async fn lookup(&self, user_id: Uuid, role_name: &str) -> Result<bool, AuthError> {
        let Some(role) = self.roles.get_role_by_name(role_name).await? else {
            debug!(role = role_name, "unknown role");
            return Ok(false);
        };

        let links = self.roles.list_user_roles(user_id).await?;
        Ok(links.iter().any(|link| link.role_id == role.id))
    }

    /// 用户是否拥有指定角色
    ///
    /// 仓库出错时记录警告并返回 false。
    pub async fn has_role(&self, user_id: Uuid, role_name: &str) -> bool {
        match self.lookup(user_id, role_name).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(%user_id, role = role_name, error = %e, "role lookup failed, denying");
                false
            }
        }
    }

    /// 要求用户拥有指定角色，否则返回 `AuthError::Forbidden`
    pub async fn require_role(&self, user_id: Uuid, role_name: &str) -> Result<(), AuthError> {
        if self.has_role(user_id, role_name).await {
            Ok(())
        } else {
            info!(%user_id, role = role_name, "authorization denied");
            Err(AuthError::Forbidden(role_name.to_string()))
        }
    }
}
