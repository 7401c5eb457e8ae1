//! 认证服务模块
//!
//! 把凭证校验、TOTP、令牌签发、会话、限流、RBAC 和事件组合成完整的认证流程：
//! 注册、登录、刷新、启用/验证 2FA、登出、吊销全部会话、角色检查。
//!
//! 登录流程：
//! `RateChecking → CredentialChecking → [SecondFactor] → TokenIssuing → SessionRecording → EventEmitting`
//! 任一阶段失败都以 `AuthError` 终止。
//!
//! 所有协作方调用都带超时（`store_timeout_ms`），超时返回 `AuthError::Unavailable`。

use crate::auth::clock::{Clock, SystemClock};
use crate::auth::config::AuthConfig;
use crate::auth::error::{within, AuthError};
use crate::auth::events::{
    EventEmitter, EventPublisher, TracingEventPublisher, UserCreatedEvent, UserLoginEvent,
    TOPIC_USER_CREATED, TOPIC_USER_LOGIN,
};
use crate::auth::password::PasswordManager;
use crate::auth::rate_limiter::{CounterStore, InMemoryCounterStore, RateLimiter};
use crate::auth::rbac::{InMemoryRoleStore, RbacAuthorizer, RoleRepository, ADMIN_ROLE};
use crate::auth::session::{InMemorySessionStore, SessionRepository};
use crate::auth::token::TokenService;
use crate::auth::totp::TOTPManager;
use crate::auth::types::{
    LoginRequest, PublicUser, RefreshPolicy, Role, TokenKind, TokenResponse, TotpEnrollment, User,
    UserRole,
};
use crate::auth::users::{InMemoryUserStore, UserRepository};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 登录限流使用的动作名
pub const ACTION_LOGIN: &str = "login";

/// 登录流程阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStage {
    RateChecking,
    CredentialChecking,
    SecondFactor,
    TokenIssuing,
    SessionRecording,
    EventEmitting,
    Done,
}

impl LoginStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStage::RateChecking => "rate_checking",
            LoginStage::CredentialChecking => "credential_checking",
            LoginStage::SecondFactor => "second_factor",
            LoginStage::TokenIssuing => "token_issuing",
            LoginStage::SessionRecording => "session_recording",
            LoginStage::EventEmitting => "event_emitting",
            LoginStage::Done => "done",
        }
    }
}

/// 认证服务依赖的外部协作方
#[derive(Clone)]
pub struct AuthCollaborators {
    pub users: Arc<dyn UserRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub counters: Arc<dyn CounterStore>,
    pub events: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
}

impl AuthCollaborators {
    /// 全部使用内存实现
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            users: Arc::new(InMemoryUserStore::new(clock.clone())),
            roles: Arc::new(InMemoryRoleStore::new(clock.clone())),
            sessions: Arc::new(InMemorySessionStore::new(clock.clone())),
            counters: Arc::new(InMemoryCounterStore::new(clock.clone())),
            events: Arc::new(TracingEventPublisher),
            clock,
        }
    }
}

impl Default for AuthCollaborators {
    fn default() -> Self {
        Self::in_memory(Arc::new(SystemClock))
    }
}

/// 认证服务
pub struct AuthService {
    config: AuthConfig,
    users: Arc<dyn UserRepository>,
    roles: Arc<dyn RoleRepository>,
    sessions: Arc<dyn SessionRepository>,
    tokens: TokenService,
    rate_limiter: RateLimiter,
    authorizer: RbacAuthorizer,
    passwords: Arc<PasswordManager>,
    totp: TOTPManager,
    events: EventEmitter,
    clock: Arc<dyn Clock>,
}

/// 规范化邮箱：去除首尾空白并转小写
fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let invalid = || AuthError::InvalidInput("邮箱格式不正确".to_string());

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || email.chars().any(|c| c.is_whitespace() || c == ':')
    {
        return Err(invalid());
    }
    Ok(())
}

impl AuthService {
    /// 创建认证服务
    ///
    /// 缺失的签名密钥会被随机生成，随后校验配置。
    pub fn new(mut config: AuthConfig, collaborators: AuthCollaborators) -> Result<Self, AuthError> {
        config.resolve_secrets();
        config.validate()?;

        let tokens = TokenService::from_config(&config)?;
        let passwords = Arc::new(PasswordManager::new(&config.password)?);
        let totp = TOTPManager::new(config.totp.skew);
        let rate_limiter = RateLimiter::from_config(collaborators.counters, &config.rate_limit);
        let authorizer = RbacAuthorizer::new(collaborators.roles.clone());
        let events = EventEmitter::new(collaborators.events, config.event_timeout());

        info!(
            refresh_policy = ?config.refresh_policy,
            access_ttl_secs = config.access_ttl_secs(),
            refresh_ttl_secs = config.refresh_ttl_secs(),
            "auth service initialized"
        );

        Ok(Self {
            config,
            users: collaborators.users,
            roles: collaborators.roles,
            sessions: collaborators.sessions,
            tokens,
            rate_limiter,
            authorizer,
            passwords,
            totp,
            events,
            clock: collaborators.clock,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn authorizer(&self) -> &RbacAuthorizer {
        &self.authorizer
    }

    /// 带超时地调用协作方
    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        within(self.config.store_timeout(), operation, fut).await
    }

    /// 在阻塞线程池中哈希密码，不占用异步工作线程
    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let passwords = Arc::clone(&self.passwords);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || passwords.hash_password(&password)).await?
    }

    /// 在阻塞线程池中验证密码
    ///
    /// 用户不存在时对占位哈希做一次验证，使两条分支耗时相当。
    async fn verify_password(&self, password: &str, hash: Option<&str>) -> Result<bool, AuthError> {
        let passwords = Arc::clone(&self.passwords);
        let password = password.to_string();
        let hash = hash.map(str::to_string);

        tokio::task::spawn_blocking(move || match hash {
            Some(hash) => passwords.verify_password(&password, &hash),
            None => Ok(passwords.verify_decoy(&password)),
        })
        .await?
    }

    /// 注册新用户
    pub async fn register(&self, email: &str, password: &str) -> Result<PublicUser, AuthError> {
        let email = normalize_email(email);
        validate_email(&email)?;
        self.passwords.validate_strength(password)?;

        if self.call("users.get_by_email", self.users.get_by_email(&email)).await?.is_some() {
            return Err(AuthError::Conflict("email already registered".to_string()));
        }

        let password_hash = self.hash_password(password).await?;
        let user = self
            .call("users.create", self.users.create(&email, &password_hash))
            .await?;

        info!(user_id = %user.id, "user registered");

        let event = UserCreatedEvent {
            user_id: user.id,
            email: user.email.clone(),
            timestamp: self.clock.now(),
        };
        self.events.emit(TOPIC_USER_CREATED, &event).await;

        Ok(user.to_public())
    }

    /// 登录
    pub async fn login(&self, request: LoginRequest) -> Result<TokenResponse, AuthError> {
        let email = normalize_email(&request.email);
        let mut stage = LoginStage::RateChecking;

        let result = self.run_login(&email, &request, &mut stage).await;
        match &result {
            Ok(_) => info!(email = %email, "login succeeded"),
            Err(e) if e.is_infrastructure() => {
                error!(stage = stage.as_str(), error = %e, "login failed")
            }
            Err(e) => warn!(
                email = %email,
                stage = stage.as_str(),
                reason = e.error_code(),
                "login rejected"
            ),
        }
        result
    }

    async fn run_login(
        &self,
        email: &str,
        request: &LoginRequest,
        stage: &mut LoginStage,
    ) -> Result<TokenResponse, AuthError> {
        // 先限流，再校验凭证，避免借登录接口高速探测密码
        self.call(
            "rate_limiter.check",
            self.rate_limiter.enforce(
                email,
                ACTION_LOGIN,
                Some(self.config.login_limit()),
                self.clock.timestamp_millis(),
            ),
        )
        .await?;

        *stage = LoginStage::CredentialChecking;
        let user = self.call("users.get_by_email", self.users.get_by_email(email)).await?;
        let password_ok = self
            .verify_password(&request.password, user.as_ref().map(|u| u.password_hash.as_str()))
            .await?;
        let user = match user {
            Some(user) if password_ok => user,
            _ => return Err(AuthError::InvalidCredentials),
        };
        if !user.is_active {
            return Err(AuthError::InactiveUser);
        }

        if let Some(secret) = user.totp_secret.as_deref() {
            *stage = LoginStage::SecondFactor;
            let code = request
                .totp_code
                .as_deref()
                .ok_or(AuthError::SecondFactorRequired)?;
            if !self.check_totp(secret, code)? {
                return Err(AuthError::InvalidSecondFactor);
            }
        }

        *stage = LoginStage::TokenIssuing;
        let response = self.issue_pair(&user, stage).await?;

        *stage = LoginStage::EventEmitting;
        let event = UserLoginEvent {
            user_id: user.id,
            email: user.email.clone(),
            timestamp: self.clock.now(),
            ip_address: request.ip_address.clone(),
        };
        self.events.emit(TOPIC_USER_LOGIN, &event).await;

        *stage = LoginStage::Done;
        Ok(response)
    }

    fn check_totp(&self, secret: &str, code: &str) -> Result<bool, AuthError> {
        let now = u64::try_from(self.clock.timestamp()).unwrap_or_default();
        self.totp.verify(secret, code, now)
    }

    /// 签发令牌对并记录会话
    async fn issue_pair(&self, user: &User, stage: &mut LoginStage) -> Result<TokenResponse, AuthError> {
        let now = self.clock.timestamp();
        let access = self.tokens.issue_access(&user.email, now)?;
        let refresh = self.tokens.issue_refresh(&user.email, now)?;

        *stage = LoginStage::SessionRecording;
        self.call(
            "sessions.create",
            self.sessions.create(user.id, &refresh.token, refresh.expires_at()),
        )
        .await?;

        Ok(TokenResponse::new(&access, refresh.token.clone(), refresh.expires_at()))
    }

    /// 用 Refresh Token 换取新的 Access Token
    ///
    /// 签名有效但会话已吊销的令牌同样被拒绝。
    /// `RefreshPolicy::Reuse` 沿用原 Refresh Token；`Rotate` 吊销旧令牌并签发新令牌。
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let now = self.clock.timestamp();
        let claims = self.tokens.validate(refresh_token, TokenKind::Refresh, now)?;

        let session = self
            .call("sessions.find", self.sessions.find(refresh_token))
            .await?
            .ok_or_else(|| {
                warn!("refresh rejected: session revoked or unknown");
                AuthError::SessionRevoked
            })?;

        let user = self
            .call("users.get_by_id", self.users.get_by_id(session.user_id))
            .await?
            .ok_or_else(|| AuthError::NotFound("user".to_string()))?;
        if user.email != claims.sub {
            warn!(user_id = %user.id, "refresh token subject does not match session owner");
            return Err(AuthError::TokenInvalid);
        }
        if !user.is_active {
            return Err(AuthError::InactiveUser);
        }

        let access = self.tokens.issue_access(&user.email, now)?;

        let response = match self.config.refresh_policy {
            RefreshPolicy::Reuse => {
                TokenResponse::new(&access, refresh_token.to_string(), session.expires_at)
            }
            RefreshPolicy::Rotate => {
                // 并发轮换同一个令牌时只有一个调用能成功吊销
                if !self.call("sessions.revoke", self.sessions.revoke(refresh_token)).await? {
                    return Err(AuthError::SessionRevoked);
                }
                let rotated = self.tokens.issue_refresh(&user.email, now)?;
                self.call(
                    "sessions.create",
                    self.sessions.create(user.id, &rotated.token, rotated.expires_at()),
                )
                .await?;
                TokenResponse::new(&access, rotated.token.clone(), rotated.expires_at())
            }
        };

        debug!(user_id = %user.id, policy = ?self.config.refresh_policy, "access token refreshed");
        Ok(response)
    }

    /// 校验 Access Token 并解析出当前用户
    pub async fn authenticate(&self, access_token: &str) -> Result<User, AuthError> {
        let claims = self
            .tokens
            .validate(access_token, TokenKind::Access, self.clock.timestamp())?;

        let user = self
            .call("users.get_by_email", self.users.get_by_email(&claims.sub))
            .await?
            .ok_or(AuthError::TokenInvalid)?;
        if !user.is_active {
            return Err(AuthError::InactiveUser);
        }
        Ok(user)
    }

    /// 启用 2FA
    ///
    /// 每次调用都生成新密钥并覆盖旧密钥，保存后立即对登录生效。
    pub async fn enable_2fa(&self, access_token: &str) -> Result<TotpEnrollment, AuthError> {
        let user = self.authenticate(access_token).await?;

        let secret = TOTPManager::generate_secret();
        let provisioning_uri = self
            .totp
            .provisioning_uri(&secret, &user.email, &self.config.issuer)?;

        self.call("users.set_totp_secret", self.users.set_totp_secret(user.id, &secret))
            .await?;

        info!(user_id = %user.id, "2FA enrolled");
        Ok(TotpEnrollment {
            secret,
            provisioning_uri,
        })
    }

    /// 验证 2FA，成功后签发新的令牌对
    pub async fn verify_2fa(&self, access_token: &str, code: &str) -> Result<TokenResponse, AuthError> {
        let user = self.authenticate(access_token).await?;

        let secret = user
            .totp_secret
            .as_deref()
            .ok_or(AuthError::SecondFactorNotEnrolled)?;
        if !self.check_totp(secret, code)? {
            warn!(user_id = %user.id, "2FA verification failed");
            return Err(AuthError::InvalidSecondFactor);
        }

        let mut stage = LoginStage::TokenIssuing;
        let response = self.issue_pair(&user, &mut stage).await?;
        info!(user_id = %user.id, "2FA verified");
        Ok(response)
    }

    /// 登出：吊销 Refresh Token 对应的会话
    ///
    /// 已签发的 Access Token 在自然过期前仍然有效。
    ///
    /// # Returns
    /// * `true` - 本次调用吊销了会话
    /// * `false` - 会话不存在或已吊销
    pub async fn logout(&self, refresh_token: &str) -> Result<bool, AuthError> {
        let revoked = self
            .call("sessions.revoke", self.sessions.revoke(refresh_token))
            .await?;
        debug!(revoked, "logout");
        Ok(revoked)
    }

    /// 吊销用户的全部会话
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<usize, AuthError> {
        let revoked = self
            .call("sessions.revoke_all", self.sessions.revoke_all(user_id))
            .await?;
        info!(%user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }

    /// 要求调用方已认证且拥有指定角色
    ///
    /// 未携带令牌返回 `TokenInvalid`，缺少角色返回 `Forbidden`。
    pub async fn require_role(
        &self,
        access_token: Option<&str>,
        role_name: &str,
    ) -> Result<User, AuthError> {
        let access_token = access_token.ok_or(AuthError::TokenInvalid)?;
        let user = self.authenticate(access_token).await?;
        self.authorizer.require_role(user.id, role_name).await?;
        Ok(user)
    }

    /// 创建角色
    pub async fn create_role(&self, name: &str, description: Option<&str>) -> Result<Role, AuthError> {
        let role = self
            .call("roles.create_role", self.roles.create_role(name, description))
            .await?;
        info!(role = name, "role created");
        Ok(role)
    }

    /// 按角色名为用户分配角色
    pub async fn grant_role(&self, user_id: Uuid, role_name: &str) -> Result<UserRole, AuthError> {
        let role = self
            .call("roles.get_role_by_name", self.roles.get_role_by_name(role_name))
            .await?
            .ok_or_else(|| AuthError::NotFound("role".to_string()))?;

        let link = self
            .call("roles.assign_role", self.roles.assign_role(user_id, role.id))
            .await?;
        info!(%user_id, role = role_name, "role granted");
        Ok(link)
    }

    /// 按角色名移除用户角色
    pub async fn revoke_role(&self, user_id: Uuid, role_name: &str) -> Result<bool, AuthError> {
        let Some(role) = self
            .call("roles.get_role_by_name", self.roles.get_role_by_name(role_name))
            .await?
        else {
            return Ok(false);
        };

        let removed = self
            .call("roles.remove_role", self.roles.remove_role(user_id, role.id))
            .await?;
        if removed {
            info!(%user_id, role = role_name, "role revoked");
        }
        Ok(removed)
    }

    /// 修改密码
    ///
    /// 校验当前密码后保存新哈希，并吊销该用户的全部会话。
    pub async fn change_password(
        &self,
        access_token: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<usize, AuthError> {
        let user = self.authenticate(access_token).await?;

        if !self
            .verify_password(current_password, Some(&user.password_hash))
            .await?
        {
            return Err(AuthError::InvalidCredentials);
        }
        self.passwords.validate_strength(new_password)?;

        let new_hash = self.hash_password(new_password).await?;
        self.call(
            "users.set_password_hash",
            self.users.set_password_hash(user.id, &new_hash),
        )
        .await?;

        info!(user_id = %user.id, "password changed");
        self.revoke_all(user.id).await
    }

    /// 停用用户并吊销其全部会话
    pub async fn deactivate_user(&self, user_id: Uuid) -> Result<usize, AuthError> {
        self.call("users.set_active", self.users.set_active(user_id, false))
            .await?;
        info!(%user_id, "user deactivated");
        self.revoke_all(user_id).await
    }

    /// 初始化管理员角色和首个管理员账户
    ///
    /// 可重复调用；未配置 `bootstrap_admin` 时只确保 admin 角色存在。
    pub async fn bootstrap_admin(&self) -> Result<Option<PublicUser>, AuthError> {
        let role = match self
            .call("roles.get_role_by_name", self.roles.get_role_by_name(ADMIN_ROLE))
            .await?
        {
            Some(role) => role,
            None => match self.create_role(ADMIN_ROLE, Some("Administrator")).await {
                Ok(role) => role,
                Err(AuthError::Conflict(_)) => self
                    .call("roles.get_role_by_name", self.roles.get_role_by_name(ADMIN_ROLE))
                    .await?
                    .ok_or_else(|| AuthError::InternalError("admin role vanished".to_string()))?,
                Err(e) => return Err(e),
            },
        };

        let Some(admin) = self.config.bootstrap_admin.as_ref() else {
            return Ok(None);
        };

        let email = normalize_email(&admin.email);
        let user = match self.call("users.get_by_email", self.users.get_by_email(&email)).await? {
            Some(user) => user,
            None => {
                self.register(&email, &admin.password).await?;
                self.call("users.get_by_email", self.users.get_by_email(&email))
                    .await?
                    .ok_or_else(|| AuthError::InternalError("admin user vanished".to_string()))?
            }
        };

        self.call("roles.assign_role", self.roles.assign_role(user.id, role.id))
            .await?;
        info!(user_id = %user.id, "admin account ready");
        Ok(Some(user.to_public()))
    }
}
