//! 认证与会话模块
//!
//! 提供凭证校验、Access/Refresh 双令牌、TOTP 双因素认证、会话吊销、
//! 基于角色的授权以及保护登录入口的滑动窗口限流。

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod password;
pub mod rate_limiter;
pub mod rbac;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod service;
pub mod session;
pub mod token;
pub mod totp;
pub mod types;
pub mod users;

// 导出核心类型
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AdminBootstrap, AuthConfig, PasswordConfig, RateLimitConfig, TotpConfig, DEFAULT_CONFIG_PATH,
    DEFAULT_ISSUER, MIN_PASSWORD_LENGTH,
};
pub use error::{AuthError, ErrorResponse};
pub use events::{
    EventEmitter, EventPublisher, InMemoryEventPublisher, TracingEventPublisher, UserCreatedEvent,
    UserLoginEvent, TOPIC_USER_CREATED, TOPIC_USER_LOGIN,
};
pub use password::PasswordManager;
pub use rate_limiter::{CounterOutcome, CounterStore, InMemoryCounterStore, RateLimiter};
pub use rbac::{InMemoryRoleStore, RbacAuthorizer, RoleRepository, ADMIN_ROLE};
#[cfg(feature = "redis")]
pub use redis_store::{RedisCounterStore, RedisEventPublisher};
pub use service::{AuthCollaborators, AuthService, LoginStage, ACTION_LOGIN};
pub use session::{InMemorySessionStore, SessionRepository, SESSION_CLEANUP_INTERVAL_SECS};
pub use token::TokenService;
pub use totp::{TOTPManager, TOTP_DIGITS, TOTP_SKEW, TOTP_STEP};
pub use types::{
    IssuedToken, LoginRequest, PublicUser, RateDecision, RefreshPolicy, Role, Session, TokenClaims,
    TokenKind, TokenResponse, TotpEnrollment, User, UserRole,
};
pub use users::{InMemoryUserStore, UserRepository};
