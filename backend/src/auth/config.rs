//! 认证配置模块
//!
//! 配置以 TOML 形式存储（如 `config/auth.toml`），所有字段都有默认值。
//! 构造 `AuthService` 之后配置只读。

use crate::auth::error::AuthError;
use crate::auth::token::TokenService;
use crate::auth::types::RefreshPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/auth.toml";

/// 默认发行者名称
pub const DEFAULT_ISSUER: &str = "Auth Service";

/// Access Token 默认有效期（分钟）
pub const DEFAULT_ACCESS_TOKEN_TTL_MINUTES: i64 = 30;

/// Refresh Token 默认有效期（天）
pub const DEFAULT_REFRESH_TOKEN_TTL_DAYS: i64 = 7;

/// Access Token 有效期上限（分钟）：1 天
pub const MAX_ACCESS_TOKEN_TTL_MINUTES: i64 = 24 * 60;

/// Refresh Token 有效期上限（天）
pub const MAX_REFRESH_TOKEN_TTL_DAYS: i64 = 365;

/// 滑动窗口默认长度（秒）
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// 窗口内默认请求上限
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// 最小密码长度
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// 认证配置
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// 发行者名称（用于 TOTP provisioning URI）
    pub issuer: String,
    /// Access Token 签名密钥，为空则启动时随机生成
    pub access_secret: Option<String>,
    /// Refresh Token 签名密钥，必须与 access_secret 不同
    pub refresh_secret: Option<String>,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    pub refresh_policy: RefreshPolicy,
    pub rate_limit: RateLimitConfig,
    pub totp: TotpConfig,
    pub password: PasswordConfig,
    /// 协作方调用超时（毫秒）
    pub store_timeout_ms: u64,
    /// 事件发布超时（毫秒）
    pub event_timeout_ms: u64,
    /// 首个管理员账户
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_admin: Option<AdminBootstrap>,
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub default_limit: u32,
    /// 登录入口的单独上限，为空时使用 default_limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_limit: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_RATE_WINDOW_SECS,
            default_limit: DEFAULT_RATE_LIMIT,
            login_limit: None,
        }
    }
}

/// TOTP 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TotpConfig {
    /// 时间窗口容差（±N 个周期）
    pub skew: u8,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self { skew: 1 }
    }
}

/// 密码哈希配置 (Argon2id)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    pub min_length: usize,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            min_length: MIN_PASSWORD_LENGTH,
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
            parallelism: argon2::Params::DEFAULT_P_COST,
        }
    }
}

/// 首个管理员账户
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminBootstrap {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for AdminBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminBootstrap")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |s: &Option<String>| s.as_ref().map(|_| "***");
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("access_secret", &redact(&self.access_secret))
            .field("refresh_secret", &redact(&self.refresh_secret))
            .field("access_token_ttl_minutes", &self.access_token_ttl_minutes)
            .field("refresh_token_ttl_days", &self.refresh_token_ttl_days)
            .field("refresh_policy", &self.refresh_policy)
            .field("rate_limit", &self.rate_limit)
            .field("totp", &self.totp)
            .field("password", &self.password)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("event_timeout_ms", &self.event_timeout_ms)
            .field("bootstrap_admin", &self.bootstrap_admin)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            access_secret: None,
            refresh_secret: None,
            access_token_ttl_minutes: DEFAULT_ACCESS_TOKEN_TTL_MINUTES,
            refresh_token_ttl_days: DEFAULT_REFRESH_TOKEN_TTL_DAYS,
            refresh_policy: RefreshPolicy::Reuse,
            rate_limit: RateLimitConfig::default(),
            totp: TotpConfig::default(),
            password: PasswordConfig::default(),
            store_timeout_ms: 2000,
            event_timeout_ms: 500,
            bootstrap_admin: None,
        }
    }
}

impl AuthConfig {
    /// 从 TOML 字符串解析
    pub fn from_toml_str(content: &str) -> Result<Self, AuthError> {
        toml::from_str(content).map_err(|e| AuthError::ConfigError(format!("解析配置失败: {}", e)))
    }

    /// 从文件加载配置
    ///
    /// 文件不存在时返回默认配置。
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("认证配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| AuthError::ConfigError(format!("读取配置文件失败: {}", e)))?;

        let config = Self::from_toml_str(&content)?;
        info!("认证配置已加载: {:?}", path);
        Ok(config)
    }

    /// 补全缺失的签名密钥
    ///
    /// 随机生成的密钥只在本进程内有效，重启后已签发的令牌全部失效。
    pub fn resolve_secrets(&mut self) {
        if self.access_secret.as_deref().map_or(true, str::is_empty) {
            warn!("access_secret not configured, generating an ephemeral one");
            self.access_secret = Some(TokenService::generate_random_secret());
        }
        if self.refresh_secret.as_deref().map_or(true, str::is_empty) {
            warn!("refresh_secret not configured, generating an ephemeral one");
            self.refresh_secret = Some(TokenService::generate_random_secret());
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), AuthError> {
        if !(1..=MAX_ACCESS_TOKEN_TTL_MINUTES).contains(&self.access_token_ttl_minutes) {
            return Err(AuthError::ConfigError(format!(
                "access_token_ttl_minutes 必须在 1..={} 之间",
                MAX_ACCESS_TOKEN_TTL_MINUTES
            )));
        }
        if !(1..=MAX_REFRESH_TOKEN_TTL_DAYS).contains(&self.refresh_token_ttl_days) {
            return Err(AuthError::ConfigError(format!(
                "refresh_token_ttl_days 必须在 1..={} 之间",
                MAX_REFRESH_TOKEN_TTL_DAYS
            )));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(AuthError::ConfigError("rate_limit.window_secs 必须大于 0".to_string()));
        }
        if self.rate_limit.default_limit == 0 || self.rate_limit.login_limit == Some(0) {
            return Err(AuthError::ConfigError("rate_limit 上限必须大于 0".to_string()));
        }
        if self.store_timeout_ms == 0 || self.event_timeout_ms == 0 {
            return Err(AuthError::ConfigError("超时时间必须大于 0".to_string()));
        }
        if self.issuer.contains(':') {
            return Err(AuthError::ConfigError("issuer 不能包含 ':'".to_string()));
        }
        if let (Some(access), Some(refresh)) = (&self.access_secret, &self.refresh_secret) {
            if access == refresh {
                return Err(AuthError::ConfigError(
                    "access_secret 与 refresh_secret 不能相同".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_token_ttl_minutes.saturating_mul(60)
    }

    pub fn refresh_ttl_secs(&self) -> i64 {
        self.refresh_token_ttl_days.saturating_mul(24 * 60 * 60)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// 登录入口实际使用的上限
    pub fn login_limit(&self) -> u32 {
        self.rate_limit.login_limit.unwrap_or(self.rate_limit.default_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert_eq!(config.access_ttl_secs(), 30 * 60);
        assert_eq!(config.refresh_ttl_secs(), 7 * 24 * 60 * 60);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.totp.skew, 1);
        assert_eq!(config.refresh_policy, RefreshPolicy::Reuse);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AuthConfig::from_toml_str(
            r#"
            issuer = "Acme"
            refresh_policy = "rotate"

            [rate_limit]
            login_limit = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.issuer, "Acme");
        assert_eq!(config.refresh_policy, RefreshPolicy::Rotate);
        assert_eq!(config.login_limit(), 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.access_token_ttl_minutes, 30);
    }

    #[test]
    fn test_identical_secrets_rejected() {
        let config = AuthConfig {
            access_secret: Some("same".to_string()),
            refresh_secret: Some("same".to_string()),
            ..AuthConfig::default()
        };
        assert!(matches!(config.validate(), Err(AuthError::ConfigError(_))));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = AuthConfig::default();
        config.rate_limit.window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_ttl_rejected() {
        let config = AuthConfig {
            refresh_token_ttl_days: i64::MAX / 2,
            ..AuthConfig::default()
        };
        assert!(matches!(config.validate(), Err(AuthError::ConfigError(_))));
        assert_eq!(config.refresh_ttl_secs(), i64::MAX);

        let config = AuthConfig {
            access_token_ttl_minutes: MAX_ACCESS_TOKEN_TTL_MINUTES + 1,
            ..AuthConfig::default()
        };
        assert!(matches!(config.validate(), Err(AuthError::ConfigError(_))));

        let config = AuthConfig {
            access_token_ttl_minutes: MAX_ACCESS_TOKEN_TTL_MINUTES,
            refresh_token_ttl_days: MAX_REFRESH_TOKEN_TTL_DAYS,
            ..AuthConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_secrets_generates_distinct_keys() {
        let mut config = AuthConfig::default();
        config.resolve_secrets();

        let access = config.access_secret.clone().unwrap();
        let refresh = config.refresh_secret.clone().unwrap();
        assert_eq!(access.len(), 64);
        assert_ne!(access, refresh);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = AuthConfig {
            access_secret: Some("top-secret-access".to_string()),
            bootstrap_admin: Some(AdminBootstrap {
                email: "admin@example.com".to_string(),
                password: "changeme".to_string(),
            }),
            ..AuthConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("top-secret-access"));
        assert!(!rendered.contains("changeme"));
        assert!(rendered.contains("admin@example.com"));
    }

    #[test]
    fn test_example_config_parses() {
        let config =
            AuthConfig::from_toml_str(include_str!("../../config/auth.example.toml")).unwrap();
        assert_eq!(config.login_limit(), 5);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = AuthConfig::load(temp_dir.path().join("auth.toml")).await.unwrap();
        assert_eq!(config.issuer, DEFAULT_ISSUER);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth.toml");
        tokio::fs::write(
            &path,
            r#"
            access_token_ttl_minutes = 15

            [bootstrap_admin]
            email = "admin@example.com"
            password = "changeme"
            "#,
        )
        .await
        .unwrap();

        let config = AuthConfig::load(&path).await.unwrap();
        assert_eq!(config.access_token_ttl_minutes, 15);
        assert_eq!(config.bootstrap_admin.unwrap().email, "admin@example.com");
    }

    #[tokio::test]
    async fn test_load_malformed_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("auth.toml");
        tokio::fs::write(&path, "access_token_ttl_minutes = \"soon\"").await.unwrap();

        let result = AuthConfig::load(&path).await;
        assert!(matches!(result, Err(AuthError::ConfigError(_))));
    }
}
