//! 认证类型定义模块
//!
//! 定义用户、会话、角色、令牌声明等核心数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 令牌类型字段的固定值
pub const TOKEN_TYPE_BEARER: &str = "bearer";

/// 用户记录（由持久化协作方拥有）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// 全局唯一邮箱
    pub email: String,
    /// PHC 格式的密码哈希 (Argon2id)
    pub password_hash: String,
    pub is_active: bool,
    /// TOTP 密钥 (Base32)，未启用 2FA 时为空
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// 是否启用了 TOTP
    pub fn has_totp(&self) -> bool {
        self.totp_secret.is_some()
    }

    /// 去除敏感字段后的用户信息
    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            email: self.email.clone(),
            is_active: self.is_active,
            totp_enabled: self.has_totp(),
            created_at: self.created_at,
        }
    }
}

/// 对外返回的用户信息（不含密码哈希和 TOTP 密钥）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    pub totp_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// 会话：一条已签发的 Refresh Token 记录
///
/// Refresh Token 原文不落盘，只保存 SHA-256 哈希。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Refresh Token 的 SHA-256 哈希（hex）
    pub refresh_token_hash: String,
    /// 过期时间（Unix 时间戳，秒）
    pub expires_at: i64,
    /// 创建时间（Unix 时间戳，秒）
    pub created_at: i64,
    pub active: bool,
}

impl Session {
    /// 会话仅在 `active && now < expires_at` 时可用
    pub fn is_usable(&self, now: i64) -> bool {
        self.active && now < self.expires_at
    }
}

/// 角色
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 用户-角色关联
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_at: DateTime<Utc>,
}

/// 令牌种类，决定使用哪一把签名密钥
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// JWT Claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (用户邮箱)
    pub sub: String,
    /// Issued At (签发时间)
    pub iat: i64,
    /// Expiration (过期时间)
    pub exp: i64,
    /// JWT ID (唯一标识)
    pub jti: String,
}

/// 已签名的令牌及其声明
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
}

impl IssuedToken {
    pub fn expires_at(&self) -> i64 {
        self.claims.exp
    }
}

/// 令牌响应（login / refresh / 2FA verify 的成功输出）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// 固定为 "bearer"
    pub token_type: String,
    /// Access Token 过期时间（Unix 时间戳）
    pub access_expires_at: i64,
    /// Refresh Token 过期时间（Unix 时间戳）
    pub refresh_expires_at: i64,
}

impl TokenResponse {
    pub fn new(access: &IssuedToken, refresh_token: String, refresh_expires_at: i64) -> Self {
        Self {
            access_token: access.token.clone(),
            refresh_token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            access_expires_at: access.expires_at(),
            refresh_expires_at,
        }
    }
}

/// 登录请求
#[derive(Clone, Default, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// TOTP 验证码（启用 2FA 的账户必填）
    #[serde(default)]
    pub totp_code: Option<String>,
    /// 客户端 IP，仅用于事件和日志
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"***")
            .field("totp_code", &self.totp_code.as_ref().map(|_| "***"))
            .field("ip_address", &self.ip_address)
            .finish()
    }
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            totp_code: None,
            ip_address: None,
        }
    }

    pub fn with_totp(mut self, code: impl Into<String>) -> Self {
        self.totp_code = Some(code.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

/// 2FA 启用结果
#[derive(Debug, Clone, Serialize)]
pub struct TotpEnrollment {
    /// TOTP 密钥（Base32 编码）
    pub secret: String,
    /// otpauth:// URI，用于生成二维码
    pub provisioning_uri: String,
}

/// Refresh Token 使用策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// 刷新时沿用同一个 Refresh Token
    #[default]
    Reuse,
    /// 每次刷新都吊销旧令牌并签发新令牌
    Rotate,
}

/// 速率限制判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// 放行，附带窗口内剩余次数
    Allowed { remaining: u32 },
    /// 拒绝，附带建议重试间隔（秒）
    Denied { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "u1@x.com".to_string(),
            password_hash: "$argon2id$v=19$...".to_string(),
            is_active: true,
            totp_secret: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_public_user_hides_secrets() {
        let mut user = sample_user();
        user.totp_secret = Some("JBSWY3DPEHPK3PXP".to_string());

        let public = user.to_public();
        assert!(public.totp_enabled);

        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains("argon2"));
        assert!(!json.contains("JBSWY3DPEHPK3PXP"));
    }

    #[test]
    fn test_session_usable_window() {
        let session = Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            refresh_token_hash: "hash".to_string(),
            expires_at: 1000,
            created_at: 0,
            active: true,
        };
        assert!(session.is_usable(999));
        assert!(!session.is_usable(1000));

        let revoked = Session {
            active: false,
            ..session
        };
        assert!(!revoked.is_usable(10));
    }

    #[test]
    fn test_refresh_policy_serde() {
        let policy: RefreshPolicy = serde_json::from_str("\"rotate\"").unwrap();
        assert_eq!(policy, RefreshPolicy::Rotate);
        assert_eq!(RefreshPolicy::default(), RefreshPolicy::Reuse);
    }
}
