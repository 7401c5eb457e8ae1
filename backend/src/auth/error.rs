//! 认证错误处理模块
//!
//! 认证相关的预期失败（凭证错误、令牌过期、限流等）与基础设施故障
//! （存储不可达、超时等）使用同一个错误类型，通过 `is_infrastructure`
//! 区分。对外响应时，凭证类与第二因子类失败统一折叠为
//! `invalid_credentials`，避免泄露具体哪一步失败。

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// 认证错误
#[derive(Debug, Error)]
pub enum AuthError {
    /// 邮箱或密码错误
    #[error("invalid credentials")]
    InvalidCredentials,

    /// 账户已启用 2FA，但请求未携带验证码
    #[error("second factor required")]
    SecondFactorRequired,

    /// TOTP 验证码错误
    #[error("invalid second factor")]
    InvalidSecondFactor,

    /// 账户未启用 2FA
    #[error("second factor not enrolled")]
    SecondFactorNotEnrolled,

    /// 账户已停用
    #[error("user is inactive")]
    InactiveUser,

    /// 令牌已过期
    #[error("token expired")]
    TokenExpired,

    /// 令牌签名错误或格式错误
    #[error("token invalid")]
    TokenInvalid,

    /// 会话已吊销或不存在
    #[error("session revoked")]
    SessionRevoked,

    /// 请求过于频繁
    #[error("too many requests, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// 缺少所需角色
    #[error("requires {0} role")]
    Forbidden(String),

    /// 实体不存在
    #[error("{0} not found")]
    NotFound(String),

    /// 唯一性冲突（如邮箱已注册）
    #[error("conflict: {0}")]
    Conflict(String),

    /// 输入不符合要求（邮箱格式、密码强度）
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// 协作方不可用或超时
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// 存储错误
    #[error("storage error: {0}")]
    StorageError(String),

    /// 哈希错误
    #[error("hash error: {0}")]
    HashError(String),

    /// TOTP 错误
    #[error("totp error: {0}")]
    TotpError(String),

    /// 配置错误
    #[error("config error: {0}")]
    ConfigError(String),

    /// 内部错误
    #[error("internal error: {0}")]
    InternalError(String),
}

/// 错误响应结构（对外返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP 状态码
    pub code: u16,
    /// 错误标识
    pub error: String,
    /// 错误消息
    pub message: String,
    /// 建议重试间隔（秒），仅限流时存在
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl AuthError {
    /// 是否为基础设施故障（而非认证语义上的失败）
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AuthError::Unavailable(_)
                | AuthError::StorageError(_)
                | AuthError::HashError(_)
                | AuthError::TotpError(_)
                | AuthError::ConfigError(_)
                | AuthError::InternalError(_)
        )
    }

    /// 是否属于对外需要折叠为 "invalid credentials" 的失败
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials
                | AuthError::SecondFactorRequired
                | AuthError::InvalidSecondFactor
                | AuthError::InactiveUser
        )
    }

    /// 转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidCredentials
            | AuthError::SecondFactorRequired
            | AuthError::InvalidSecondFactor
            | AuthError::InactiveUser
            | AuthError::TokenExpired
            | AuthError::TokenInvalid
            | AuthError::SessionRevoked => 401,
            AuthError::SecondFactorNotEnrolled | AuthError::InvalidInput(_) => 400,
            AuthError::RateLimited { .. } => 429,
            AuthError::Forbidden(_) => 403,
            AuthError::NotFound(_) => 404,
            AuthError::Conflict(_) => 409,
            AuthError::Unavailable(_) => 503,
            AuthError::StorageError(_)
            | AuthError::HashError(_)
            | AuthError::TotpError(_)
            | AuthError::ConfigError(_)
            | AuthError::InternalError(_) => 500,
        }
    }

    /// 转换为错误标识
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::SecondFactorRequired => "second_factor_required",
            AuthError::InvalidSecondFactor => "invalid_second_factor",
            AuthError::SecondFactorNotEnrolled => "second_factor_not_enrolled",
            AuthError::InactiveUser => "inactive_user",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenInvalid => "token_invalid",
            AuthError::SessionRevoked => "session_revoked",
            AuthError::RateLimited { .. } => "rate_limited",
            AuthError::Forbidden(_) => "forbidden",
            AuthError::NotFound(_) => "not_found",
            AuthError::Conflict(_) => "conflict",
            AuthError::InvalidInput(_) => "invalid_input",
            AuthError::Unavailable(_) => "unavailable",
            AuthError::StorageError(_) => "storage_error",
            AuthError::HashError(_) => "hash_error",
            AuthError::TotpError(_) => "totp_error",
            AuthError::ConfigError(_) => "config_error",
            AuthError::InternalError(_) => "internal_error",
        }
    }

    /// 转换为对外错误响应
    ///
    /// 凭证与第二因子失败统一返回 401 `invalid_credentials`；
    /// 基础设施故障只返回通用消息，不带内部细节。
    pub fn to_response(&self) -> ErrorResponse {
        if self.is_credential_failure() {
            let generic = AuthError::InvalidCredentials;
            return ErrorResponse {
                code: generic.status_code(),
                error: generic.error_code().to_string(),
                message: generic.to_string(),
                retry_after: None,
            };
        }

        let message = if self.is_infrastructure() {
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let retry_after = match self {
            AuthError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        ErrorResponse {
            code: self.status_code(),
            error: self.error_code().to_string(),
            message,
            retry_after,
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::InternalError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        AuthError::InternalError(format!("background task failed: {}", err))
    }
}

/// 在限定时间内等待协作方调用
///
/// 超时视为协作方不可用，返回 `AuthError::Unavailable`。
pub(crate) async fn within<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, AuthError>
where
    F: Future<Output = Result<T, AuthError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(operation, timeout_ms = limit.as_millis() as u64, "collaborator call timed out");
            Err(AuthError::Unavailable(format!(
                "{} timed out after {}ms",
                operation,
                limit.as_millis()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(AuthError::InvalidCredentials.status_code(), 401);
        assert_eq!(AuthError::RateLimited { retry_after_secs: 60 }.status_code(), 429);
        assert_eq!(AuthError::Forbidden("admin".to_string()).status_code(), 403);
        assert_eq!(AuthError::Conflict("email".to_string()).status_code(), 409);
        assert_eq!(AuthError::Unavailable("users".to_string()).status_code(), 503);
    }

    #[test]
    fn test_credential_failures_collapse() {
        for err in [
            AuthError::InvalidCredentials,
            AuthError::SecondFactorRequired,
            AuthError::InvalidSecondFactor,
            AuthError::InactiveUser,
        ] {
            let response = err.to_response();
            assert_eq!(response.code, 401);
            assert_eq!(response.error, "invalid_credentials");
            assert_eq!(response.message, "invalid credentials");
        }
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let response = AuthError::RateLimited { retry_after_secs: 60 }.to_response();
        assert_eq!(response.code, 429);
        assert_eq!(response.error, "rate_limited");
        assert_eq!(response.retry_after, Some(60));
    }

    #[test]
    fn test_infrastructure_errors_are_generic() {
        let err = AuthError::StorageError("connection refused to 10.0.0.5".to_string());
        assert!(err.is_infrastructure());
        assert!(!AuthError::TokenExpired.is_infrastructure());

        let response = err.to_response();
        assert_eq!(response.code, 500);
        assert!(!response.message.contains("10.0.0.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_times_out() {
        let result: Result<(), AuthError> = within(Duration::from_millis(50), "slow.op", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AuthError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_within_passes_result_through() {
        let result = within(Duration::from_secs(1), "fast.op", async { Ok::<_, AuthError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
