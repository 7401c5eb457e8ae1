//! Token 服务模块
//!
//! 签发和校验 JWT (HS256)。
//! - Access Token: 默认有效期 30 分钟，使用 access 密钥签名
//! - Refresh Token: 默认有效期 7 天，使用独立的 refresh 密钥签名
//!
//! 两类令牌的密钥必须不同，一类令牌无法冒充另一类。
//! 过期判断使用调用方传入的时间，而不是系统时钟。

use crate::auth::config::AuthConfig;
use crate::auth::error::AuthError;
use crate::auth::types::{IssuedToken, TokenClaims, TokenKind};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;

/// 随机密钥字节数
const SECRET_BYTES: usize = 32;

/// 一类令牌的签名材料
struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl SigningKeys {
    fn new(secret: &str, ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }
}

/// Token 服务
pub struct TokenService {
    access: SigningKeys,
    refresh: SigningKeys,
    validation: Validation,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl_secs", &self.access.ttl_secs)
            .field("refresh_ttl_secs", &self.refresh.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// 创建新的 Token 服务
    ///
    /// # Arguments
    /// * `access_secret` - Access Token 签名密钥
    /// * `refresh_secret` - Refresh Token 签名密钥，必须与 `access_secret` 不同
    /// * `access_ttl_secs` / `refresh_ttl_secs` - 有效期（秒）
    pub fn new(
        access_secret: &str,
        refresh_secret: &str,
        access_ttl_secs: i64,
        refresh_ttl_secs: i64,
    ) -> Result<Self, AuthError> {
        if access_secret.is_empty() || refresh_secret.is_empty() {
            return Err(AuthError::ConfigError("签名密钥不能为空".to_string()));
        }
        if access_secret == refresh_secret {
            return Err(AuthError::ConfigError(
                "access 与 refresh 签名密钥不能相同".to_string(),
            ));
        }
        if access_ttl_secs <= 0 || refresh_ttl_secs <= 0 {
            return Err(AuthError::ConfigError("令牌有效期必须大于 0".to_string()));
        }

        // 过期由 validate() 按注入的时间判断，jsonwebtoken 只负责签名与格式
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["sub", "exp"]);

        Ok(Self {
            access: SigningKeys::new(access_secret, access_ttl_secs),
            refresh: SigningKeys::new(refresh_secret, refresh_ttl_secs),
            validation,
        })
    }

    /// 按配置创建（配置中的密钥需已补全）
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let access = config
            .access_secret
            .as_deref()
            .ok_or_else(|| AuthError::ConfigError("access_secret 未配置".to_string()))?;
        let refresh = config
            .refresh_secret
            .as_deref()
            .ok_or_else(|| AuthError::ConfigError("refresh_secret 未配置".to_string()))?;

        Self::new(access, refresh, config.access_ttl_secs(), config.refresh_ttl_secs())
    }

    /// 生成随机密钥（32 字节，hex 编码）
    pub fn generate_random_secret() -> String {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..SECRET_BYTES).map(|_| rng.gen()).collect();
        hex::encode(bytes)
    }

    fn keys(&self, kind: TokenKind) -> &SigningKeys {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    pub fn ttl_secs(&self, kind: TokenKind) -> i64 {
        self.keys(kind).ttl_secs
    }

    /// 签发令牌
    ///
    /// `exp = now + ttl`，每个令牌带唯一的 `jti`，同一秒内签发的令牌也互不相同。
    pub fn issue(&self, kind: TokenKind, subject: &str, now: i64) -> Result<IssuedToken, AuthError> {
        let keys = self.keys(kind);
        let claims = TokenClaims {
            sub: subject.to_string(),
            iat: now,
            exp: now.saturating_add(keys.ttl_secs),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| AuthError::InternalError(format!("JWT encode error: {}", e)))?;

        debug!(kind = kind.as_str(), exp = claims.exp, "token issued");
        Ok(IssuedToken { token, claims })
    }

    pub fn issue_access(&self, subject: &str, now: i64) -> Result<IssuedToken, AuthError> {
        self.issue(TokenKind::Access, subject, now)
    }

    pub fn issue_refresh(&self, subject: &str, now: i64) -> Result<IssuedToken, AuthError> {
        self.issue(TokenKind::Refresh, subject, now)
    }

    /// 校验令牌
    ///
    /// # Returns
    /// * `Ok(TokenClaims)` - 签名正确且 `now < exp`
    /// * `Err(AuthError::TokenExpired)` - 签名正确但已过期
    /// * `Err(AuthError::TokenInvalid)` - 签名错误、格式错误或使用了另一类密钥
    pub fn validate(&self, token: &str, kind: TokenKind, now: i64) -> Result<TokenClaims, AuthError> {
        let data = decode::<TokenClaims>(token, &self.keys(kind).decoding, &self.validation)
            .map_err(|e| {
                debug!(kind = kind.as_str(), error = %e, "token rejected");
                AuthError::TokenInvalid
            })?;

        if data.claims.exp <= now {
            return Err(AuthError::TokenExpired);
        }

        Ok(data.claims)
    }

    /// 哈希 Token（SHA-256，hex）
    ///
    /// 会话存储只保存该哈希。
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}
