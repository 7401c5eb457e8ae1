//! TOTP 管理模块
//!
//! 提供 TOTP 密钥生成、provisioning URI 生成和验证功能，遵循 RFC 6238 标准。
//! 所有计算都以调用方传入的时间为准，不读取系统时钟。

use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};

use super::error::AuthError;

/// TOTP 时间步长（秒）
pub const TOTP_STEP: u64 = 30;

/// TOTP 码位数
pub const TOTP_DIGITS: usize = 6;

/// 默认时间窗口容差（±1 个周期）
pub const TOTP_SKEW: u8 = 1;

/// 生成/校验验证码时使用的占位账户名
const CODE_ACCOUNT: &str = "user";

/// TOTP 管理器
#[derive(Debug, Clone, Copy)]
pub struct TOTPManager {
    skew: u8,
}

impl Default for TOTPManager {
    fn default() -> Self {
        Self::new(TOTP_SKEW)
    }
}

impl TOTPManager {
    pub fn new(skew: u8) -> Self {
        Self { skew }
    }

    pub fn skew(&self) -> u8 {
        self.skew
    }

    /// 生成新的 TOTP 密钥
    ///
    /// 160 位随机数，Base32 编码后为 32 个字符。
    pub fn generate_secret() -> String {
        Secret::generate_secret().to_encoded().to_string()
    }

    /// 创建 TOTP 实例
    fn create_totp(&self, secret: &str, issuer: &str, account: &str) -> Result<TOTP, AuthError> {
        let secret_bytes = Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|e| AuthError::TotpError(format!("无效的密钥格式: {:?}", e)))?;

        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            self.skew,
            TOTP_STEP,
            secret_bytes,
            Some(issuer.to_string()),
            account.to_string(),
        )
        .map_err(|e| AuthError::TotpError(format!("创建 TOTP 失败: {}", e)))
    }

    /// 指定时间的验证码
    ///
    /// # Arguments
    /// * `secret` - Base32 编码的密钥
    /// * `time` - Unix 时间戳（秒）
    pub fn current_code(&self, secret: &str, time: u64) -> Result<String, AuthError> {
        let totp = self.create_totp(secret, crate::auth::config::DEFAULT_ISSUER, CODE_ACCOUNT)?;
        Ok(totp.generate(time))
    }

    /// 验证 TOTP 码
    ///
    /// 接受 `time` 所在周期及其前后 `skew` 个周期内的验证码。
    ///
    /// # Returns
    /// * `Ok(true)` - 验证成功
    /// * `Ok(false)` - 验证失败
    /// * `Err(AuthError)` - 密钥格式错误
    pub fn verify(&self, secret: &str, code: &str, time: u64) -> Result<bool, AuthError> {
        let code = code.trim();
        if code.len() != TOTP_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }

        let totp = self.create_totp(secret, crate::auth::config::DEFAULT_ISSUER, CODE_ACCOUNT)?;

        // 逐个周期比较；起点饱和到 0，纪元初期的时间戳也不会下溢
        let current_step = time / TOTP_STEP;
        let first = current_step.saturating_sub(u64::from(self.skew));
        let last = current_step.saturating_add(u64::from(self.skew));

        let mut matched = subtle::Choice::from(0u8);
        for step in first..=last {
            let expected = totp.generate(step.saturating_mul(TOTP_STEP));
            matched |= expected.as_bytes().ct_eq(code.as_bytes());
        }
        Ok(bool::from(matched))
    }

    /// 获取 provisioning URI（otpauth://），供认证器应用扫码
    ///
    /// 纯格式化，无副作用。账户名与发行者会被 URL 编码，
    /// 账户名中的 `:` 是 label 分隔符，替换为 `_`。
    pub fn provisioning_uri(
        &self,
        secret: &str,
        account_label: &str,
        issuer: &str,
    ) -> Result<String, AuthError> {
        let account = account_label.replace(':', "_");
        let totp = self.create_totp(secret, issuer, &account)?;
        Ok(totp.get_url())
    }
}
