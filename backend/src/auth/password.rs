//! 密码管理模块
//!
//! 提供密码哈希、验证和强度检查功能，使用 Argon2id 算法。
//! 代价参数（内存、迭代次数、并行度）由 `PasswordConfig` 决定，
//! 验证时使用哈希串中记录的参数，调整代价不会使旧哈希失效。

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use super::config::PasswordConfig;
use super::error::AuthError;

/// 用于抹平“用户不存在”分支耗时的占位密码
const DECOY_PASSWORD: &str = "decoy-password-for-timing";

/// 密码管理器
#[derive(Clone)]
pub struct PasswordManager {
    params: Params,
    min_length: usize,
    /// 用户不存在时参与一次完整验证的占位哈希
    decoy_hash: String,
}

impl std::fmt::Debug for PasswordManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordManager")
            .field("params", &self.params)
            .field("min_length", &self.min_length)
            .finish()
    }
}

impl PasswordManager {
    /// 按配置创建密码管理器
    pub fn new(config: &PasswordConfig) -> Result<Self, AuthError> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| AuthError::ConfigError(format!("无效的 Argon2 参数: {}", e)))?;

        let mut manager = Self {
            params,
            min_length: config.min_length,
            decoy_hash: String::new(),
        };
        manager.decoy_hash = manager.hash_password(DECOY_PASSWORD)?;
        Ok(manager)
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// 使用 Argon2id 算法哈希密码
    ///
    /// # Returns
    /// * `Ok(String)` - PHC 格式的密码哈希字符串
    /// * `Err(AuthError)` - 哈希失败
    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);

        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::HashError(e.to_string()))
    }

    /// 验证密码是否与哈希匹配
    ///
    /// 常量时间比较由 argon2 完成。
    ///
    /// # Returns
    /// * `Ok(true)` - 密码匹配
    /// * `Ok(false)` - 密码不匹配
    /// * `Err(AuthError)` - 哈希串格式错误等
    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| AuthError::HashError(e.to_string()))?;

        match self.argon2().verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::HashError(e.to_string())),
        }
    }

    /// 针对占位哈希做一次验证，结果恒为不匹配
    ///
    /// 用户不存在时调用，使该分支与“密码错误”分支耗时相当。
    pub fn verify_decoy(&self, password: &str) -> bool {
        let _ = self.verify_password(password, &self.decoy_hash);
        false
    }

    /// 验证密码强度
    ///
    /// 当前仅检查最小长度，可扩展更多规则。
    pub fn validate_strength(&self, password: &str) -> Result<(), AuthError> {
        if password.chars().count() < self.min_length {
            return Err(AuthError::InvalidInput(format!(
                "密码长度至少需要 {} 个字符",
                self.min_length
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_manager() -> PasswordManager {
        PasswordManager::new(&PasswordConfig {
            min_length: 8,
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_hash_password() {
        let hash = fast_manager().hash_password("test_password_123").unwrap();

        // PHC 格式以 $argon2id 开头，并记录了代价参数
        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("m=1024,t=1,p=1"));
    }

    #[test]
    fn test_verify_password_correct() {
        let manager = fast_manager();
        let hash = manager.hash_password("correct_password").unwrap();

        assert!(manager.verify_password("correct_password", &hash).unwrap());
    }

    #[test]
    fn test_verify_password_incorrect() {
        let manager = fast_manager();
        let hash = manager.hash_password("correct_password").unwrap();

        assert!(!manager.verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_verify_malformed_hash() {
        let result = fast_manager().verify_password("anything", "not-a-phc-string");
        assert!(matches!(result, Err(AuthError::HashError(_))));
    }

    #[test]
    fn test_verify_across_cost_changes() {
        let old = fast_manager();
        let hash = old.hash_password("pw123456").unwrap();

        let stronger = PasswordManager::new(&PasswordConfig {
            min_length: 8,
            memory_kib: 2048,
            iterations: 2,
            parallelism: 1,
        })
        .unwrap();
        assert!(stronger.verify_password("pw123456", &hash).unwrap());
    }

    #[test]
    fn test_decoy_never_matches() {
        let manager = fast_manager();
        assert!(!manager.verify_decoy(DECOY_PASSWORD));
        assert!(!manager.verify_decoy("whatever"));
    }

    #[test]
    fn test_validate_strength() {
        let manager = fast_manager();
        assert!(manager.validate_strength("pw123456").is_ok());
        assert!(manager.validate_strength("a_very_long_password").is_ok());
        assert!(matches!(
            manager.validate_strength("1234567"),
            Err(AuthError::InvalidInput(_))
        ));
        assert!(manager.validate_strength("").is_err());
    }

    #[test]
    fn test_different_hashes_same_password() {
        let manager = fast_manager();
        let hash1 = manager.hash_password("password1").unwrap();
        let hash2 = manager.hash_password("password1").unwrap();

        // 盐值不同，哈希也不同
        assert_ne!(hash1, hash2);
        assert!(manager.verify_password("password1", &hash1).unwrap());
        assert!(manager.verify_password("password1", &hash2).unwrap());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let result = PasswordManager::new(&PasswordConfig {
            min_length: 8,
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        });
        assert!(matches!(result, Err(AuthError::ConfigError(_))));
    }
}
