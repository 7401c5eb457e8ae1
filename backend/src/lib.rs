//! 认证核心库

pub mod auth;

pub use auth::{AuthCollaborators, AuthConfig, AuthError, AuthService};
