//! 认证协作方接口
//!
//! 核心只依赖 `authenticate(credentials) -> UserId | Rejected` 这一契约，
//! 任何满足它的机制（令牌、握手）都可以接入。JWT 实现位于传输层。

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{Credentials, UserId};
use thiserror::Error;

/// 认证被拒绝
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("authentication rejected: {reason}")]
pub struct AuthRejection {
    pub reason: String,
}

impl AuthRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthRejection>;
}

/// 静态令牌认证器（用于测试和开发）
///
/// 以 token -> UserId 的固定映射代替真实认证后端。
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<UserId, AuthRejection> {
        match self.tokens.get(&credentials.token) {
            Some(user_id) => Ok(user_id.clone()),
            None => Err(AuthRejection::new("unknown token")),
        }
    }
}
