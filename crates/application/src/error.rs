use domain::{DomainError, UserId};
use thiserror::Error;

use crate::bridge::BridgeError;

/// 中继核心错误类型
///
/// 任何一个变体都不是进程级致命错误：单个连接的异常只影响它自己的通道。
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },
    #[error("destination unknown: {user_id}")]
    DestinationUnknown { user_id: UserId },
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl RelayError {
    pub fn authentication(reason: impl Into<String>) -> Self {
        RelayError::Authentication {
            reason: reason.into(),
        }
    }
}
