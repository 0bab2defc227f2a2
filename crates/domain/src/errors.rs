//! 领域模型错误定义
//!
//! 定义了系统中所有可能的错误类型，提供清晰的错误上下文。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 参数验证错误
    #[error("无效参数 {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 帧解析错误
    #[error("帧解析失败: {message}")]
    FrameDecode { message: String },

    /// 帧序列化错误
    #[error("帧序列化失败: {message}")]
    FrameEncode { message: String },

    /// 非法的会话状态迁移
    #[error("非法的会话状态迁移: {from:?} -> {to:?}")]
    IllegalTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// 会话尚未绑定用户
    #[error("会话尚未完成认证")]
    SessionNotAuthenticated,
}

impl DomainError {
    /// 创建参数验证错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建帧解析错误
    pub fn frame_decode(message: impl Into<String>) -> Self {
        Self::FrameDecode {
            message: message.into(),
        }
    }

    /// 创建帧序列化错误
    pub fn frame_encode(message: impl Into<String>) -> Self {
        Self::FrameEncode {
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
