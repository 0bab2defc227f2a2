//! 会话状态机
//!
//! 定义单个物理连接的生命周期状态与合法迁移。重连等待不属于会话自身
//! 的状态，由通道注册表的占位条目表达。

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 原始连接已接受，等待认证帧
    Connecting,
    /// 认证通过，尚未注册进通道注册表
    Authenticated,
    /// 已注册，正常收发
    Active,
    /// 终态
    Closed,
}

impl SessionState {
    /// 检查迁移是否合法
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closed)
                | (Active, Closed)
        )
    }

    /// 执行迁移，非法迁移返回错误
    pub fn transition_to(self, next: SessionState) -> Result<SessionState, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// 会话关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// 客户端发送了关闭帧
    ClientClose,
    /// 认证失败或认证超时
    AuthFailed,
    /// 协议违规次数超限
    ProtocolError,
    /// 心跳超时
    HeartbeatTimeout,
    /// 同一用户的新连接取代了本连接
    Superseded,
    /// 服务器停机
    ServerShutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::ClientClose => "client_close",
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Superseded => "superseded",
            CloseReason::ServerShutdown => "server_shutdown",
        };
        f.write_str(text)
    }
}
