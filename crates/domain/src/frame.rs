//! 帧协议
//!
//! 传输层无关的帧定义。帧是按 `type` 字段区分的带标签变体，
//! 每种类型对应一个处理分支，避免开放式的类型探测。

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::presence::PresenceStatus;
use crate::session::CloseReason;
use crate::value_objects::{Credentials, MessageId, SessionId, Timestamp, UserId};

/// 投递失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailureReason {
    /// 目标用户从未连接过
    DestinationUnknown,
    /// 目标保持可达但重试次数耗尽
    DeliveryExhausted,
    /// 重连窗口过期或缓冲队列溢出
    Expired,
}

impl std::fmt::Display for DeliveryFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DeliveryFailureReason::DestinationUnknown => "destination_unknown",
            DeliveryFailureReason::DeliveryExhausted => "delivery_exhausted",
            DeliveryFailureReason::Expired => "expired",
        };
        f.write_str(text)
    }
}

/// 传输帧
///
/// 客户端与服务器之间的全部通信以帧为单位，JSON 编码。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// 认证请求，凭据对核心不透明
    Auth { credentials: Credentials },
    /// 认证通过
    AuthOk {
        user_id: UserId,
        session_id: SessionId,
    },
    /// 认证被拒绝
    AuthRejected { reason: String },
    /// 心跳请求（任一数据帧同样视作隐式心跳）
    HeartbeatPing { timestamp: Timestamp },
    /// 心跳响应
    HeartbeatPong { timestamp: Timestamp },
    /// 携带一条路由消息
    Data {
        /// 发送端未提供时由路由器分配
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        /// 入站帧中忽略，出站帧由服务器填写
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<UserId>,
        target: UserId,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    /// 投递确认
    Ack { message_id: MessageId },
    /// 在线状态通知
    Presence {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: Timestamp,
    },
    /// 连接关闭通知
    Close { reason: CloseReason },
    /// 投递失败通知，回送给发送方
    DeliveryFailed {
        message_id: MessageId,
        reason: DeliveryFailureReason,
    },
    /// 非致命错误，单条消息被拒绝时回送
    Error { code: String, message: String },
}

impl Frame {
    /// 序列化为JSON字符串
    pub fn to_json(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|e| DomainError::frame_encode(e.to_string()))
    }

    /// 从JSON字符串反序列化
    pub fn from_json(json: &str) -> Result<Self, DomainError> {
        serde_json::from_str(json).map_err(|e| DomainError::frame_decode(e.to_string()))
    }

    /// 帧类型名，用于日志
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::AuthOk { .. } => "auth_ok",
            Frame::AuthRejected { .. } => "auth_rejected",
            Frame::HeartbeatPing { .. } => "heartbeat_ping",
            Frame::HeartbeatPong { .. } => "heartbeat_pong",
            Frame::Data { .. } => "data",
            Frame::Ack { .. } => "ack",
            Frame::Presence { .. } => "presence",
            Frame::Close { .. } => "close",
            Frame::DeliveryFailed { .. } => "delivery_failed",
            Frame::Error { .. } => "error",
        }
    }
}
