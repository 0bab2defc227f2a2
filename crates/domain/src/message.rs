//! 被路由的消息实体
//!
//! 一条消息从进入投递追踪器到被确认或过期，经历
//! Pending -> Sent -> Acked / Expired 的状态变化。

use serde::{Deserialize, Serialize};

use crate::value_objects::{MessageId, Timestamp, UserId};

/// 消息投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// 已入队，等待传输
    Pending,
    /// 已写入目标会话的传输通道，等待确认
    Sent,
    /// 已被接收端确认
    Acked,
    /// 重试耗尽或重连窗口过期
    Expired,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Expired)
    }
}

/// 路由的内容单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub target: UserId,
    pub payload: String,
    pub created_at: Timestamp,
    pub state: DeliveryState,
}

impl Message {
    /// 创建一条待投递消息
    pub fn new(
        id: MessageId,
        sender: UserId,
        target: UserId,
        payload: String,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            sender,
            target,
            payload,
            created_at,
            state: DeliveryState::Pending,
        }
    }

    pub fn mark_sent(&mut self) {
        self.state = DeliveryState::Sent;
    }

    pub fn mark_acked(&mut self) {
        self.state = DeliveryState::Acked;
    }

    pub fn mark_expired(&mut self) {
        self.state = DeliveryState::Expired;
    }

    /// 载荷字节数（大小上限按字节计）
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
