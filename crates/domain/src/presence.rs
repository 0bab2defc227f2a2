//! 在线状态事件
//!
//! 由通道注册表的状态变化派生，短暂存在，核心不做持久化。

use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 用户在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 在线状态变化事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub timestamp: Timestamp,
}

impl PresenceEvent {
    pub fn online(user_id: UserId, timestamp: Timestamp) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Online,
            timestamp,
        }
    }

    pub fn offline(user_id: UserId, timestamp: Timestamp) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            timestamp,
        }
    }
}
