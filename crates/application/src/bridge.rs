//! 集群桥接接口
//!
//! 多进程部署时，把本进程的路由消息与在线状态事件转发到外部
//! Pub/Sub 骨干，并订阅其他实例发布的内容。核心的正确性不依赖
//! 桥接存在：单进程部署时不配置桥接即可。

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use domain::{Message, PresenceEvent, UserId};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge connection failed: {message}")]
    Connection { message: String },
    #[error("bridge publish failed: {message}")]
    Publish { message: String },
    #[error("bridge subscribe failed: {message}")]
    Subscribe { message: String },
    #[error("bridge payload decode failed: {message}")]
    Decode { message: String },
}

impl BridgeError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::Subscribe {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// 某个用户的远端路由消息流
pub struct RoutedStream {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl RoutedStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// 某个用户的远端在线状态事件流
pub struct PresenceStream {
    receiver: mpsc::UnboundedReceiver<PresenceEvent>,
}

impl PresenceStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<PresenceEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait ClusterBridge: Send + Sync {
    /// 把本地无法送达的消息发布给持有目标会话的实例
    async fn publish_routed(&self, message: &Message) -> Result<(), BridgeError>;

    /// 订阅发往指定用户的路由消息
    async fn subscribe_routed(&self, user_id: &UserId) -> Result<RoutedStream, BridgeError>;

    /// 用户彻底离线后取消订阅
    async fn unsubscribe_routed(&self, user_id: &UserId) -> Result<(), BridgeError>;

    /// 把本地在线状态事件发布给其他实例
    async fn publish_presence(&self, event: &PresenceEvent) -> Result<(), BridgeError>;

    /// 订阅指定用户的远端在线状态事件
    async fn subscribe_presence(&self, user_id: &UserId) -> Result<PresenceStream, BridgeError>;
}
