//! 消息路由器
//!
//! 校验入站数据帧的形状与载荷上限，补齐 MessageID，以会话绑定的
//! 用户作为发送方（从不信任帧里声明的身份），然后移交投递追踪器。
//! 单条消息被拒绝不关闭会话；关闭只保留给认证与心跳失败。

use std::sync::Arc;
use std::time::Instant;

use domain::{DeliveryFailureReason, Frame, Message, MessageId, UserId};

use crate::bridge::ClusterBridge;
use crate::clock::Clock;
use crate::delivery::{DeliveryTracker, SendOutcome};
use crate::error::RelayError;
use crate::session::SessionHandle;

/// 拒绝原因码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    PayloadTooLarge,
    MissingTarget,
    UnsupportedFrame,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            RejectReason::MissingTarget => "MISSING_TARGET",
            RejectReason::UnsupportedFrame => "UNSUPPORTED_FRAME",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::PayloadTooLarge => "payload exceeds configured bound",
            RejectReason::MissingTarget => "target user id is empty",
            RejectReason::UnsupportedFrame => "frame type is not routable",
        };
        f.write_str(text)
    }
}

/// route 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterOutcome {
    /// 已进入投递流程
    Accepted { message_id: MessageId },
    /// 目标在重连窗口内，已冻结缓冲
    Buffered { message_id: MessageId },
    /// 重传的 MessageID，幂等接受
    Duplicate { message_id: MessageId },
    /// 帧被拒绝，原因码回送发送方
    Rejected { reason: RejectReason },
    /// 投递立即失败（如目标从未连接）
    Failed {
        message_id: MessageId,
        reason: DeliveryFailureReason,
    },
}

pub struct MessageRouter {
    tracker: Arc<DeliveryTracker>,
    bridge: Option<Arc<dyn ClusterBridge>>,
    clock: Arc<dyn Clock>,
    max_payload_bytes: usize,
}

impl MessageRouter {
    pub fn new(
        tracker: Arc<DeliveryTracker>,
        bridge: Option<Arc<dyn ClusterBridge>>,
        clock: Arc<dyn Clock>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            tracker,
            bridge,
            clock,
            max_payload_bytes,
        }
    }

    /// 路由一个入站帧
    ///
    /// 仅 Data 帧可路由；其余帧类型由会话层分发，落到这里即拒绝。
    pub async fn route(
        &self,
        session: &SessionHandle,
        frame: Frame,
    ) -> Result<RouterOutcome, RelayError> {
        let (message_id, target, payload) = match frame {
            Frame::Data {
                message_id,
                target,
                payload,
                ..
            } => (message_id, target, payload),
            other => {
                tracing::debug!(kind = other.kind(), "不可路由的帧类型");
                return Ok(RouterOutcome::Rejected {
                    reason: RejectReason::UnsupportedFrame,
                });
            }
        };

        if target.as_str().is_empty() {
            return Ok(RouterOutcome::Rejected {
                reason: RejectReason::MissingTarget,
            });
        }
        if payload.len() > self.max_payload_bytes {
            tracing::debug!(
                actual = payload.len(),
                limit = self.max_payload_bytes,
                "载荷超限"
            );
            return Ok(RouterOutcome::Rejected {
                reason: RejectReason::PayloadTooLarge,
            });
        }

        let sender = session.require_user_id()?.clone();
        let message_id = message_id.unwrap_or_else(MessageId::generate);
        let message = Message::new(message_id, sender, target, payload, self.clock.now());

        self.dispatch(message).await
    }

    async fn dispatch(&self, message: Message) -> Result<RouterOutcome, RelayError> {
        let message_id = message.id;
        // 桥接兜底需要原件，本地未命中时才用到
        let remote_copy = self.bridge.as_ref().map(|_| message.clone());

        match self.tracker.send(message, Instant::now()) {
            Ok(SendOutcome::Dispatched(id)) => Ok(RouterOutcome::Accepted { message_id: id }),
            Ok(SendOutcome::Buffered(id)) => Ok(RouterOutcome::Buffered { message_id: id }),
            Ok(SendOutcome::Duplicate(id)) => Ok(RouterOutcome::Duplicate { message_id: id }),
            Err(RelayError::DestinationUnknown { user_id }) => {
                self.dispatch_remote(message_id, user_id, remote_copy).await
            }
            Err(other) => Err(other),
        }
    }

    /// 本地未命中时经集群桥接转发；未配置桥接则立即失败
    async fn dispatch_remote(
        &self,
        message_id: MessageId,
        target: UserId,
        remote_copy: Option<Message>,
    ) -> Result<RouterOutcome, RelayError> {
        match (self.bridge.as_ref(), remote_copy) {
            (Some(bridge), Some(message)) => match bridge.publish_routed(&message).await {
                Ok(()) => {
                    tracing::debug!(message_id = %message_id, target = %target, "经桥接转发");
                    Ok(RouterOutcome::Accepted { message_id })
                }
                Err(err) => {
                    tracing::warn!(error = %err, target = %target, "桥接转发失败");
                    Ok(RouterOutcome::Failed {
                        message_id,
                        reason: DeliveryFailureReason::DestinationUnknown,
                    })
                }
            },
            _ => Ok(RouterOutcome::Failed {
                message_id,
                reason: DeliveryFailureReason::DestinationUnknown,
            }),
        }
    }
}
