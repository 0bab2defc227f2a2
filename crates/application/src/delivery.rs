//! 投递追踪器
//!
//! 保证到达活跃会话的至少一次投递：目标可达时按指数退避重试，
//! 目标处于重连窗口时冻结缓冲，确认后才从队列移除。同一目标的
//! 消息按 FIFO 顺序写入传输，不同目标之间没有顺序约束。
//!
//! 重复的 MessageID 视为客户端重传，幂等接受，不产生第二次投递。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use domain::{DeliveryFailureReason, Frame, Message, MessageId, UserId};

use crate::backoff::Backoff;
use crate::error::RelayError;
use crate::registry::{ChannelRegistry, ChannelState};
use crate::session::SessionHandle;

/// send 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 已写入活跃会话的出站队列，等待确认
    Dispatched(MessageId),
    /// 目标在重连窗口内，消息已冻结缓冲
    Buffered(MessageId),
    /// 保留窗口内见过的 MessageID，按重传处理
    Duplicate(MessageId),
}

/// 投递失败通知，由追踪器回送给发送方
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub message_id: MessageId,
    pub sender: UserId,
    pub reason: DeliveryFailureReason,
}

struct InFlight {
    message: Message,
    attempts: u32,
    /// None 表示冻结在重连占位队列中，不参与重试扫描
    next_attempt_at: Option<Instant>,
}

#[derive(Default)]
struct TrackerInner {
    /// 每个目标一个 FIFO 队列
    queues: HashMap<UserId, VecDeque<InFlight>>,
    /// MessageID -> 目标，用于确认与重复检测
    index: HashMap<MessageId, UserId>,
    /// 已终结的 MessageID 及其遗忘时刻
    completed: HashMap<MessageId, Instant>,
}

pub struct DeliveryTracker {
    registry: Arc<ChannelRegistry>,
    inner: Mutex<TrackerInner>,
    backoff: Backoff,
    config: config::DeliveryConfig,
}

impl DeliveryTracker {
    pub fn new(registry: Arc<ChannelRegistry>, config: config::DeliveryConfig) -> Self {
        Self {
            registry,
            inner: Mutex::new(TrackerInner::default()),
            backoff: Backoff::exponential(config.retry_base()),
            config,
        }
    }

    /// 接收一条待投递消息
    ///
    /// 目标从未连接过时立即失败，不进入重试。
    pub fn send(&self, mut message: Message, now: Instant) -> Result<SendOutcome, RelayError> {
        let mut inner = self.inner.lock().expect("delivery lock poisoned");

        if inner.index.contains_key(&message.id) || inner.completed.contains_key(&message.id) {
            tracing::debug!(message_id = %message.id, "重复的MessageID，按重传忽略");
            return Ok(SendOutcome::Duplicate(message.id));
        }

        match self.registry.lookup(&message.target) {
            ChannelState::Active(session) => {
                let message_id = message.id;
                let transmitted = session.send(data_frame(&message)).is_ok();
                let entry = if transmitted {
                    message.mark_sent();
                    InFlight {
                        message,
                        attempts: 1,
                        next_attempt_at: Some(now + self.backoff.delay_at(1)),
                    }
                } else {
                    // 写入失败说明会话正在消亡，留给下一轮扫描重试
                    InFlight {
                        message,
                        attempts: 0,
                        next_attempt_at: Some(now),
                    }
                };
                let target = entry.message.target.clone();
                inner.index.insert(message_id, target.clone());
                inner.queues.entry(target).or_default().push_back(entry);
                Ok(SendOutcome::Dispatched(message_id))
            }
            ChannelState::Pending => {
                let message_id = message.id;
                let target = message.target.clone();
                inner.index.insert(message_id, target.clone());

                let queue = inner.queues.entry(target.clone()).or_default();
                queue.push_back(InFlight {
                    message,
                    attempts: 0,
                    next_attempt_at: None,
                });
                let overflow = if queue.len() > self.config.pending_queue_limit {
                    queue.pop_front()
                } else {
                    None
                };

                if let Some(dropped) = overflow {
                    let failure = self.complete(
                        &mut inner,
                        dropped,
                        DeliveryFailureReason::Expired,
                        now,
                    );
                    tracing::warn!(
                        target = %target,
                        message_id = %failure.message_id,
                        "占位队列溢出，最旧消息过期"
                    );
                    self.notify_sender(&failure);
                }
                Ok(SendOutcome::Buffered(message_id))
            }
            ChannelState::NotFound => Err(RelayError::DestinationUnknown {
                user_id: message.target,
            }),
        }
    }

    /// 处理确认帧；未知或已确认的 MessageID 静默忽略
    pub fn ack(&self, message_id: MessageId, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("delivery lock poisoned");

        let Some(target) = inner.index.remove(&message_id) else {
            tracing::debug!(message_id = %message_id, "未知MessageID的确认，忽略");
            return false;
        };

        let mut acked = false;
        if let Some(queue) = inner.queues.get_mut(&target) {
            if let Some(position) = queue.iter().position(|e| e.message.id == message_id) {
                if let Some(mut entry) = queue.remove(position) {
                    entry.message.mark_acked();
                    acked = true;
                }
            }
        }
        if acked {
            inner
                .completed
                .insert(message_id, now + self.config.ack_retention());
            tracing::debug!(message_id = %message_id, target = %target, "消息已确认");
        }
        if inner.queues.get(&target).is_some_and(|q| q.is_empty()) {
            inner.queues.remove(&target);
        }
        acked
    }

    /// 重试扫描
    ///
    /// 到期条目向活跃目标重传；尝试次数耗尽而目标仍可达的消息过期
    /// 并通知发送方。重连窗口内的队列保持冻结。
    pub fn sweep(&self, now: Instant) -> Vec<DeliveryFailure> {
        let mut inner = self.inner.lock().expect("delivery lock poisoned");
        let mut failures = Vec::new();

        inner.completed.retain(|_, forget_at| *forget_at > now);

        let targets: Vec<UserId> = inner.queues.keys().cloned().collect();
        for target in targets {
            match self.registry.lookup(&target) {
                ChannelState::Active(session) => {
                    let mut exhausted = Vec::new();
                    if let Some(queue) = inner.queues.get_mut(&target) {
                        let mut position = 0;
                        while position < queue.len() {
                            let due = queue[position]
                                .next_attempt_at
                                .is_some_and(|at| at <= now);
                            if !due {
                                position += 1;
                                continue;
                            }
                            if queue[position].attempts >= self.config.max_attempts {
                                if let Some(entry) = queue.remove(position) {
                                    exhausted.push(entry);
                                }
                                continue;
                            }
                            let entry = &mut queue[position];
                            let _ = session.send(data_frame(&entry.message));
                            entry.attempts += 1;
                            entry.message.mark_sent();
                            entry.next_attempt_at =
                                Some(now + self.backoff.delay_at(entry.attempts));
                            position += 1;
                        }
                    }
                    for entry in exhausted {
                        let failure = self.complete(
                            &mut inner,
                            entry,
                            DeliveryFailureReason::DeliveryExhausted,
                            now,
                        );
                        tracing::warn!(
                            message_id = %failure.message_id,
                            target = %target,
                            "重试耗尽，消息过期"
                        );
                        self.notify_sender(&failure);
                        failures.push(failure);
                    }
                }
                ChannelState::Pending => {}
                ChannelState::NotFound => {
                    // 占位已回收但队列残留（过期扫描间的竞争窗口）
                    failures.extend(self.drain_queue(&mut inner, &target, now));
                }
            }
            if inner.queues.get(&target).is_some_and(|q| q.is_empty()) {
                inner.queues.remove(&target);
            }
        }
        failures
    }

    /// 同一用户在重连窗口内恢复，按原序重传冻结队列
    pub fn on_reconnected(&self, user_id: &UserId, session: &SessionHandle, now: Instant) {
        let mut inner = self.inner.lock().expect("delivery lock poisoned");
        let Some(queue) = inner.queues.get_mut(user_id) else {
            return;
        };
        let count = queue.len();
        for entry in queue.iter_mut() {
            let _ = session.send(data_frame(&entry.message));
            entry.message.mark_sent();
            entry.attempts = 1;
            entry.next_attempt_at = Some(now + self.backoff.delay_at(1));
        }
        if count > 0 {
            tracing::info!(user_id = %user_id, count, "重连后重传未确认消息");
        }
    }

    /// 重连窗口过期，目标的全部未确认消息过期并通知各发送方
    pub fn expire_destination(&self, user_id: &UserId, now: Instant) -> Vec<DeliveryFailure> {
        let mut inner = self.inner.lock().expect("delivery lock poisoned");
        self.drain_queue(&mut inner, user_id, now)
    }

    /// 目标队列深度（测试与观测用）
    pub fn queue_depth(&self, user_id: &UserId) -> usize {
        let inner = self.inner.lock().expect("delivery lock poisoned");
        inner.queues.get(user_id).map_or(0, |q| q.len())
    }

    fn drain_queue(
        &self,
        inner: &mut TrackerInner,
        user_id: &UserId,
        now: Instant,
    ) -> Vec<DeliveryFailure> {
        let Some(queue) = inner.queues.remove(user_id) else {
            return Vec::new();
        };
        let mut failures = Vec::with_capacity(queue.len());
        for entry in queue {
            let failure = self.complete(inner, entry, DeliveryFailureReason::Expired, now);
            self.notify_sender(&failure);
            failures.push(failure);
        }
        if !failures.is_empty() {
            tracing::warn!(user_id = %user_id, count = failures.len(), "未投递消息随窗口过期");
        }
        failures
    }

    fn complete(
        &self,
        inner: &mut TrackerInner,
        mut entry: InFlight,
        reason: DeliveryFailureReason,
        now: Instant,
    ) -> DeliveryFailure {
        entry.message.mark_expired();
        inner.index.remove(&entry.message.id);
        inner
            .completed
            .insert(entry.message.id, now + self.config.ack_retention());
        DeliveryFailure {
            message_id: entry.message.id,
            sender: entry.message.sender,
            reason,
        }
    }

    /// 向发送方回送失败帧，发送方已离线则放弃
    fn notify_sender(&self, failure: &DeliveryFailure) {
        if let ChannelState::Active(session) = self.registry.lookup(&failure.sender) {
            let _ = session.send(Frame::DeliveryFailed {
                message_id: failure.message_id,
                reason: failure.reason,
            });
        }
    }
}

fn data_frame(message: &Message) -> Frame {
    Frame::Data {
        message_id: Some(message.id),
        sender: Some(message.sender.clone()),
        target: message.target.clone(),
        payload: message.payload.clone(),
        timestamp: Some(message.created_at),
    }
}
