//! 通道注册表
//!
//! UserID 到当前活跃会话的映射，是"此刻谁拥有这个用户"的唯一事实来源。
//! 每个用户同一时刻至多一个活跃会话；新连接取代旧连接。会话关闭后
//! 条目降级为限时的重连占位，窗口内同一用户重连则无缝恢复，窗口过期
//! 才对外表现为离线。
//!
//! 每个键上的 register/unregister/lookup 构成线性一致的历史（单把映射锁）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use domain::{PresenceEvent, SessionId, Timestamp, UserId};

use crate::session::SessionHandle;

/// 重连占位条目
///
/// 会话关闭后保留的可寻址对象，带独立截止时间，未投递消息在投递
/// 追踪器里按原序冻结，等待同一用户重连继承。
#[derive(Debug, Clone)]
struct PendingReconnect {
    expires_at: Instant,
}

enum Entry {
    Live(Arc<SessionHandle>),
    Pending(PendingReconnect),
}

/// lookup 的结果
pub enum ChannelState {
    /// 活跃会话
    Active(Arc<SessionHandle>),
    /// 处于重连窗口内
    Pending,
    /// 从未注册或占位已过期
    NotFound,
}

/// register 的结果
pub struct RegisterOutcome {
    /// 被取代的旧会话，由调用方执行优雅关闭
    pub evicted: Option<Arc<SessionHandle>>,
    /// 是否吸收了重连占位（继承冻结的消息队列）
    pub resumed: bool,
    /// 本次变更产生的在线状态事件；重连与取代不翻转状态
    pub presence: Option<PresenceEvent>,
}

pub struct ChannelRegistry {
    entries: Mutex<HashMap<UserId, Entry>>,
    reconnect_window: Duration,
}

impl ChannelRegistry {
    pub fn new(reconnect_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reconnect_window,
        }
    }

    /// 原子安装活跃会话
    ///
    /// 已有活跃会话时返回它作为被取代者；已有占位时吸收占位。
    /// 在线事件只在"此前完全不在线"时产生一次。
    pub fn register(
        &self,
        user_id: &UserId,
        session: Arc<SessionHandle>,
        timestamp: Timestamp,
    ) -> RegisterOutcome {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let previous = entries.insert(user_id.clone(), Entry::Live(session));

        match previous {
            None => {
                tracing::info!(user_id = %user_id, "用户上线");
                RegisterOutcome {
                    evicted: None,
                    resumed: false,
                    presence: Some(PresenceEvent::online(user_id.clone(), timestamp)),
                }
            }
            Some(Entry::Live(old)) => {
                tracing::info!(
                    user_id = %user_id,
                    old_session = %old.session_id(),
                    "新连接取代旧连接"
                );
                RegisterOutcome {
                    evicted: Some(old),
                    resumed: false,
                    presence: None,
                }
            }
            // 占位只由维护扫描回收；抢在扫描之前的重连一律视作恢复，
            // 此前也从未对外发出过离线事件
            Some(Entry::Pending(_)) => {
                tracing::info!(user_id = %user_id, "用户在重连窗口内恢复");
                RegisterOutcome {
                    evicted: None,
                    resumed: true,
                    presence: None,
                }
            }
        }
    }

    pub fn lookup(&self, user_id: &UserId) -> ChannelState {
        let entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get(user_id) {
            Some(Entry::Live(session)) => ChannelState::Active(session.clone()),
            Some(Entry::Pending(_)) => ChannelState::Pending,
            None => ChannelState::NotFound,
        }
    }

    /// 会话关闭回调
    ///
    /// SessionId 匹配当前活跃条目时降级为重连占位并返回 true；
    /// 来自已被取代会话的过期回调是空操作。
    pub fn unregister(&self, user_id: &UserId, session_id: SessionId, now: Instant) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get(user_id) {
            Some(Entry::Live(session)) if session.session_id() == session_id => {
                entries.insert(
                    user_id.clone(),
                    Entry::Pending(PendingReconnect {
                        expires_at: now + self.reconnect_window,
                    }),
                );
                tracing::info!(user_id = %user_id, session_id = %session_id, "进入重连等待窗口");
                true
            }
            _ => false,
        }
    }

    /// 回收到期的重连占位，产生对应的离线事件
    pub fn expire_pending(&self, now: Instant, timestamp: Timestamp) -> Vec<PresenceEvent> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let expired: Vec<UserId> = entries
            .iter()
            .filter_map(|(user_id, entry)| match entry {
                Entry::Pending(pending) if pending.expires_at <= now => Some(user_id.clone()),
                _ => None,
            })
            .collect();

        let mut events = Vec::with_capacity(expired.len());
        for user_id in expired {
            entries.remove(&user_id);
            tracing::info!(user_id = %user_id, "重连窗口过期，用户离线");
            events.push(PresenceEvent::offline(user_id, timestamp));
        }
        events
    }

    /// 当前所有活跃会话的快照
    pub fn live_sessions(&self) -> Vec<Arc<SessionHandle>> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Live(session) => Some(session.clone()),
                Entry::Pending(_) => None,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .values()
            .filter(|entry| matches!(entry, Entry::Live(_)))
            .count()
    }

    /// 停机时清空注册表，返回全部活跃会话供调用方关闭
    pub fn drain_all(&self) -> Vec<Arc<SessionHandle>> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .drain()
            .filter_map(|(_, entry)| match entry {
                Entry::Live(session) => Some(session),
                Entry::Pending(_) => None,
            })
            .collect()
    }
}
