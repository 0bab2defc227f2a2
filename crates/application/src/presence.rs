//! 在线状态广播器
//!
//! 消费通道注册表产生的在线状态事件，扇出给订阅了该用户的会话。
//! 兴趣集由外部协作方（如联系人服务）维护。投递是尽力而为：
//! 丢失的事件会被下一次状态变化覆盖，不做确认与重试。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use domain::{Frame, PresenceEvent, UserId};

use crate::registry::{ChannelRegistry, ChannelState};

pub struct PresenceBroadcaster {
    registry: Arc<ChannelRegistry>,
    /// target -> 对其感兴趣的 watcher 集合
    watchers: Mutex<HashMap<UserId, HashSet<UserId>>>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// watcher 开始关注 target 的在线状态
    pub fn watch(&self, watcher: UserId, target: UserId) {
        let mut watchers = self.watchers.lock().expect("presence lock poisoned");
        watchers.entry(target).or_default().insert(watcher);
    }

    pub fn unwatch(&self, watcher: &UserId, target: &UserId) {
        let mut watchers = self.watchers.lock().expect("presence lock poisoned");
        if let Some(set) = watchers.get_mut(target) {
            set.remove(watcher);
            if set.is_empty() {
                watchers.remove(target);
            }
        }
    }

    /// 扇出一个在线状态事件，返回实际送达的会话数
    pub fn publish(&self, event: &PresenceEvent) -> usize {
        let interested: Vec<UserId> = {
            let watchers = self.watchers.lock().expect("presence lock poisoned");
            watchers
                .get(&event.user_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for watcher in interested {
            if let ChannelState::Active(session) = self.registry.lookup(&watcher) {
                let frame = Frame::Presence {
                    user_id: event.user_id.clone(),
                    status: event.status,
                    timestamp: event.timestamp,
                };
                if session.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        tracing::debug!(
            user_id = %event.user_id,
            status = ?event.status,
            delivered,
            "在线状态事件已扇出"
        );
        delivered
    }
}
