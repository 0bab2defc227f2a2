//! 中继引擎
//!
//! 把注册表、投递追踪器、路由器、心跳监测与在线广播装配成一个
//! 对传输层友好的门面。心跳扫描、重试到期与占位回收共用同一个
//! 维护任务，清理逻辑集中且可测试；没有任何按调用临时起的定时器。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use config::RelayConfig;
use domain::{CloseReason, DomainError, Frame, PresenceEvent, UserId};
use tokio::task::JoinHandle;

use crate::bridge::ClusterBridge;
use crate::clock::Clock;
use crate::delivery::DeliveryTracker;
use crate::error::RelayError;
use crate::heartbeat::HeartbeatMonitor;
use crate::presence::PresenceBroadcaster;
use crate::registry::ChannelRegistry;
use crate::router::{MessageRouter, RouterOutcome};
use crate::session::SessionHandle;

/// 处理完一个入站帧后连接任务应采取的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Continue,
    Close(CloseReason),
}

pub struct RelayEngine {
    registry: Arc<ChannelRegistry>,
    tracker: Arc<DeliveryTracker>,
    router: MessageRouter,
    presence: Arc<PresenceBroadcaster>,
    heartbeat: HeartbeatMonitor,
    clock: Arc<dyn Clock>,
    bridge: Option<Arc<dyn ClusterBridge>>,
    bridge_pumps: Mutex<HashMap<UserId, JoinHandle<()>>>,
    violation_limit: u32,
}

impl RelayEngine {
    pub fn new(
        config: &RelayConfig,
        clock: Arc<dyn Clock>,
        bridge: Option<Arc<dyn ClusterBridge>>,
    ) -> Arc<Self> {
        let registry = Arc::new(ChannelRegistry::new(config.session.reconnect_window()));
        let tracker = Arc::new(DeliveryTracker::new(
            registry.clone(),
            config.delivery.clone(),
        ));
        let router = MessageRouter::new(
            tracker.clone(),
            bridge.clone(),
            clock.clone(),
            config.delivery.max_payload_bytes,
        );
        let presence = Arc::new(PresenceBroadcaster::new(registry.clone()));
        let heartbeat = HeartbeatMonitor::new(
            registry.clone(),
            clock.clone(),
            config.heartbeat.interval(),
            config.heartbeat.timeout(),
        );

        Arc::new(Self {
            registry,
            tracker,
            router,
            presence,
            heartbeat,
            clock,
            bridge,
            bridge_pumps: Mutex::new(HashMap::new()),
            violation_limit: config.session.protocol_violation_limit,
        })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn presence(&self) -> &Arc<PresenceBroadcaster> {
        &self.presence
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 认证完成的会话接入注册表
    ///
    /// 同一用户的旧会话在此被优雅取代；重连窗口内的占位被吸收，
    /// 冻结的未确认消息按原序重传。
    pub async fn attach_session(
        &self,
        session: &Arc<SessionHandle>,
        now: Instant,
    ) -> Result<(), RelayError> {
        let user_id = session.require_user_id()?.clone();
        session.activate()?;

        let outcome = self
            .registry
            .register(&user_id, session.clone(), self.clock.now());

        if let Some(evicted) = outcome.evicted {
            evicted.close(CloseReason::Superseded);
        }
        if outcome.resumed {
            self.tracker.on_reconnected(&user_id, session, now);
        }
        if let Some(event) = outcome.presence {
            self.presence.publish(&event);
            self.publish_presence_remote(&event).await;
        }
        if let Some(bridge) = self.bridge.clone() {
            self.ensure_bridge_pump(&bridge, &user_id).await;
        }

        tracing::info!(
            user_id = %user_id,
            session_id = %session.session_id(),
            "会话已接入"
        );
        Ok(())
    }

    /// 会话结束（任意原因），转入重连等待
    ///
    /// 来自已被取代会话的调用对注册表是空操作。
    pub fn detach_session(&self, session: &SessionHandle, reason: CloseReason, now: Instant) {
        session.close(reason);
        if let Some(user_id) = session.user_id() {
            self.registry.unregister(user_id, session.session_id(), now);
        }
    }

    /// 处理一个已认证会话的入站帧
    ///
    /// 任意入站帧都刷新心跳；返回值告诉连接任务是否应关闭连接。
    pub async fn handle_frame(
        &self,
        session: &Arc<SessionHandle>,
        frame: Frame,
        now: Instant,
    ) -> FrameDisposition {
        session.touch(now);

        match frame {
            Frame::HeartbeatPing { .. } => {
                let _ = session.send(Frame::HeartbeatPong {
                    timestamp: self.clock.now(),
                });
                FrameDisposition::Continue
            }
            Frame::HeartbeatPong { .. } => FrameDisposition::Continue,
            frame @ Frame::Data { .. } => match self.router.route(session, frame).await {
                Ok(outcome) => {
                    self.reply_for(session, outcome);
                    FrameDisposition::Continue
                }
                Err(RelayError::Domain(DomainError::SessionNotAuthenticated)) => {
                    self.note_protocol_violation(session, "data before authentication")
                }
                Err(err) => {
                    tracing::error!(
                        session_id = %session.session_id(),
                        error = %err,
                        "路由失败"
                    );
                    FrameDisposition::Continue
                }
            },
            Frame::Ack { message_id } => {
                self.tracker.ack(message_id, now);
                FrameDisposition::Continue
            }
            Frame::Close { .. } => FrameDisposition::Close(CloseReason::ClientClose),
            other => self.note_protocol_violation(session, other.kind()),
        }
    }

    /// 记录协议违规；超过阈值时指示关闭会话
    pub fn note_protocol_violation(
        &self,
        session: &SessionHandle,
        context: &str,
    ) -> FrameDisposition {
        let count = session.record_violation();
        tracing::warn!(
            session_id = %session.session_id(),
            context,
            count,
            "协议违规"
        );
        if count >= self.violation_limit {
            FrameDisposition::Close(CloseReason::ProtocolError)
        } else {
            let _ = session.send(Frame::Error {
                code: "PROTOCOL_VIOLATION".to_string(),
                message: context.to_string(),
            });
            FrameDisposition::Continue
        }
    }

    /// 本地扇出一个来自其他实例的在线状态事件
    pub fn import_presence(&self, event: &PresenceEvent) -> usize {
        self.presence.publish(event)
    }

    /// 维护扫描：心跳超时、占位过期与投递重试共用一次调用
    pub async fn sweep(&self, now: Instant) {
        let heartbeat = self.heartbeat.sweep(now);
        for session in heartbeat.timed_out {
            self.detach_session(&session, CloseReason::HeartbeatTimeout, now);
        }

        let offline = self.registry.expire_pending(now, self.clock.now());
        for event in offline {
            self.tracker.expire_destination(&event.user_id, now);
            self.presence.publish(&event);
            self.publish_presence_remote(&event).await;
            self.stop_bridge_pump(&event.user_id).await;
        }

        self.tracker.sweep(now);
    }

    /// 启动周期性维护任务
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.sweep(Instant::now()).await;
            }
        })
    }

    /// 停机：关闭全部会话并终止桥接泵
    pub async fn shutdown(&self) {
        let pumps: Vec<JoinHandle<()>> = {
            let mut pumps = self.bridge_pumps.lock().expect("bridge pump lock poisoned");
            pumps.drain().map(|(_, handle)| handle).collect()
        };
        for handle in pumps {
            handle.abort();
        }
        for session in self.registry.drain_all() {
            session.close(CloseReason::ServerShutdown);
        }
        tracing::info!("中继引擎已停机");
    }

    fn reply_for(&self, session: &SessionHandle, outcome: RouterOutcome) {
        match outcome {
            RouterOutcome::Rejected { reason } => {
                let _ = session.send(Frame::Error {
                    code: reason.code().to_string(),
                    message: reason.to_string(),
                });
            }
            RouterOutcome::Failed { message_id, reason } => {
                let _ = session.send(Frame::DeliveryFailed { message_id, reason });
            }
            RouterOutcome::Accepted { .. }
            | RouterOutcome::Buffered { .. }
            | RouterOutcome::Duplicate { .. } => {}
        }
    }

    async fn publish_presence_remote(&self, event: &PresenceEvent) {
        if let Some(bridge) = &self.bridge {
            if let Err(err) = bridge.publish_presence(event).await {
                tracing::warn!(error = %err, user_id = %event.user_id, "在线事件桥接发布失败");
            }
        }
    }

    /// 为用户启动桥接消息泵（已存在则跳过）
    async fn ensure_bridge_pump(&self, bridge: &Arc<dyn ClusterBridge>, user_id: &UserId) {
        {
            let pumps = self.bridge_pumps.lock().expect("bridge pump lock poisoned");
            if pumps.contains_key(user_id) {
                return;
            }
        }
        match bridge.subscribe_routed(user_id).await {
            Ok(mut stream) => {
                let tracker = self.tracker.clone();
                let user = user_id.clone();
                let handle = tokio::spawn(async move {
                    while let Some(message) = stream.recv().await {
                        if let Err(err) = tracker.send(message, Instant::now()) {
                            tracing::debug!(
                                error = %err,
                                user_id = %user,
                                "桥接消息本地投递失败"
                            );
                        }
                    }
                });
                let mut pumps = self.bridge_pumps.lock().expect("bridge pump lock poisoned");
                pumps.insert(user_id.clone(), handle);
            }
            Err(err) => {
                tracing::warn!(error = %err, user_id = %user_id, "桥接订阅失败");
            }
        }
    }

    async fn stop_bridge_pump(&self, user_id: &UserId) {
        let handle = {
            let mut pumps = self.bridge_pumps.lock().expect("bridge pump lock poisoned");
            pumps.remove(user_id)
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(bridge) = &self.bridge {
            if let Err(err) = bridge.unsubscribe_routed(user_id).await {
                tracing::debug!(error = %err, user_id = %user_id, "桥接退订失败");
            }
        }
    }
}
