//! 心跳监测
//!
//! 每个活跃会话必须在配置间隔内送达任意帧；静默超过时限的会话被
//! 判定死亡并关闭，恢复路径是重连而非原地修复。服务器同时对空闲
//! 连接主动发送 ping，避免网络中间件静默断开空闲连接。

use std::sync::Arc;
use std::time::{Duration, Instant};

use domain::Frame;

use crate::clock::Clock;
use crate::registry::ChannelRegistry;
use crate::session::SessionHandle;

/// 一次扫描的结果
pub struct HeartbeatSweep {
    /// 静默超时、应当关闭的会话
    pub timed_out: Vec<Arc<SessionHandle>>,
    /// 本轮发出的主动 ping 数
    pub pinged: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<ChannelRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            interval,
            timeout,
        }
    }

    /// 扫描全部活跃会话
    ///
    /// 超时判定是权威的，本层不做重试；关闭动作交给调用方，
    /// 由它触发注册表的重连占位逻辑。
    pub fn sweep(&self, now: Instant) -> HeartbeatSweep {
        let mut timed_out = Vec::new();
        let mut pinged = 0;

        for session in self.registry.live_sessions() {
            let silence = now.saturating_duration_since(session.last_seen());
            if silence >= self.timeout {
                tracing::warn!(
                    session_id = %session.session_id(),
                    silence_ms = silence.as_millis() as u64,
                    "心跳超时"
                );
                timed_out.push(session);
                continue;
            }
            let since_ping = now.saturating_duration_since(session.last_ping_sent());
            if silence >= self.interval && since_ping >= self.interval {
                if session
                    .send(Frame::HeartbeatPing {
                        timestamp: self.clock.now(),
                    })
                    .is_ok()
                {
                    session.mark_ping_sent(now);
                    pinged += 1;
                }
            }
        }

        HeartbeatSweep { timed_out, pinged }
    }
}
