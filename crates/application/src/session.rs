//! 会话句柄
//!
//! 封装单个物理连接的运行时状态：状态机、出站队列、心跳时间与
//! 协议违规计数。传输层持有出站队列的接收端，把命令写到网络；
//! 其余组件通过 [`SessionHandle`] 写入帧，从不直接触碰套接字。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use domain::{CloseReason, DomainError, DomainResult, Frame, SessionId, SessionState, Timestamp, UserId};

/// 出站队列上的命令
///
/// Terminate 让传输层的发送任务退出，晚于它入队的帧不再发出。
#[derive(Debug)]
pub enum SessionCommand {
    Frame(Frame),
    Terminate,
}

/// 会话已不可写
#[derive(Debug, Error)]
#[error("session {session_id} is not writable")]
pub struct SessionSendError {
    pub session_id: SessionId,
}

pub struct SessionHandle {
    session_id: SessionId,
    user_id: OnceLock<UserId>,
    outbound: mpsc::UnboundedSender<SessionCommand>,
    state: Mutex<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    last_seen: Mutex<Instant>,
    last_ping_sent: Mutex<Instant>,
    violations: AtomicU32,
    connected_at: Timestamp,
}

impl SessionHandle {
    /// 接受原始连接，返回句柄与出站队列的接收端
    pub fn connect(
        connected_at: Timestamp,
        now: Instant,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<SessionCommand>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let handle = std::sync::Arc::new(Self {
            session_id: SessionId::generate(),
            user_id: OnceLock::new(),
            outbound,
            state: Mutex::new(SessionState::Connecting),
            close_reason: Mutex::new(None),
            last_seen: Mutex::new(now),
            last_ping_sent: Mutex::new(now),
            violations: AtomicU32::new(0),
            connected_at,
        });
        (handle, receiver)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// 认证完成前为 None；一经设置不可变更
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.get()
    }

    pub fn require_user_id(&self) -> DomainResult<&UserId> {
        self.user_id.get().ok_or(DomainError::SessionNotAuthenticated)
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// 认证通过，绑定用户
    pub fn authenticate(&self, user_id: UserId) -> DomainResult<()> {
        self.transition(SessionState::Authenticated)?;
        self.user_id
            .set(user_id)
            .map_err(|_| DomainError::invalid_argument("user_id", "already bound"))
    }

    /// 注册进通道注册表后进入 Active
    pub fn activate(&self) -> DomainResult<()> {
        self.require_user_id()?;
        self.transition(SessionState::Active)
    }

    fn transition(&self, next: SessionState) -> DomainResult<()> {
        let mut state = self.state.lock().expect("session state lock poisoned");
        *state = state.transition_to(next)?;
        Ok(())
    }

    /// 任一入站帧都视作心跳
    pub fn touch(&self, now: Instant) {
        let mut last_seen = self.last_seen.lock().expect("session lock poisoned");
        *last_seen = now;
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("session lock poisoned")
    }

    pub fn mark_ping_sent(&self, now: Instant) {
        let mut last_ping = self.last_ping_sent.lock().expect("session lock poisoned");
        *last_ping = now;
    }

    pub fn last_ping_sent(&self) -> Instant {
        *self.last_ping_sent.lock().expect("session lock poisoned")
    }

    /// 把帧写入出站队列
    pub fn send(&self, frame: Frame) -> Result<(), SessionSendError> {
        if self.state().is_terminal() {
            return Err(SessionSendError {
                session_id: self.session_id,
            });
        }
        self.outbound
            .send(SessionCommand::Frame(frame))
            .map_err(|_| SessionSendError {
                session_id: self.session_id,
            })
    }

    /// 关闭会话，幂等：仅第一次调用生效并返回 true
    ///
    /// 先发送关闭通知帧再终止发送任务，让对端拿到原因码。
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock().expect("session state lock poisoned");
            if state.is_terminal() {
                return false;
            }
            *state = SessionState::Closed;
        }
        let mut stored = self.close_reason.lock().expect("session lock poisoned");
        *stored = Some(reason);

        let _ = self.outbound.send(SessionCommand::Frame(Frame::Close { reason }));
        let _ = self.outbound.send(SessionCommand::Terminate);
        tracing::debug!(session_id = %self.session_id, reason = %reason, "会话已关闭");
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().expect("session lock poisoned")
    }

    /// 记录一次协议违规，返回累计次数
    pub fn record_violation(&self) -> u32 {
        self.violations.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id.get())
            .field("state", &self.state())
            .finish()
    }
}
