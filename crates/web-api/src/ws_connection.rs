//! WebSocket 连接管理器
//!
//! 封装单个 WebSocket 连接的完整生命周期：
//! - 认证握手（限时等待 AUTH 帧）
//! - 入站帧解码与分发
//! - 出站队列消费
//! - 断开时的注册表清理
//!
//! 每个连接一个接收任务；等待传输 I/O 是它唯一的让出点。慢连接
//! 只会拖慢自己的出站队列，不影响其他会话。

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use application::{FrameDisposition, SessionCommand, SessionHandle};
use domain::{CloseReason, Frame};

use crate::state::AppState;

pub struct RelayConnection {
    socket: WebSocket,
    state: AppState,
}

/// 一个入站 WebSocket 消息解码后的去向
enum Decoded {
    Frame(Frame),
    /// 传输层心跳，只刷新活跃时间
    Heartbeat,
    Violation(&'static str),
    Closed,
}

impl RelayConnection {
    pub fn new(socket: WebSocket, state: AppState) -> Self {
        Self { socket, state }
    }

    /// 运行连接的完整生命周期
    pub async fn run(self) {
        let state = self.state;
        let (mut sender, mut incoming) = self.socket.split();

        // 认证阶段：限时等待 AUTH 帧
        let auth_timeout = state.config.auth.auth_timeout();
        let credentials = match tokio::time::timeout(auth_timeout, read_frame(&mut incoming)).await
        {
            Ok(Some(Frame::Auth { credentials })) => credentials,
            Ok(Some(frame)) => {
                tracing::warn!(kind = frame.kind(), "认证前收到非认证帧");
                reject_and_close(&mut sender, "expected auth frame").await;
                return;
            }
            Ok(None) => {
                tracing::debug!("连接在认证完成前关闭");
                return;
            }
            Err(_) => {
                tracing::warn!("认证超时");
                reject_and_close(&mut sender, "authentication timed out").await;
                return;
            }
        };

        let user_id = match state.authenticator.authenticate(&credentials).await {
            Ok(user_id) => user_id,
            Err(rejection) => {
                tracing::warn!(reason = %rejection.reason, "认证被拒绝");
                reject_and_close(&mut sender, &rejection.reason).await;
                return;
            }
        };

        let (session, mut commands) =
            SessionHandle::connect(state.engine.clock().now(), Instant::now());
        if let Err(err) = session.authenticate(user_id.clone()) {
            tracing::error!(error = %err, "会话状态异常");
            return;
        }
        if let Err(err) = state.engine.attach_session(&session, Instant::now()).await {
            tracing::error!(error = %err, user_id = %user_id, "会话接入失败");
            return;
        }

        let _ = write_frame(
            &mut sender,
            &Frame::AuthOk {
                user_id: user_id.clone(),
                session_id: session.session_id(),
            },
        )
        .await;
        tracing::info!(
            user_id = %user_id,
            session_id = %session.session_id(),
            "WebSocket 连接已建立"
        );

        // 主循环：出站队列与入站帧
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Frame(frame)) => {
                        if write_frame(&mut sender, &frame).await.is_err() {
                            Self::detach(&state, &session, CloseReason::ClientClose);
                            break;
                        }
                    }
                    Some(SessionCommand::Terminate) | None => break,
                },
                inbound = incoming.next() => match inbound {
                    Some(Ok(message)) => match decode(message) {
                        Decoded::Frame(frame) => {
                            let disposition = state
                                .engine
                                .handle_frame(&session, frame, Instant::now())
                                .await;
                            if let FrameDisposition::Close(reason) = disposition {
                                Self::detach(&state, &session, reason);
                            }
                        }
                        Decoded::Heartbeat => session.touch(Instant::now()),
                        Decoded::Violation(context) => {
                            let disposition =
                                state.engine.note_protocol_violation(&session, context);
                            if let FrameDisposition::Close(reason) = disposition {
                                Self::detach(&state, &session, reason);
                            }
                        }
                        Decoded::Closed => {
                            Self::detach(&state, &session, CloseReason::ClientClose);
                        }
                    },
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "传输错误");
                        Self::detach(&state, &session, CloseReason::ClientClose);
                        break;
                    }
                    None => {
                        Self::detach(&state, &session, CloseReason::ClientClose);
                        break;
                    }
                },
            }
        }

        // 兜底清理：重复调用是幂等的
        Self::detach(&state, &session, CloseReason::ClientClose);
        let _ = sender.close().await;
        tracing::info!(
            user_id = %user_id,
            session_id = %session.session_id(),
            "WebSocket 连接已断开"
        );
    }

    fn detach(state: &AppState, session: &Arc<SessionHandle>, reason: CloseReason) {
        state.engine.detach_session(session, reason, Instant::now());
    }
}

/// 认证阶段读取下一个协议帧；传输层心跳被跳过
async fn read_frame(incoming: &mut SplitStream<WebSocket>) -> Option<Frame> {
    while let Some(Ok(message)) = incoming.next().await {
        match message {
            WsMessage::Text(text) => return Frame::from_json(text.as_str()).ok(),
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

fn decode(message: WsMessage) -> Decoded {
    match message {
        WsMessage::Text(text) => match Frame::from_json(text.as_str()) {
            Ok(frame) => Decoded::Frame(frame),
            Err(_) => Decoded::Violation("undecodable frame"),
        },
        WsMessage::Binary(_) => Decoded::Violation("binary frames are not supported"),
        // tungstenite 会自动回应 Ping；这里只刷新活跃时间
        WsMessage::Ping(_) | WsMessage::Pong(_) => Decoded::Heartbeat,
        WsMessage::Close(_) => Decoded::Closed,
    }
}

async fn write_frame(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    frame: &Frame,
) -> Result<(), ()> {
    let payload = match frame.to_json() {
        Ok(json) => json,
        Err(err) => {
            tracing::warn!(error = %err, "帧序列化失败");
            return Ok(());
        }
    };
    sender
        .send(WsMessage::Text(payload.into()))
        .await
        .map_err(|_| ())
}

/// 认证失败：先回原因再关闭连接
async fn reject_and_close(sender: &mut SplitSink<WebSocket, WsMessage>, reason: &str) {
    let _ = write_frame(
        sender,
        &Frame::AuthRejected {
            reason: reason.to_string(),
        },
    )
    .await;
    let _ = write_frame(
        sender,
        &Frame::Close {
            reason: CloseReason::AuthFailed,
        },
    )
    .await;
    let _ = sender.close().await;
}
