//! 中继引擎端到端行为测试
//!
//! 不经过真实网络：测试持有每个会话出站队列的接收端，直接观察
//! 引擎写出的帧。维护扫描通过显式构造的时间点驱动，不依赖真实
//! 定时器，保证确定性。

use std::sync::Arc;
use std::time::{Duration, Instant};

use application::{
    ChannelState, FrameDisposition, RelayEngine, SessionCommand, SessionHandle, SystemClock,
};
use config::RelayConfig;
use domain::{
    CloseReason, DeliveryFailureReason, Frame, MessageId, PresenceStatus, SessionState, UserId,
};
use tokio::sync::mpsc;

fn test_config() -> RelayConfig {
    let mut config = RelayConfig::from_env_with_defaults();
    config.heartbeat.interval_secs = 15;
    config.heartbeat.timeout_secs = 30;
    config.session.reconnect_window_secs = 30;
    config.delivery.max_attempts = 3;
    config.delivery.retry_base_ms = 500;
    config.delivery.pending_queue_limit = 256;
    config
}

fn build_engine(config: RelayConfig) -> Arc<RelayEngine> {
    RelayEngine::new(&config, Arc::new(SystemClock), None)
}

async fn connect_user(
    engine: &Arc<RelayEngine>,
    user: &str,
    now: Instant,
) -> (
    Arc<SessionHandle>,
    mpsc::UnboundedReceiver<SessionCommand>,
) {
    let (session, rx) = SessionHandle::connect(engine.clock().now(), now);
    session.authenticate(UserId::parse(user).unwrap()).unwrap();
    engine.attach_session(&session, now).await.unwrap();
    (session, rx)
}

fn drain_frames(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(command) = rx.try_recv() {
        if let SessionCommand::Frame(frame) = command {
            frames.push(frame);
        }
    }
    frames
}

fn data_frame(message_id: MessageId, target: &str, payload: &str) -> Frame {
    Frame::Data {
        message_id: Some(message_id),
        sender: None,
        target: UserId::parse(target).unwrap(),
        payload: payload.to_string(),
        timestamp: None,
    }
}

fn data_frames(frames: &[Frame]) -> Vec<(MessageId, String)> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data {
                message_id: Some(id),
                payload,
                ..
            } => Some((*id, payload.clone())),
            _ => None,
        })
        .collect()
}

/// 场景A：目标从未连接过，发送方立刻收到投递失败
#[tokio::test]
async fn scenario_a_destination_unknown() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, mut rx1) = connect_user(&engine, "u1", now).await;

    let m1 = MessageId::generate();
    let disposition = engine
        .handle_frame(&u1, data_frame(m1, "u2", "hello"), now)
        .await;
    assert_eq!(disposition, FrameDisposition::Continue);

    let frames = drain_frames(&mut rx1);
    assert!(frames.iter().any(|f| matches!(
        f,
        Frame::DeliveryFailed {
            message_id,
            reason: DeliveryFailureReason::DestinationUnknown,
        } if *message_id == m1
    )));
}

/// 场景B：正常投递并确认后停止重试
#[tokio::test]
async fn scenario_b_deliver_and_ack() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, mut rx1) = connect_user(&engine, "u1", now).await;
    let (u2, mut rx2) = connect_user(&engine, "u2", now).await;

    let m1 = MessageId::generate();
    engine
        .handle_frame(&u1, data_frame(m1, "u2", "hello"), now)
        .await;

    let delivered = data_frames(&drain_frames(&mut rx2));
    assert_eq!(delivered, vec![(m1, "hello".to_string())]);

    engine
        .handle_frame(&u2, Frame::Ack { message_id: m1 }, now)
        .await;
    assert_eq!(
        engine.tracker().queue_depth(&UserId::parse("u2").unwrap()),
        0
    );

    // 确认后远期扫描也不再重传
    engine.sweep(now + Duration::from_secs(5)).await;
    assert!(data_frames(&drain_frames(&mut rx2)).is_empty());
    assert!(drain_frames(&mut rx1)
        .iter()
        .all(|f| !matches!(f, Frame::DeliveryFailed { .. })));
}

/// 场景C：未确认消息在重连后按原序重传
#[tokio::test]
async fn scenario_c_reconnect_inherits_unacked() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, _rx1) = connect_user(&engine, "u1", now).await;
    let (u2, mut rx2) = connect_user(&engine, "u2", now).await;

    let m1 = MessageId::generate();
    engine
        .handle_frame(&u1, data_frame(m1, "u2", "hello"), now)
        .await;
    assert_eq!(data_frames(&drain_frames(&mut rx2)).len(), 1);

    // 连接无 CLOSE 帧直接断开
    engine.detach_session(&u2, CloseReason::ClientClose, now);
    assert!(matches!(
        engine.registry().lookup(&UserId::parse("u2").unwrap()),
        ChannelState::Pending
    ));

    // 窗口内重连，新会话收到同一条消息恰好一次
    let reconnect_at = now + Duration::from_secs(5);
    let (u2b, mut rx2b) = connect_user(&engine, "u2", reconnect_at).await;
    let redelivered = data_frames(&drain_frames(&mut rx2b));
    assert_eq!(redelivered, vec![(m1, "hello".to_string())]);

    engine
        .handle_frame(&u2b, Frame::Ack { message_id: m1 }, reconnect_at)
        .await;
    engine.sweep(reconnect_at + Duration::from_secs(60)).await;
    assert!(data_frames(&drain_frames(&mut rx2b)).is_empty());
}

/// 场景D：心跳超时关闭会话，离线事件等到窗口过期才发出
#[tokio::test]
async fn scenario_d_heartbeat_timeout_then_offline() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, _rx1) = connect_user(&engine, "u1", now).await;
    let (u2, mut rx2) = connect_user(&engine, "u2", now).await;

    let watcher = UserId::parse("u2").unwrap();
    let target = UserId::parse("u1").unwrap();
    engine.presence().watch(watcher, target.clone());

    // u1 静默超过超时阈值；u2 作为观察者保持心跳
    let after_timeout = now + Duration::from_secs(31);
    engine
        .handle_frame(
            &u2,
            Frame::HeartbeatPing {
                timestamp: chrono::Utc::now(),
            },
            after_timeout,
        )
        .await;
    engine.sweep(after_timeout).await;

    assert_eq!(u1.state(), SessionState::Closed);
    assert_eq!(u1.close_reason(), Some(CloseReason::HeartbeatTimeout));
    assert!(matches!(
        engine.registry().lookup(&target),
        ChannelState::Pending
    ));

    // 窗口未过期，观察者不应看到离线
    let presence_frames: Vec<Frame> = drain_frames(&mut rx2)
        .into_iter()
        .filter(|f| matches!(f, Frame::Presence { .. }))
        .collect();
    assert!(presence_frames.is_empty());

    // 窗口过期后离线事件恰好一次
    let after_window = after_timeout + Duration::from_secs(31);
    engine
        .handle_frame(
            &u2,
            Frame::HeartbeatPing {
                timestamp: chrono::Utc::now(),
            },
            after_window,
        )
        .await;
    engine.sweep(after_window).await;
    let presence_frames: Vec<Frame> = drain_frames(&mut rx2)
        .into_iter()
        .filter(|f| matches!(f, Frame::Presence { .. }))
        .collect();
    assert_eq!(presence_frames.len(), 1);
    assert!(matches!(
        &presence_frames[0],
        Frame::Presence {
            user_id,
            status: PresenceStatus::Offline,
            ..
        } if *user_id == target
    ));
}

/// 注册第二个会话总是恰好取代第一个
#[tokio::test]
async fn supersede_evicts_exactly_prior_session() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (s1, mut rx1) = connect_user(&engine, "u1", now).await;
    let (s2, _rx2) = connect_user(&engine, "u1", now).await;

    assert_eq!(s1.state(), SessionState::Closed);
    assert_eq!(s1.close_reason(), Some(CloseReason::Superseded));
    let frames = drain_frames(&mut rx1);
    assert!(frames.iter().any(|f| matches!(
        f,
        Frame::Close {
            reason: CloseReason::Superseded
        }
    )));

    match engine.registry().lookup(&UserId::parse("u1").unwrap()) {
        ChannelState::Active(live) => assert_eq!(live.session_id(), s2.session_id()),
        _ => panic!("user must stay active after supersede"),
    }

    // 被取代会话的迟到注销回调是空操作
    engine.detach_session(&s1, CloseReason::ClientClose, now);
    assert!(matches!(
        engine.registry().lookup(&UserId::parse("u1").unwrap()),
        ChannelState::Active(_)
    ));
}

/// 重复 MessageID 幂等接受，不产生第二次投递
#[tokio::test]
async fn duplicate_message_id_is_idempotent() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, _rx1) = connect_user(&engine, "u1", now).await;
    let (_u2, mut rx2) = connect_user(&engine, "u2", now).await;

    let m1 = MessageId::generate();
    engine
        .handle_frame(&u1, data_frame(m1, "u2", "hello"), now)
        .await;
    engine
        .handle_frame(&u1, data_frame(m1, "u2", "hello"), now)
        .await;

    assert_eq!(data_frames(&drain_frames(&mut rx2)).len(), 1);
    assert_eq!(
        engine.tracker().queue_depth(&UserId::parse("u2").unwrap()),
        1
    );
}

/// 同一目标的消息按发送顺序投递（重连继承也保序）
#[tokio::test]
async fn fifo_per_destination_across_reconnect() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, _rx1) = connect_user(&engine, "u1", now).await;
    let (u2, _rx2) = connect_user(&engine, "u2", now).await;

    engine.detach_session(&u2, CloseReason::ClientClose, now);

    let ids: Vec<MessageId> = (0..3).map(|_| MessageId::generate()).collect();
    for (index, id) in ids.iter().enumerate() {
        engine
            .handle_frame(&u1, data_frame(*id, "u2", &format!("m{index}")), now)
            .await;
    }
    assert_eq!(
        engine.tracker().queue_depth(&UserId::parse("u2").unwrap()),
        3
    );

    let reconnect_at = now + Duration::from_secs(3);
    let (_u2b, mut rx2b) = connect_user(&engine, "u2", reconnect_at).await;
    let delivered = data_frames(&drain_frames(&mut rx2b));
    let delivered_ids: Vec<MessageId> = delivered.iter().map(|(id, _)| *id).collect();
    assert_eq!(delivered_ids, ids);
}

/// 重试耗尽：目标保持可达但不确认，消息过期并通知发送方
#[tokio::test]
async fn retry_exhaustion_notifies_sender() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, mut rx1) = connect_user(&engine, "u1", now).await;
    let (u2, mut rx2) = connect_user(&engine, "u2", now).await;

    let m1 = MessageId::generate();
    engine
        .handle_frame(&u1, data_frame(m1, "u2", "hello"), now)
        .await;

    // 每轮扫描之间留足退避间隔；双方持续发心跳保持可达
    for round in 1..=4u64 {
        let at = now + Duration::from_secs(round * 10);
        for session in [&u1, &u2] {
            engine
                .handle_frame(
                    session,
                    Frame::HeartbeatPing {
                        timestamp: chrono::Utc::now(),
                    },
                    at,
                )
                .await;
        }
        engine.sweep(at).await;
    }

    // 初次传输 + 两次重试 = max_attempts(3)，之后过期
    assert_eq!(data_frames(&drain_frames(&mut rx2)).len(), 3);
    let failures: Vec<Frame> = drain_frames(&mut rx1)
        .into_iter()
        .filter(|f| matches!(f, Frame::DeliveryFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        Frame::DeliveryFailed {
            message_id,
            reason: DeliveryFailureReason::DeliveryExhausted,
        } if *message_id == m1
    ));
    assert_eq!(
        engine.tracker().queue_depth(&UserId::parse("u2").unwrap()),
        0
    );
}

/// 断开后立即重连：观察者看不到任何在线状态翻动
#[tokio::test]
async fn presence_debounce_on_quick_reconnect() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, _rx1) = connect_user(&engine, "u1", now).await;
    let (_u2, mut rx2) = connect_user(&engine, "u2", now).await;

    engine
        .presence()
        .watch(UserId::parse("u2").unwrap(), UserId::parse("u1").unwrap());

    engine.detach_session(&u1, CloseReason::ClientClose, now);
    let (_u1b, _rx1b) = connect_user(&engine, "u1", now + Duration::from_secs(2)).await;

    // 远超原窗口的扫描也不产生事件：占位已被重连吸收
    engine.sweep(now + Duration::from_secs(120)).await;

    let presence_frames: Vec<Frame> = drain_frames(&mut rx2)
        .into_iter()
        .filter(|f| matches!(f, Frame::Presence { .. }))
        .collect();
    assert!(presence_frames.is_empty());
}

/// 窗口过期：未投递消息报告过期，用户离线
#[tokio::test]
async fn pending_window_expiry_fails_buffered_messages() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, mut rx1) = connect_user(&engine, "u1", now).await;
    let (u2, _rx2) = connect_user(&engine, "u2", now).await;

    engine.detach_session(&u2, CloseReason::ClientClose, now);
    let m1 = MessageId::generate();
    engine
        .handle_frame(&u1, data_frame(m1, "u2", "hello"), now)
        .await;

    // u1 保持心跳，避免自己先被判定超时
    let after_window = now + Duration::from_secs(31);
    engine
        .handle_frame(
            &u1,
            Frame::HeartbeatPing {
                timestamp: chrono::Utc::now(),
            },
            after_window,
        )
        .await;
    engine.sweep(after_window).await;

    let target = UserId::parse("u2").unwrap();
    assert!(matches!(
        engine.registry().lookup(&target),
        ChannelState::NotFound
    ));
    let failures: Vec<Frame> = drain_frames(&mut rx1)
        .into_iter()
        .filter(|f| matches!(f, Frame::DeliveryFailed { .. }))
        .collect();
    assert!(failures.iter().any(|f| matches!(
        f,
        Frame::DeliveryFailed {
            message_id,
            reason: DeliveryFailureReason::Expired,
        } if *message_id == m1
    )));
}

/// 占位队列溢出丢弃最旧消息并通知其发送方
#[tokio::test]
async fn pending_queue_overflow_expires_oldest() {
    let mut config = test_config();
    config.delivery.pending_queue_limit = 2;
    let engine = build_engine(config);
    let now = Instant::now();
    let (u1, mut rx1) = connect_user(&engine, "u1", now).await;
    let (u2, _rx2) = connect_user(&engine, "u2", now).await;

    engine.detach_session(&u2, CloseReason::ClientClose, now);

    let ids: Vec<MessageId> = (0..3).map(|_| MessageId::generate()).collect();
    for (index, id) in ids.iter().enumerate() {
        engine
            .handle_frame(&u1, data_frame(*id, "u2", &format!("m{index}")), now)
            .await;
    }

    assert_eq!(
        engine.tracker().queue_depth(&UserId::parse("u2").unwrap()),
        2
    );
    let failures: Vec<Frame> = drain_frames(&mut rx1)
        .into_iter()
        .filter(|f| matches!(f, Frame::DeliveryFailed { .. }))
        .collect();
    assert!(failures.iter().any(|f| matches!(
        f,
        Frame::DeliveryFailed {
            message_id,
            reason: DeliveryFailureReason::Expired,
        } if *message_id == ids[0]
    )));

    // 重连后只收到幸存的两条，顺序不变
    let (_u2b, mut rx2b) = connect_user(&engine, "u2", now + Duration::from_secs(1)).await;
    let delivered: Vec<MessageId> = data_frames(&drain_frames(&mut rx2b))
        .iter()
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(delivered, vec![ids[1], ids[2]]);
}

/// 超限载荷被拒绝但会话保持打开
#[tokio::test]
async fn oversized_payload_rejected_without_close() {
    let mut config = test_config();
    config.delivery.max_payload_bytes = 8;
    let engine = build_engine(config);
    let now = Instant::now();
    let (u1, mut rx1) = connect_user(&engine, "u1", now).await;
    let (_u2, mut rx2) = connect_user(&engine, "u2", now).await;

    let disposition = engine
        .handle_frame(
            &u1,
            data_frame(MessageId::generate(), "u2", "way too large payload"),
            now,
        )
        .await;

    assert_eq!(disposition, FrameDisposition::Continue);
    assert!(u1.is_active());
    assert!(data_frames(&drain_frames(&mut rx2)).is_empty());
    assert!(drain_frames(&mut rx1).iter().any(|f| matches!(
        f,
        Frame::Error { code, .. } if code == "PAYLOAD_TOO_LARGE"
    )));
}

/// 协议违规累计到阈值才关闭会话
#[tokio::test]
async fn repeated_protocol_violations_close_session() {
    let mut config = test_config();
    config.session.protocol_violation_limit = 3;
    let engine = build_engine(config);
    let now = Instant::now();
    let (u1, _rx1) = connect_user(&engine, "u1", now).await;

    let bogus = || Frame::AuthOk {
        user_id: UserId::parse("u1").unwrap(),
        session_id: u1.session_id(),
    };

    assert_eq!(
        engine.handle_frame(&u1, bogus(), now).await,
        FrameDisposition::Continue
    );
    assert_eq!(
        engine.handle_frame(&u1, bogus(), now).await,
        FrameDisposition::Continue
    );
    assert_eq!(
        engine.handle_frame(&u1, bogus(), now).await,
        FrameDisposition::Close(CloseReason::ProtocolError)
    );
}

/// 未知 MessageID 的确认被静默忽略
#[tokio::test]
async fn unknown_ack_is_ignored() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, _rx1) = connect_user(&engine, "u1", now).await;

    let disposition = engine
        .handle_frame(
            &u1,
            Frame::Ack {
                message_id: MessageId::generate(),
            },
            now,
        )
        .await;
    assert_eq!(disposition, FrameDisposition::Continue);
    assert!(u1.is_active());
}

/// 来自其他实例的在线状态事件可以本地扇出给观察者
#[tokio::test]
async fn imported_presence_reaches_watchers() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (_u2, mut rx2) = connect_user(&engine, "u2", now).await;

    let remote = UserId::parse("remote").unwrap();
    engine
        .presence()
        .watch(UserId::parse("u2").unwrap(), remote.clone());

    let event = domain::PresenceEvent::online(remote.clone(), chrono::Utc::now());
    assert_eq!(engine.import_presence(&event), 1);
    assert!(drain_frames(&mut rx2).iter().any(|f| matches!(
        f,
        Frame::Presence {
            user_id,
            status: PresenceStatus::Online,
            ..
        } if *user_id == remote
    )));

    // 取消关注后不再收到
    engine
        .presence()
        .unwatch(&UserId::parse("u2").unwrap(), &remote);
    assert_eq!(engine.import_presence(&event), 0);
}

/// 心跳请求得到响应，空闲会话收到服务器主动 ping
#[tokio::test]
async fn heartbeat_ping_pong_and_server_ping() {
    let engine = build_engine(test_config());
    let now = Instant::now();
    let (u1, mut rx1) = connect_user(&engine, "u1", now).await;

    engine
        .handle_frame(
            &u1,
            Frame::HeartbeatPing {
                timestamp: chrono::Utc::now(),
            },
            now,
        )
        .await;
    assert!(drain_frames(&mut rx1)
        .iter()
        .any(|f| matches!(f, Frame::HeartbeatPong { .. })));

    // 空闲超过间隔但未超时：服务器发 ping 而不是关闭
    engine.sweep(now + Duration::from_secs(20)).await;
    assert!(u1.is_active());
    assert!(drain_frames(&mut rx1)
        .iter()
        .any(|f| matches!(f, Frame::HeartbeatPing { .. })));
}
