//! 中继核心引擎
//!
//! 会话生命周期、通道注册表、心跳监测、投递追踪、消息路由与
//! 在线状态广播共同构成一个紧耦合子系统；本 crate 不关心具体传输，
//! 传输层只需要把帧交给 [`RelayEngine`] 并消费会话的出站队列。

pub mod auth;
pub mod backoff;
pub mod bridge;
pub mod clock;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;

pub use auth::{AuthRejection, Authenticator, StaticTokenAuthenticator};
pub use backoff::Backoff;
pub use bridge::{BridgeError, ClusterBridge, PresenceStream, RoutedStream};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{DeliveryFailure, DeliveryTracker, SendOutcome};
pub use engine::{FrameDisposition, RelayEngine};
pub use error::RelayError;
pub use heartbeat::{HeartbeatMonitor, HeartbeatSweep};
pub use presence::PresenceBroadcaster;
pub use registry::{ChannelRegistry, ChannelState, RegisterOutcome};
pub use router::{MessageRouter, RejectReason, RouterOutcome};
pub use session::{SessionCommand, SessionHandle, SessionSendError};
