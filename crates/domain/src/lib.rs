//! 消息中继系统核心领域模型
//!
//! 包含用户、会话、消息、在线状态等核心实体，以及帧协议和相关的业务规则。

pub mod errors;
pub mod frame;
pub mod message;
pub mod presence;
pub mod session;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use frame::*;
pub use message::*;
pub use presence::*;
pub use session::*;
pub use value_objects::*;
