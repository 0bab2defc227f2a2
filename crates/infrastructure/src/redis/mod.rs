//! Redis 集群桥接
//!
//! 频道布局：
//! - `{prefix}:route:{user_id}` — 发往某个用户的路由消息，每用户一个频道
//! - `{prefix}:presence` — 全实例共享的在线状态事件频道
//!
//! 每条发布都带发布实例的标识，监听端跳过自己发出的内容，避免回环。

pub mod bridge;

pub use bridge::RedisClusterBridge;

pub(crate) fn routed_channel(prefix: &str, user_id: &domain::UserId) -> String {
    format!("{prefix}:route:{user_id}")
}

pub(crate) fn routed_pattern(prefix: &str) -> String {
    format!("{prefix}:route:*")
}

pub(crate) fn presence_channel(prefix: &str) -> String {
    format!("{prefix}:presence")
}
