//! 基础设施适配层
//!
//! 集群桥接接口的 Redis Pub/Sub 实现，用于多进程部署时跨实例
//! 转发路由消息与在线状态事件。

pub mod redis;

pub use redis::RedisClusterBridge;
