//! 统一配置中心
//!
//! 提供中继服务的全局配置管理，包括：
//! - 服务监听地址
//! - 认证与JWT
//! - 心跳与会话生命周期
//! - 投递重试
//! - 集群桥接

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// 认证配置
    pub auth: AuthConfig,
    /// 心跳配置
    pub heartbeat: HeartbeatConfig,
    /// 会话生命周期配置
    pub session: SessionConfig,
    /// 投递追踪配置
    pub delivery: DeliveryConfig,
    /// 集群桥接配置
    pub bridge: BridgeConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// 连接建立后等待认证帧的时限（秒）
    pub auth_timeout_secs: u64,
}

/// 心跳配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// 服务器对空闲连接的主动心跳间隔（秒）
    pub interval_secs: u64,
    /// 判定连接死亡的静默时限（秒），默认取间隔的两倍
    pub timeout_secs: u64,
}

/// 会话生命周期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 会话关闭后等待同一用户重连的窗口（秒）
    pub reconnect_window_secs: u64,
    /// 协议违规次数上限，超限后关闭会话
    pub protocol_violation_limit: u32,
    /// 维护扫描周期（毫秒），心跳、重试、占位过期共用
    pub sweep_interval_ms: u64,
}

/// 投递追踪配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// 单条消息的最大投递尝试次数
    pub max_attempts: u32,
    /// 指数退避的基础延迟（毫秒）
    pub retry_base_ms: u64,
    /// 重连占位队列的容量上限
    pub pending_queue_limit: usize,
    /// 消息载荷大小上限（字节）
    pub max_payload_bytes: usize,
    /// 已完成消息ID的保留窗口（秒），用于重复检测
    pub ack_retention_secs: u64,
}

/// 集群桥接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// 未设置时桥接关闭，核心以单进程模式运行
    pub redis_url: Option<String>,
    /// Redis 频道前缀
    pub channel_prefix: String,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SessionConfig {
    pub fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl DeliveryConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn ack_retention(&self) -> Duration {
        Duration::from_secs(self.ack_retention_secs)
    }
}

impl AuthConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl RelayConfig {
    /// 从环境变量加载配置
    /// 对于关键安全配置（JWT_SECRET），如果环境变量不存在将会 panic
    /// 这确保了生产环境中不会使用不安全的默认值
    pub fn from_env() -> Self {
        let mut config = Self::from_env_with_defaults();
        config.auth.jwt_secret = env::var("JWT_SECRET")
            .expect("JWT_SECRET environment variable is required for production safety");
        config
    }

    /// 从环境变量加载配置，开发环境版本
    /// 提供不安全的默认值，仅用于测试和开发
    pub fn from_env_with_defaults() -> Self {
        Self {
            server: ServerConfig {
                host: env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env_parse("RELAY_PORT", 8080),
            },
            auth: AuthConfig {
                jwt_secret: env::var("JWT_SECRET")
                    .unwrap_or_else(|_| "insecure-dev-secret-change-me".to_string()),
                auth_timeout_secs: env_parse("AUTH_TIMEOUT_SECS", 10),
            },
            heartbeat: HeartbeatConfig {
                interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS", 15),
                timeout_secs: env_parse(
                    "HEARTBEAT_TIMEOUT_SECS",
                    env_parse("HEARTBEAT_INTERVAL_SECS", 15) * 2,
                ),
            },
            session: SessionConfig {
                reconnect_window_secs: env_parse("RECONNECT_WINDOW_SECS", 30),
                protocol_violation_limit: env_parse("PROTOCOL_VIOLATION_LIMIT", 8),
                sweep_interval_ms: env_parse("SWEEP_INTERVAL_MS", 500),
            },
            delivery: DeliveryConfig {
                max_attempts: env_parse("DELIVERY_MAX_ATTEMPTS", 5),
                retry_base_ms: env_parse("DELIVERY_RETRY_BASE_MS", 500),
                pending_queue_limit: env_parse("PENDING_QUEUE_LIMIT", 256),
                max_payload_bytes: env_parse("MAX_PAYLOAD_BYTES", 64 * 1024),
                ack_retention_secs: env_parse("ACK_RETENTION_SECS", 300),
            },
            bridge: BridgeConfig {
                redis_url: env::var("REDIS_URL").ok(),
                channel_prefix: env::var("BRIDGE_CHANNEL_PREFIX")
                    .unwrap_or_else(|_| "msgrelay".to_string()),
            },
        }
    }
}
