//! 集群桥接的 Redis 实现
//!
//! 发布端复用一个自动重连的连接管理器；监听端跑在后台任务里，
//! 断线后按指数退避重建订阅。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use uuid::Uuid;

use application::{BridgeError, ClusterBridge, PresenceStream, RoutedStream};
use domain::{Message, PresenceEvent, UserId};

use super::{presence_channel, routed_channel, routed_pattern};

const MAX_LISTEN_RETRIES: u32 = 5;
const RECONNECT_BASE_MS: u64 = 500;

/// 跨实例传输的信封，origin 用于过滤自己发出的内容
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    origin: Uuid,
    payload: T,
}

#[derive(Default)]
struct Subscribers {
    routed: HashMap<UserId, mpsc::UnboundedSender<Message>>,
    presence: HashMap<UserId, Vec<mpsc::UnboundedSender<PresenceEvent>>>,
}

pub struct RedisClusterBridge {
    connection: ConnectionManager,
    instance_id: Uuid,
    prefix: String,
    subscribers: Arc<Mutex<Subscribers>>,
    shutdown: Arc<AtomicBool>,
}

impl RedisClusterBridge {
    /// 连接 Redis 并启动后台监听任务
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
    ) -> Result<Arc<Self>, BridgeError> {
        let client = redis::Client::open(url)
            .map_err(|e| BridgeError::connection(format!("创建 Redis 客户端失败: {e}")))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BridgeError::connection(format!("连接 Redis 失败: {e}")))?;

        let bridge = Arc::new(Self {
            connection,
            instance_id: Uuid::new_v4(),
            prefix: prefix.into(),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        tracing::info!(instance_id = %bridge.instance_id, "Redis 集群桥接已连接");
        bridge.clone().spawn_listener(client);
        Ok(bridge)
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        tracing::info!("Redis 集群桥接正在关闭");
    }

    fn spawn_listener(self: Arc<Self>, client: redis::Client) {
        tokio::spawn(async move {
            let mut retry_count = 0u32;
            while !self.shutdown.load(Ordering::Relaxed) {
                match self.listen_once(&client).await {
                    Ok(()) => {
                        retry_count = 0;
                        tracing::info!("Redis 订阅流结束，准备重建");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Redis 监听错误");
                        retry_count += 1;
                        if retry_count >= MAX_LISTEN_RETRIES {
                            tracing::error!("连接失败，已达最大重试次数");
                            break;
                        }
                    }
                }
                let delay = Duration::from_millis(
                    RECONNECT_BASE_MS * 2u64.pow(retry_count.min(6)),
                );
                sleep(delay).await;
            }
            tracing::info!("Redis 监听任务已停止");
        });
    }

    async fn listen_once(&self, client: &redis::Client) -> Result<(), BridgeError> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BridgeError::connection(format!("获取 PubSub 连接失败: {e}")))?;

        pubsub
            .psubscribe(routed_pattern(&self.prefix))
            .await
            .map_err(|e| BridgeError::subscribe(format!("订阅路由频道失败: {e}")))?;
        pubsub
            .subscribe(presence_channel(&self.prefix))
            .await
            .map_err(|e| BridgeError::subscribe(format!("订阅在线状态频道失败: {e}")))?;

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let channel = message.get_channel_name().to_string();
            match message.get_payload::<String>() {
                Ok(payload) => self.dispatch(&channel, &payload),
                Err(err) => {
                    tracing::warn!(error = %err, channel, "获取消息负载失败");
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, channel: &str, payload: &str) {
        if channel == presence_channel(&self.prefix) {
            let Some(event) = self.decode::<PresenceEvent>(channel, payload) else {
                return;
            };
            let subscribers = self.subscribers.lock().expect("bridge lock poisoned");
            if let Some(senders) = subscribers.presence.get(&event.user_id) {
                for sender in senders {
                    let _ = sender.send(event.clone());
                }
            }
            return;
        }

        let route_prefix = format!("{}:route:", self.prefix);
        if let Some(user) = channel.strip_prefix(route_prefix.as_str()) {
            let Ok(user_id) = UserId::parse(user) else {
                tracing::warn!(channel, "路由频道上的用户标识无效");
                return;
            };
            let Some(message) = self.decode::<Message>(channel, payload) else {
                return;
            };
            let mut subscribers = self.subscribers.lock().expect("bridge lock poisoned");
            if let Some(sender) = subscribers.routed.get(&user_id) {
                if sender.send(message).is_err() {
                    // 接收端已丢弃，清除失效订阅
                    subscribers.routed.remove(&user_id);
                }
            }
        }
    }

    /// 解码信封并过滤本实例发出的内容
    fn decode<T: DeserializeOwned>(&self, channel: &str, payload: &str) -> Option<T> {
        match serde_json::from_str::<Envelope<T>>(payload) {
            Ok(envelope) if envelope.origin == self.instance_id => None,
            Ok(envelope) => Some(envelope.payload),
            Err(err) => {
                tracing::warn!(error = %err, channel, "反序列化桥接消息失败");
                None
            }
        }
    }

    async fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> Result<(), BridgeError> {
        let envelope = Envelope {
            origin: self.instance_id,
            payload,
        };
        let json = serde_json::to_string(&envelope)
            .map_err(|e| BridgeError::publish(format!("序列化失败: {e}")))?;

        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(channel, json)
            .await
            .map_err(|e| BridgeError::publish(format!("发布失败: {e}")))?;
        tracing::debug!(channel, receivers, "桥接消息已发布");
        Ok(())
    }
}

#[async_trait]
impl ClusterBridge for RedisClusterBridge {
    async fn publish_routed(&self, message: &Message) -> Result<(), BridgeError> {
        let channel = routed_channel(&self.prefix, &message.target);
        self.publish(&channel, message).await
    }

    async fn subscribe_routed(&self, user_id: &UserId) -> Result<RoutedStream, BridgeError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().expect("bridge lock poisoned");
        subscribers.routed.insert(user_id.clone(), sender);
        Ok(RoutedStream::new(receiver))
    }

    async fn unsubscribe_routed(&self, user_id: &UserId) -> Result<(), BridgeError> {
        let mut subscribers = self.subscribers.lock().expect("bridge lock poisoned");
        subscribers.routed.remove(user_id);
        Ok(())
    }

    async fn publish_presence(&self, event: &PresenceEvent) -> Result<(), BridgeError> {
        let channel = presence_channel(&self.prefix);
        self.publish(&channel, event).await
    }

    async fn subscribe_presence(&self, user_id: &UserId) -> Result<PresenceStream, BridgeError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().expect("bridge lock poisoned");
        subscribers
            .presence
            .entry(user_id.clone())
            .or_default()
            .push(sender);
        Ok(PresenceStream::new(receiver))
    }
}
