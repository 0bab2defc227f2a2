//! 主应用程序入口
//!
//! 装配中继引擎与 WebSocket 传输层，按需启用 Redis 集群桥接。

use std::sync::Arc;

use application::{ClusterBridge, RelayEngine, SystemClock};
use config::RelayConfig;
use infrastructure::RedisClusterBridge;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtAuthenticator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 读取环境变量配置
    let config = Arc::new(RelayConfig::from_env_with_defaults());

    // 配置了 REDIS_URL 时启用跨实例桥接；单进程部署不需要
    let bridge: Option<Arc<dyn ClusterBridge>> = match &config.bridge.redis_url {
        Some(url) => {
            let bridge: Arc<dyn ClusterBridge> =
                RedisClusterBridge::connect(url, config.bridge.channel_prefix.clone()).await?;
            tracing::info!("Redis 集群桥接已启用");
            Some(bridge)
        }
        None => None,
    };

    // 创建引擎并启动统一维护任务（心跳扫描、重试、占位回收）
    let engine = RelayEngine::new(&config, Arc::new(SystemClock), bridge);
    let _maintenance = engine.spawn_maintenance(config.session.sweep_interval());

    let authenticator = Arc::new(JwtAuthenticator::new(&config.auth.jwt_secret));
    let state = AppState::new(engine.clone(), authenticator, config.clone());

    // 启动 Web 服务器
    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("消息中继服务器启动在 ws://{}/ws", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 关闭全部会话后退出
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到停机信号");
}
