//! 促销权益后台进程
//!
//! 连接 PostgreSQL 与 Redis，运行欢迎礼包消费者，直到收到关闭信号。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use loyalty_shared::{
    config::AppConfig,
    database::Database,
    observability,
    pubsub::{EventBus, RedisEventBus},
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use loyalty_promotions::{
    repository::{MIGRATOR, PgEntitlementStore}, service::EntitlementService, worker::WelcomeGrantConsumer,
};

const SERVICE_NAME: &str = "promotion-worker";

/// 后台任务退出等待上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..AppConfig::default()
        }
    });

    // 2. 可观测性
    let _guard = observability::init(&config.service_name, &config.observability).await?;
    info!(
        environment = %config.environment,
        production = config.is_production(),
        "Starting {}...",
        config.service_name
    );

    // 3. 数据库
    let db = Database::connect(&config.database).await?;
    db.migrate(&MIGRATOR).await?;
    let latency = db.health_check().await?;
    let store = Arc::new(PgEntitlementStore::new(db.pool().clone()));
    info!(latency_ms = latency.as_millis() as u64, "Database connection established");

    // 4. 事件总线
    let redis_bus = RedisEventBus::connect(&config.redis).await?;
    redis_bus.health_check().await?;
    let bus: Arc<dyn EventBus> = Arc::new(redis_bus);
    info!("Event bus connection established");

    // 5. 权益服务
    let service = Arc::new(EntitlementService::new(store, bus.clone()));

    // 6. 后台任务
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_handle = if config.worker.welcome_grant_enabled {
        Some(WelcomeGrantConsumer::new(bus, service).spawn(shutdown_rx))
    } else {
        info!("Welcome grant consumer disabled");
        None
    };

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Some(handle) = consumer_handle {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(Ok(()))) => info!("Welcome grant consumer stopped"),
            Ok(Ok(Err(e))) => error!(error = %e, "Welcome grant consumer exited with error"),
            Ok(Err(e)) => error!(error = %e, "Welcome grant consumer task panicked"),
            Err(_) => warn!("Welcome grant consumer did not stop in time"),
        }
    }

    db.close().await;
    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
