//! PostgreSQL 连接池
//!
//! 服务启动时建池、执行迁移并自检，关停时排空连接。

use std::time::{Duration, Instant};

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// 连接池快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

/// 数据库句柄
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 按配置建立连接池
    #[instrument(skip(config), fields(max = config.max_connections, min = config.min_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        let db = Self { pool };
        let stats = db.stats();
        info!(size = stats.size, idle = stats.idle, "数据库连接池已建立");
        Ok(db)
    }

    /// 执行服务自带的迁移集
    ///
    /// 已执行过的版本会被跳过，可重复调用
    #[instrument(skip_all, fields(migrations = migrator.iter().count()))]
    pub async fn migrate(&self, migrator: &Migrator) -> Result<()> {
        migrator.run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// 往返一次 `SELECT 1`，返回耗时
    pub async fn health_check(&self) -> Result<Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        let latency = started.elapsed();
        debug!(latency_ms = latency.as_millis() as u64, "数据库健康检查通过");
        Ok(latency)
    }

    /// 关闭连接池，等待借出的连接归还
    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}
