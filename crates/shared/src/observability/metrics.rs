//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    /// 停止指标 HTTP 服务
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册业务指标描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "entitlement_grants_total",
        "Total number of entitlement grants"
    );
    metrics::describe_counter!(
        "entitlement_claims_total",
        "Total number of entitlement claim attempts"
    );
    metrics::describe_counter!(
        "balance_transactions_total",
        "Total number of balance ledger mutations"
    );
    metrics::describe_counter!(
        "notification_frames_total",
        "Total number of notification frames relayed to clients"
    );
    metrics::describe_counter!(
        "welcome_grants_total",
        "Total number of registration events handled by the welcome consumer"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录权益发放
#[inline]
pub fn record_grant(kind: &str, status: &str) {
    metrics::counter!(
        "entitlement_grants_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录权益领取
#[inline]
pub fn record_claim(result: &str) {
    metrics::counter!("entitlement_claims_total", "result" => result.to_string()).increment(1);
}

/// 记录余额变动
#[inline]
pub fn record_balance_transaction(direction: &str, result: &str) {
    metrics::counter!(
        "balance_transactions_total",
        "direction" => direction.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// 记录推送到客户端的通知帧
#[inline]
pub fn record_notification_frame() {
    metrics::counter!("notification_frames_total").increment(1);
}

/// 记录欢迎礼包消费结果
#[inline]
pub fn record_welcome_grant(result: &str) {
    metrics::counter!("welcome_grants_total", "result" => result.to_string()).increment(1);
}
