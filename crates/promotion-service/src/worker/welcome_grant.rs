//! 欢迎礼包消费者
//!
//! 进程生命周期内常驻的后台任务：订阅注册频道，为每个新注册账户发放欢迎礼包。
//! 至多一次、尽力而为：解析失败或发放失败只记日志，不重试、不重新入队。
//! 重复的注册事件由存储层的唯一约束拦截（`Conflict`）。

use std::sync::Arc;

use futures::StreamExt;
use loyalty_shared::observability::metrics::record_welcome_grant;
use loyalty_shared::pubsub::{EventBus, channels};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EntitlementError, ErrorKind, Result};
use crate::repository::EntitlementStore;
use crate::service::EntitlementService;

/// 欢迎礼包消费者
pub struct WelcomeGrantConsumer<S: EntitlementStore> {
    bus: Arc<dyn EventBus>,
    service: Arc<EntitlementService<S>>,
}

impl<S: EntitlementStore + 'static> WelcomeGrantConsumer<S> {
    pub fn new(bus: Arc<dyn EventBus>, service: Arc<EntitlementService<S>>) -> Self {
        Self { bus, service }
    }

    /// 作为独立任务启动
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut stream = self.bus.subscribe(channels::REGISTRATIONS).await?;
        info!(channel = channels::REGISTRATIONS, "欢迎礼包消费者已启动");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，欢迎礼包消费者退出");
                        return Ok(());
                    }
                }

                next = stream.next() => {
                    let Some(payload) = next else {
                        warn!("注册事件流意外结束");
                        return Err(EntitlementError::EventBus(format!(
                            "订阅流已结束: {}",
                            channels::REGISTRATIONS
                        )));
                    };
                    self.handle(&payload).await;
                }
            }
        }
    }

    async fn handle(&self, payload: &[u8]) {
        let account_id = match parse_account_id(payload) {
            Ok(id) => id,
            Err(e) => {
                record_welcome_grant("invalid_payload");
                warn!(error = %e, "无法解析注册事件");
                return;
            }
        };

        match self.service.grant_welcome(account_id).await {
            Ok(entitlement) => {
                record_welcome_grant("granted");
                info!(
                    %account_id,
                    entitlement_id = %entitlement.id,
                    ends_at = %entitlement.ends_at,
                    "欢迎礼包已发放"
                );
            }
            Err(e) if e.kind() == ErrorKind::Conflict => {
                record_welcome_grant("duplicate");
                debug!(%account_id, "重复的注册事件，已忽略");
            }
            Err(e) => {
                record_welcome_grant("failed");
                error!(%account_id, error = %e, "欢迎礼包发放失败");
            }
        }
    }
}

/// 注册事件负载为账户 ID 文本，兼容带引号的 JSON 字符串
fn parse_account_id(payload: &[u8]) -> Result<Uuid> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| EntitlementError::Validation(format!("注册事件不是 UTF-8: {e}")))?;
    let text = text.trim().trim_matches('"');
    Uuid::parse_str(text)
        .map_err(|e| EntitlementError::Validation(format!("非法的账户 ID {text:?}: {e}")))
}

/// 发布注册事件
pub async fn publish_registration(bus: &dyn EventBus, account_id: Uuid) -> Result<usize> {
    let receivers = bus
        .publish(channels::REGISTRATIONS, account_id.to_string().as_bytes())
        .await?;
    Ok(receivers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_account_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_account_id(id.to_string().as_bytes()).unwrap(), id);
        assert_eq!(parse_account_id(format!("\"{id}\"\n").as_bytes()).unwrap(), id);
        assert!(parse_account_id(b"not-a-uuid").is_err());
        assert!(parse_account_id(&[0xff, 0xfe]).is_err());
    }
}
