//! 通知中继
//!
//! 每个在线客户端会话一个中继任务：订阅该账户的通知频道，
//! 把收到的每条消息原样写给客户端，直到会话结束。
//!
//! - 写入失败：退订并返回错误，由调用方关闭连接
//! - 收到关闭信号：退订并正常返回
//! - 订阅流意外结束：返回 `EventBus` 错误
//!
//! 没有额外的缓冲或背压，慢客户端会让消息堆积在事件总线的订阅队列中。

use std::sync::Arc;

use futures::StreamExt;
use loyalty_shared::observability::metrics::record_notification_frame;
use loyalty_shared::pubsub::{EventBus, channels, publish_json};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::identity::IdentityResolver;
use super::message::NotificationMessage;
use super::transport::FrameSink;
use crate::error::{EntitlementError, Result};

/// 把账户通知频道中继到客户端
#[instrument(skip(bus, sink, shutdown))]
pub async fn relay<K>(
    bus: &dyn EventBus,
    account_id: Uuid,
    sink: &mut K,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    K: FrameSink + ?Sized,
{
    let channel = channels::notifications(account_id);
    let mut stream = bus.subscribe(&channel).await?;
    info!(%channel, "通知中继已启动");

    if *shutdown.borrow() {
        return Ok(());
    }

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(%channel, "收到关闭信号，通知中继退出");
                    return Ok(());
                }
            }

            next = stream.next() => {
                let Some(payload) = next else {
                    warn!(%channel, "订阅流意外结束");
                    return Err(EntitlementError::EventBus(format!("订阅流已结束: {channel}")));
                };

                let frame = match String::from_utf8(payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%channel, error = %e, "跳过非 UTF-8 消息");
                        continue;
                    }
                };

                if let Err(e) = sink.write_frame(&frame).await {
                    warn!(%channel, error = %e, "写入客户端失败，中继退出");
                    return Err(e);
                }
                record_notification_frame();
                debug!(%channel, len = frame.len(), "通知已转发");
            }
        }
    }
}

/// 客户端会话入口
pub struct NotificationHub {
    bus: Arc<dyn EventBus>,
    identity: Arc<dyn IdentityResolver>,
}

impl NotificationHub {
    pub fn new(bus: Arc<dyn EventBus>, identity: Arc<dyn IdentityResolver>) -> Self {
        Self { bus, identity }
    }

    /// 服务一个客户端会话：解析身份 -> 中继 -> 关闭连接
    ///
    /// 无论中继以何种方式结束，都会关闭 sink
    pub async fn serve_session<K>(
        &self,
        token: &str,
        sink: &mut K,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        K: FrameSink + ?Sized,
    {
        let caller = match self.identity.resolve_caller(token).await {
            Ok(caller) => caller,
            Err(e) => {
                warn!(error = %e, "会话身份解析失败");
                close_quietly(sink).await;
                return Err(e);
            }
        };

        info!(account_id = %caller.account_id, "客户端会话已建立");
        let result = relay(self.bus.as_ref(), caller.account_id, sink, shutdown).await;
        close_quietly(sink).await;
        info!(account_id = %caller.account_id, ok = result.is_ok(), "客户端会话已结束");
        result
    }

    /// 回显心跳：向账户自己的通知频道发布一条 `user_ping`
    pub async fn ping(&self, account_id: Uuid) -> Result<usize> {
        let message = NotificationMessage::user_ping(account_id);
        let receivers =
            publish_json(self.bus.as_ref(), &channels::notifications(account_id), &message).await?;
        Ok(receivers)
    }
}

async fn close_quietly<K: FrameSink + ?Sized>(sink: &mut K) {
    if let Err(e) = sink.close().await {
        debug!(error = %e, "关闭客户端连接失败");
    }
}
