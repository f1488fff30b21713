//! 事件总线模块
//!
//! 以命名频道为单位的发布/订阅抽象。语义为 fire-and-forget：
//! - 只投递给发布时已连接的订阅者，不做持久化和重放
//! - 单个订阅者内保持发布顺序，多个订阅者之间、频道之间不保证顺序
//! - 订阅流只会因显式取消（drop）或后端断开而结束
//!
//! 提供两个后端：
//! - [`RedisEventBus`]：基于 Redis PUBLISH/SUBSCRIBE，跨进程
//! - [`InMemoryEventBus`]：进程内实现，用于单机运行和测试

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::RedisConfig;
use crate::error::Result;

/// 频道名称定义
pub mod channels {
    use std::fmt::Display;

    /// 注册事件频道（全局唯一）
    pub const REGISTRATIONS: &str = "registrations";

    /// 账户通知频道前缀
    pub const NOTIFICATIONS_PREFIX: &str = "notifications";

    /// 账户通知频道：每个账户一个
    pub fn notifications(account_id: impl Display) -> String {
        format!("{}:{}", NOTIFICATIONS_PREFIX, account_id)
    }
}

/// 订阅消息流
///
/// 惰性、无界的消息序列；drop 即取消订阅
pub type MessageStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// 事件总线接口
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布消息，返回收到消息的订阅者数量
    ///
    /// 没有订阅者时返回 0，不视为错误，也不阻塞
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize>;

    /// 订阅频道
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}

/// 以 JSON 序列化后发布
pub async fn publish_json<T>(bus: &dyn EventBus, channel: &str, value: &T) -> Result<usize>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    bus.publish(channel, &payload).await
}

// ---------------------------------------------------------------------------
// Redis 后端
// ---------------------------------------------------------------------------

/// Redis 发布订阅事件总线
///
/// 发布复用一条多路复用连接；每个订阅独占一条 pub/sub 连接，
/// 订阅流被 drop 时连接随之关闭，Redis 侧自动退订。
#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    publisher: MultiplexedConnection,
}

impl RedisEventBus {
    /// 建立 Redis 连接
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let publisher = client.get_multiplexed_async_connection().await?;
        info!("Redis event bus connected");
        Ok(Self { client, publisher })
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.publisher.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel, receivers, "消息已发布");
        Ok(receivers.max(0) as usize)
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "Redis 订阅已建立");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }
}

// ---------------------------------------------------------------------------
// 进程内后端
// ---------------------------------------------------------------------------

/// 进程内事件总线
///
/// 每个订阅者持有一个无界队列，发布时逐一投递；
/// 订阅流被 drop 时立即从频道注销，频道无订阅者后随之移除。
#[derive(Default)]
pub struct InMemoryEventBus {
    subscribers: Arc<SubscriberMap>,
}

type SubscriberMap = DashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>;

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前频道上仍存活的订阅者数量
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// 当前登记了订阅者的频道数量
    pub fn channel_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// 清理频道上已关闭的订阅者，频道为空时移除
fn prune_channel(subscribers: &SubscriberMap, channel: &str) {
    if let Some(mut subs) = subscribers.get_mut(channel) {
        subs.retain(|tx| !tx.is_closed());
    }
    subscribers.remove_if(channel, |_, subs| subs.is_empty());
}

/// 进程内订阅流
///
/// drop 时关闭接收端并从所属频道注销
struct InMemorySubscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    subscribers: Weak<SubscriberMap>,
}

impl Stream for InMemorySubscription {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(subscribers) = self.subscribers.upgrade() {
            prune_channel(&subscribers, &self.channel);
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        let Some(mut subs) = self.subscribers.get_mut(channel) else {
            return Ok(0);
        };

        subs.retain(|tx| tx.unbounded_send(payload.to_vec()).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            drop(subs);
            self.subscribers.remove_if(channel, |_, subs| subs.is_empty());
        }

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let (tx, rx) = mpsc::unbounded();
        {
            let mut subs = self.subscribers.entry(channel.to_string()).or_default();
            subs.retain(|tx| !tx.is_closed());
            subs.push(tx);
        }
        Ok(Box::pin(InMemorySubscription {
            channel: channel.to_string(),
            rx,
            subscribers: Arc::downgrade(&self.subscribers),
        }))
    }
}
