//! 通知中继集成测试
//!
//! 验证账户频道到客户端会话的转发、会话生命周期以及各类退出路径。

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use loyalty_promotions::error::{EntitlementError, Result};
use loyalty_promotions::models::{Account, Caller, Promotion, PromotionKind, Role};
use loyalty_promotions::notification::{
    ChannelSink, FrameSink, IdentityResolver, NotificationHub, NotificationMessage,
    NotificationType, relay,
};
use loyalty_promotions::repository::MemoryStore;
use loyalty_promotions::service::EntitlementService;
use loyalty_shared::error::Result as BusResult;
use loyalty_shared::pubsub::{EventBus, InMemoryEventBus, MessageStream, channels};
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tokio_test::assert_ok;
use uuid::Uuid;

// ==================== 测试替身 ====================

/// 固定 token -> 账户映射
struct StaticIdentity {
    token: String,
    caller: Caller,
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve_caller(&self, token: &str) -> Result<Caller> {
        if token == self.token {
            Ok(self.caller)
        } else {
            Err(EntitlementError::Forbidden("token 无效".into()))
        }
    }
}

/// 写入第 N 帧后开始失败的 sink
struct FlakySink {
    written: Vec<String>,
    fail_after: usize,
    closed: bool,
}

#[async_trait]
impl FrameSink for FlakySink {
    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        if self.written.len() >= self.fail_after {
            return Err(EntitlementError::Transport("broken pipe".into()));
        }
        self.written.push(frame.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// 订阅后立即结束的事件总线
struct ClosedBus;

#[async_trait]
impl EventBus for ClosedBus {
    async fn publish(&self, _channel: &str, _payload: &[u8]) -> BusResult<usize> {
        Ok(0)
    }

    async fn subscribe(&self, _channel: &str) -> BusResult<MessageStream> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> String {
    tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
        .await
        .expect("等待帧超时")
        .expect("连接已关闭")
}

async fn wait_for_subscriber(bus: &InMemoryEventBus, channel: &str) {
    tokio::time::timeout(StdDuration::from_secs(1), async {
        while bus.subscriber_count(channel) == 0 {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    })
    .await
    .expect("等待订阅超时");
}

// ==================== 测试 ====================

#[tokio::test]
async fn test_relay_forwards_in_publish_order() {
    let bus = Arc::new(InMemoryEventBus::new());
    let account_id = Uuid::new_v4();
    let channel = channels::notifications(account_id);
    let (mut sink, mut rx) = ChannelSink::pair(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_bus = bus.clone();
    let handle = tokio::spawn(async move {
        relay(relay_bus.as_ref(), account_id, &mut sink, shutdown_rx).await
    });
    wait_for_subscriber(&bus, &channel).await;

    for i in 0..5 {
        bus.publish(&channel, format!("frame-{i}").as_bytes())
            .await
            .unwrap();
    }
    // 其他账户的消息不会被转发
    bus.publish(&channels::notifications(Uuid::new_v4()), b"other")
        .await
        .unwrap();

    for i in 0..5 {
        assert_eq!(recv_frame(&mut rx).await, format!("frame-{i}"));
    }

    shutdown_tx.send(true).unwrap();
    let result = handle.await.unwrap();
    assert_ok!(result);
    assert_eq!(bus.subscriber_count(&channel), 0);
}

#[tokio::test]
async fn test_relay_returns_sink_error_and_unsubscribes() {
    let bus = Arc::new(InMemoryEventBus::new());
    let account_id = Uuid::new_v4();
    let channel = channels::notifications(account_id);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_bus = bus.clone();
    let handle = tokio::spawn(async move {
        let mut sink = FlakySink {
            written: Vec::new(),
            fail_after: 1,
            closed: false,
        };
        let result = relay(relay_bus.as_ref(), account_id, &mut sink, shutdown_rx).await;
        (result, sink)
    });
    wait_for_subscriber(&bus, &channel).await;

    bus.publish(&channel, b"first").await.unwrap();
    bus.publish(&channel, b"second").await.unwrap();

    let (result, sink) = tokio::time::timeout(StdDuration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(EntitlementError::Transport(_))));
    assert_eq!(sink.written, vec!["first".to_string()]);
    // relay 本身不关闭连接，由调用方负责
    assert!(!sink.closed);
    assert_eq!(bus.subscriber_count(&channel), 0);
}

#[tokio::test]
async fn test_relay_reports_ended_stream() {
    let (mut sink, _rx) = ChannelSink::pair(1);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = relay(&ClosedBus, Uuid::new_v4(), &mut sink, shutdown_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::EventBus(_)));
}

#[tokio::test]
async fn test_session_receives_entitlement_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let account = Account::new("ivan", "ivan@example.com", Role::Player);
    let promotion = Promotion::new("Cashback", dec!(12.5), PromotionKind::Regular);
    store.insert_account(account.clone()).await;
    store.insert_promotion(promotion.clone()).await;

    let service = EntitlementService::new(store.clone(), bus.clone());
    let hub = Arc::new(NotificationHub::new(
        bus.clone(),
        Arc::new(StaticIdentity {
            token: "ivan-token".into(),
            caller: Caller::new(account.id, account.role),
        }),
    ));

    let (mut sink, mut rx) = ChannelSink::pair(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session_hub = hub.clone();
    let session = tokio::spawn(async move {
        session_hub
            .serve_session("ivan-token", &mut sink, shutdown_rx)
            .await
    });
    wait_for_subscriber(&bus, &channels::notifications(account.id)).await;

    let now = Utc::now();
    let entitlement = service
        .grant(
            account.id,
            promotion.id,
            now - Duration::minutes(5),
            now + Duration::minutes(5),
        )
        .await
        .unwrap();
    let caller = Caller::new(account.id, account.role);
    service.claim_as(&caller, entitlement.id).await.unwrap();
    assert_eq!(hub.ping(account.id).await.unwrap(), 1);

    let kinds: Vec<NotificationType> = [
        recv_frame(&mut rx).await,
        recv_frame(&mut rx).await,
        recv_frame(&mut rx).await,
    ]
    .iter()
    .map(|frame| {
        serde_json::from_str::<NotificationMessage>(frame)
            .unwrap()
            .message_type
    })
    .collect();
    assert_eq!(
        kinds,
        vec![
            NotificationType::EntitlementCreated,
            NotificationType::EntitlementClaimed,
            NotificationType::UserPing,
        ]
    );

    shutdown_tx.send(true).unwrap();
    assert_ok!(session.await.unwrap());
    // 会话结束后连接被关闭
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_session_with_unknown_token_is_closed() {
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let hub = NotificationHub::new(
        bus,
        Arc::new(StaticIdentity {
            token: "valid".into(),
            caller: Caller::new(Uuid::new_v4(), Role::Player),
        }),
    );

    let mut sink = FlakySink {
        written: Vec::new(),
        fail_after: usize::MAX,
        closed: false,
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = hub
        .serve_session("forged", &mut sink, shutdown_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::Forbidden(_)));
    assert!(sink.closed);
    assert!(sink.written.is_empty());
}
