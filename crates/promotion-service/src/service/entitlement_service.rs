//! 权益服务
//!
//! 权益的发放、领取、删除与查询。
//!
//! ## 领取流程（单事务）
//!
//! 1. 加锁读取权益快照 -> 2. 已领取检查 -> 3. 促销激活检查
//!    -> 4. 生效检查 -> 5. 过期检查 -> 6. 写入领取时间
//!    -> 7. 同事务内入账 -> 8. 提交
//!    -> 9. 发布领取通知（事务外，失败不影响领取结果）

use std::sync::Arc;

use chrono::{DateTime, Utc};
use loyalty_shared::observability::metrics::{record_claim, record_grant};
use loyalty_shared::pubsub::{EventBus, channels, publish_json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{EntitlementError, Result};
use crate::ledger::BalanceLedger;
use crate::models::{
    BalanceChange, Caller, Entitlement, EntitlementDetail, Promotion, PromotionKind,
    ValidityWindow,
};
use crate::notification::NotificationMessage;
use crate::repository::{EntitlementStore, StoreTransaction};

/// 领取结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub entitlement: Entitlement,
    /// 本次入账金额
    pub amount: Decimal,
    /// 入账后的账户余额
    pub balance: Decimal,
}

/// 权益服务
pub struct EntitlementService<S: EntitlementStore> {
    store: Arc<S>,
    ledger: BalanceLedger<S>,
    bus: Arc<dyn EventBus>,
}

impl<S: EntitlementStore> EntitlementService<S> {
    pub fn new(store: Arc<S>, bus: Arc<dyn EventBus>) -> Self {
        let ledger = BalanceLedger::new(store.clone());
        Self { store, ledger, bus }
    }

    pub fn ledger(&self) -> &BalanceLedger<S> {
        &self.ledger
    }

    /// 发放权益
    ///
    /// `starts_at > ends_at` 时返回 `InvalidWindow`，不写入任何数据
    #[instrument(skip(self), fields(%account_id, %promotion_id))]
    pub async fn grant(
        &self,
        account_id: Uuid,
        promotion_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Entitlement> {
        let window = ValidityWindow::new(starts_at, ends_at).inspect_err(|_| {
            record_grant(PromotionKind::Regular.as_str(), "invalid_window");
        })?;

        let promotion = self
            .store
            .promotion_by_id(promotion_id)
            .await?
            .ok_or_else(|| EntitlementError::PromotionNotFound(promotion_id.to_string()))?;

        self.persist_grant(account_id, promotion, window).await
    }

    /// 发放注册欢迎礼包，有效期为当前时刻起 24 小时
    ///
    /// 同一账户重复发放返回 `Conflict`
    #[instrument(skip(self), fields(%account_id))]
    pub async fn grant_welcome(&self, account_id: Uuid) -> Result<Entitlement> {
        let promotion = self
            .store
            .promotion_by_kind(PromotionKind::WelcomeBonus)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                record_grant(PromotionKind::WelcomeBonus.as_str(), "inactive");
                EntitlementError::PromotionInactive(PromotionKind::WelcomeBonus.to_string())
            })?;

        let window = ValidityWindow::welcome_from(Utc::now());
        self.persist_grant(account_id, promotion, window).await
    }

    async fn persist_grant(
        &self,
        account_id: Uuid,
        promotion: Promotion,
        window: ValidityWindow,
    ) -> Result<Entitlement> {
        let kind = promotion.kind;

        if !promotion.is_active {
            record_grant(kind.as_str(), "inactive");
            return Err(EntitlementError::PromotionInactive(promotion.id.to_string()));
        }

        let account = self
            .store
            .account_by_id(account_id)
            .await?
            .ok_or(EntitlementError::AccountNotFound(account_id))?;

        let entitlement = Entitlement::new(account_id, promotion.id, window);
        let inserted = match kind {
            PromotionKind::WelcomeBonus => self.store.insert_welcome_entitlement(&entitlement).await,
            PromotionKind::Regular => self.store.insert_entitlement(&entitlement).await,
        };
        if let Err(e) = inserted {
            record_grant(kind.as_str(), e.error_code());
            return Err(e);
        }

        record_grant(kind.as_str(), "granted");
        info!(
            entitlement_id = %entitlement.id,
            %account_id,
            promotion_id = %promotion.id,
            kind = %kind,
            starts_at = %entitlement.starts_at,
            ends_at = %entitlement.ends_at,
            "权益发放成功"
        );

        let detail = EntitlementDetail {
            entitlement: entitlement.clone(),
            promotion,
            account,
        };
        match NotificationMessage::entitlement_created(&detail) {
            Ok(message) => self.notify(account_id, &message).await,
            Err(e) => warn!(error = %e, "发放通知序列化失败"),
        }

        Ok(entitlement)
    }

    /// 领取权益
    ///
    /// 读取、检查、写入、入账在同一事务内完成，任何一步失败整体回滚
    #[instrument(skip(self), fields(%entitlement_id))]
    pub async fn claim(&self, entitlement_id: Uuid) -> Result<ClaimReceipt> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let outcome = match self.settle_claim(&mut tx, entitlement_id, now).await {
            Ok(receipt) => tx.commit().await.map(|()| receipt),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "领取事务回滚失败");
                }
                Err(e)
            }
        };

        let receipt = match outcome {
            Ok(receipt) => receipt,
            Err(e) => {
                record_claim(e.error_code());
                debug!(error = %e, "权益领取失败");
                return Err(e);
            }
        };

        record_claim("claimed");
        info!(
            %entitlement_id,
            account_id = %receipt.entitlement.account_id,
            amount = %receipt.amount,
            balance = %receipt.balance,
            "权益领取成功"
        );

        // 事务已提交，通知失败只记录日志
        match NotificationMessage::entitlement_claimed(&receipt) {
            Ok(message) => self.notify(receipt.entitlement.account_id, &message).await,
            Err(e) => warn!(error = %e, "领取通知序列化失败"),
        }

        Ok(receipt)
    }

    async fn settle_claim(
        &self,
        tx: &mut S::Tx,
        entitlement_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimReceipt> {
        let detail = tx
            .entitlement_for_update(entitlement_id)
            .await?
            .ok_or(EntitlementError::EntitlementNotFound(entitlement_id))?;

        detail.check_claimable(now)?;

        if !tx.mark_claimed(entitlement_id, now).await? {
            return Err(EntitlementError::AlreadyClaimed(entitlement_id));
        }

        let amount = detail.promotion.amount;
        let balance = self
            .ledger
            .apply_in_tx(tx, detail.entitlement.account_id, BalanceChange::credit(amount))
            .await?;

        let mut entitlement = detail.entitlement;
        entitlement.claimed_at = Some(now);
        entitlement.updated_at = now;

        Ok(ClaimReceipt {
            entitlement,
            amount,
            balance,
        })
    }

    /// 硬删除权益，无余额和通知副作用
    #[instrument(skip(self), fields(%entitlement_id))]
    pub async fn delete(&self, entitlement_id: Uuid) -> Result<()> {
        if !self.store.delete_entitlement(entitlement_id).await? {
            return Err(EntitlementError::EntitlementNotFound(entitlement_id));
        }
        info!(%entitlement_id, "权益已删除");
        Ok(())
    }

    pub async fn list_for_account(&self, account_id: Uuid) -> Result<Vec<EntitlementDetail>> {
        self.store.entitlements_by_account(account_id).await
    }

    pub async fn get_by_id(&self, entitlement_id: Uuid) -> Result<EntitlementDetail> {
        self.store
            .entitlement_by_id(entitlement_id)
            .await?
            .ok_or(EntitlementError::EntitlementNotFound(entitlement_id))
    }

    // ==================== 带调用方身份的入口 ====================

    /// 以调用方身份领取，只能领取自己名下的权益
    pub async fn claim_as(&self, caller: &Caller, entitlement_id: Uuid) -> Result<ClaimReceipt> {
        let detail = self.get_by_id(entitlement_id).await?;
        if detail.entitlement.account_id != caller.account_id {
            warn!(
                caller = %caller.account_id,
                owner = %detail.entitlement.account_id,
                %entitlement_id,
                "拒绝领取他人权益"
            );
            return Err(EntitlementError::Forbidden(format!(
                "权益 {entitlement_id} 不属于账户 {}",
                caller.account_id
            )));
        }
        self.claim(entitlement_id).await
    }

    /// 以调用方身份发放，需要 Staff 及以上权限
    pub async fn grant_as(
        &self,
        caller: &Caller,
        account_id: Uuid,
        promotion_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Entitlement> {
        Self::require_staff(caller, "发放权益")?;
        self.grant(account_id, promotion_id, starts_at, ends_at).await
    }

    /// 以调用方身份删除，需要 Staff 及以上权限
    pub async fn delete_as(&self, caller: &Caller, entitlement_id: Uuid) -> Result<()> {
        Self::require_staff(caller, "删除权益")?;
        self.delete(entitlement_id).await
    }

    fn require_staff(caller: &Caller, action: &str) -> Result<()> {
        if caller.is_staff() {
            return Ok(());
        }
        Err(EntitlementError::Forbidden(format!(
            "{action}需要 staff 权限: account_id={}, role={:?}",
            caller.account_id, caller.role
        )))
    }

    /// 发布账户通知，失败只记录日志
    async fn notify(&self, account_id: Uuid, message: &NotificationMessage) {
        let channel = channels::notifications(account_id);
        match publish_json(self.bus.as_ref(), &channel, message).await {
            Ok(receivers) => debug!(%channel, receivers, "通知已发布"),
            Err(e) => warn!(%channel, error = %e, "通知发布失败"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, Role};
    use crate::repository::MemoryStore;
    use chrono::Duration;
    use futures::StreamExt;
    use loyalty_shared::pubsub::InMemoryEventBus;
    use rust_decimal_macros::dec;

    struct Fixture {
        service: EntitlementService<MemoryStore>,
        store: Arc<MemoryStore>,
        bus: Arc<InMemoryEventBus>,
        account: Account,
        promotion: Promotion,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let account = Account::new("dave", "dave@example.com", Role::Player);
        let promotion = Promotion::new("Reload", dec!(15), PromotionKind::Regular);
        store.insert_account(account.clone()).await;
        store.insert_promotion(promotion.clone()).await;

        let service = EntitlementService::new(store.clone(), bus.clone());
        Fixture {
            service,
            store,
            bus,
            account,
            promotion,
        }
    }

    #[tokio::test]
    async fn test_grant_publishes_created_event() {
        let f = fixture().await;
        let mut stream = f
            .bus
            .subscribe(&channels::notifications(f.account.id))
            .await
            .unwrap();

        let now = Utc::now();
        let entitlement = f
            .service
            .grant(f.account.id, f.promotion.id, now, now + Duration::hours(1))
            .await
            .unwrap();
        assert!(entitlement.claimed_at.is_none());

        let payload = stream.next().await.unwrap();
        let message: NotificationMessage = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            message.message_type,
            crate::notification::NotificationType::EntitlementCreated
        );
        assert_eq!(message.account_id, f.account.id);
    }

    #[tokio::test]
    async fn test_grant_inactive_promotion() {
        let f = fixture().await;
        f.store.set_promotion_active(f.promotion.id, false).await;

        let now = Utc::now();
        let err = f
            .service
            .grant(f.account.id, f.promotion.id, now, now + Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::PromotionInactive(_)));
        assert!(f.service.list_for_account(f.account.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_grant_unknown_promotion_and_account() {
        let f = fixture().await;
        let now = Utc::now();

        let err = f
            .service
            .grant(f.account.id, Uuid::new_v4(), now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::PromotionNotFound(_)));

        let err = f
            .service
            .grant(Uuid::new_v4(), f.promotion.id, now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_grant_welcome_without_active_promotion() {
        let f = fixture().await;
        let err = f.service.grant_welcome(f.account.id).await.unwrap_err();
        assert!(matches!(err, EntitlementError::PromotionInactive(_)));
    }

    #[tokio::test]
    async fn test_claim_unknown_entitlement() {
        let f = fixture().await;
        let err = f.service.claim(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_claim_as_requires_owner() {
        let f = fixture().await;
        let now = Utc::now();
        let entitlement = f
            .service
            .grant(
                f.account.id,
                f.promotion.id,
                now - Duration::hours(1),
                now + Duration::hours(1),
            )
            .await
            .unwrap();

        let admin = Caller::new(Uuid::new_v4(), Role::Admin);
        let err = f.service.claim_as(&admin, entitlement.id).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Forbidden(_)));
        assert_eq!(f.store.balance(f.account.id).await, Some(Decimal::ZERO));

        let owner = Caller::new(f.account.id, Role::Player);
        let receipt = f.service.claim_as(&owner, entitlement.id).await.unwrap();
        assert_eq!(receipt.balance, dec!(15));
    }

    #[tokio::test]
    async fn test_staff_only_operations() {
        let f = fixture().await;
        let now = Utc::now();
        let player = Caller::new(f.account.id, Role::Player);
        let staff = Caller::new(Uuid::new_v4(), Role::Staff);

        let err = f
            .service
            .grant_as(&player, f.account.id, f.promotion.id, now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Forbidden(_)));

        let entitlement = f
            .service
            .grant_as(&staff, f.account.id, f.promotion.id, now, now)
            .await
            .unwrap();

        let err = f.service.delete_as(&player, entitlement.id).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Forbidden(_)));

        f.service.delete_as(&staff, entitlement.id).await.unwrap();
        let err = f.service.delete_as(&staff, entitlement.id).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
