//! 内存权益存储
//!
//! 进程内实现，用于本地运行和测试。事务在整个生命周期内持有存储锁，
//! 在副本上修改，提交时整体替换；drop 未提交的事务即丢弃副本。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::traits::{BalanceOutcome, EntitlementStore, StoreTransaction};
use crate::error::{EntitlementError, Result};
use crate::models::{
    Account, BalanceChange, Entitlement, EntitlementDetail, Promotion, PromotionKind,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    promotions: HashMap<Uuid, Promotion>,
    entitlements: HashMap<Uuid, Entitlement>,
    /// 已领过欢迎礼包的账户，删除权益后仍保留
    welcome_grants: HashSet<Uuid>,
}

impl MemoryState {
    /// 联表快照，促销或账户缺失时视为不存在
    fn detail(&self, entitlement: &Entitlement) -> Option<EntitlementDetail> {
        let promotion = self.promotions.get(&entitlement.promotion_id)?;
        let account = self.accounts.get(&entitlement.account_id)?;
        Some(EntitlementDetail {
            entitlement: entitlement.clone(),
            promotion: promotion.clone(),
            account: account.clone(),
        })
    }

    fn insert_entitlement(&mut self, entitlement: &Entitlement) -> Result<()> {
        if !self.accounts.contains_key(&entitlement.account_id) {
            return Err(EntitlementError::AccountNotFound(entitlement.account_id));
        }
        if !self.promotions.contains_key(&entitlement.promotion_id) {
            return Err(EntitlementError::PromotionNotFound(
                entitlement.promotion_id.to_string(),
            ));
        }
        if self.entitlements.contains_key(&entitlement.id) {
            return Err(EntitlementError::Conflict(format!(
                "entitlements_pkey: {}",
                entitlement.id
            )));
        }
        self.entitlements
            .insert(entitlement.id, entitlement.clone());
        Ok(())
    }
}

/// 内存权益存储
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: Account) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    pub async fn insert_promotion(&self, promotion: Promotion) {
        self.state
            .lock()
            .await
            .promotions
            .insert(promotion.id, promotion);
    }

    /// 修改促销激活状态，促销不存在时返回 false
    pub async fn set_promotion_active(&self, id: Uuid, active: bool) -> bool {
        let mut state = self.state.lock().await;
        match state.promotions.get_mut(&id) {
            Some(promotion) => {
                promotion.is_active = active;
                promotion.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn balance(&self, account_id: Uuid) -> Option<Decimal> {
        self.state
            .lock()
            .await
            .accounts
            .get(&account_id)
            .map(|a| a.balance)
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTransaction { guard, working })
    }

    async fn promotion_by_id(&self, id: Uuid) -> Result<Option<Promotion>> {
        Ok(self.state.lock().await.promotions.get(&id).cloned())
    }

    async fn promotion_by_kind(&self, kind: PromotionKind) -> Result<Option<Promotion>> {
        let state = self.state.lock().await;
        let found = state
            .promotions
            .values()
            .filter(|p| p.kind == kind)
            .max_by_key(|p| (p.is_active, p.created_at))
            .cloned();
        Ok(found)
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn entitlement_by_id(&self, id: Uuid) -> Result<Option<EntitlementDetail>> {
        let state = self.state.lock().await;
        Ok(state.entitlements.get(&id).and_then(|e| state.detail(e)))
    }

    async fn entitlements_by_account(&self, account_id: Uuid) -> Result<Vec<EntitlementDetail>> {
        let state = self.state.lock().await;
        let mut details: Vec<EntitlementDetail> = state
            .entitlements
            .values()
            .filter(|e| e.account_id == account_id)
            .filter_map(|e| state.detail(e))
            .collect();
        details.sort_by(|a, b| b.entitlement.created_at.cmp(&a.entitlement.created_at));
        Ok(details)
    }

    async fn insert_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        self.state.lock().await.insert_entitlement(entitlement)
    }

    async fn insert_welcome_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.welcome_grants.contains(&entitlement.account_id) {
            return Err(EntitlementError::Conflict(format!(
                "welcome_grants_pkey: {}",
                entitlement.account_id
            )));
        }
        state.insert_entitlement(entitlement)?;
        state.welcome_grants.insert(entitlement.account_id);
        Ok(())
    }

    async fn delete_entitlement(&self, id: Uuid) -> Result<bool> {
        Ok(self.state.lock().await.entitlements.remove(&id).is_some())
    }
}

/// 内存事务句柄
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn entitlement_for_update(&mut self, id: Uuid) -> Result<Option<EntitlementDetail>> {
        Ok(self
            .working
            .entitlements
            .get(&id)
            .and_then(|e| self.working.detail(e)))
    }

    async fn mark_claimed(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        match self.working.entitlements.get_mut(&id) {
            Some(entitlement) if entitlement.claimed_at.is_none() => {
                entitlement.claimed_at = Some(at);
                entitlement.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_balance_change(
        &mut self,
        account_id: Uuid,
        change: BalanceChange,
    ) -> Result<BalanceOutcome> {
        let Some(account) = self.working.accounts.get_mut(&account_id) else {
            return Ok(BalanceOutcome::AccountMissing);
        };
        match change.apply_to(account.balance) {
            Some(next) => {
                account.balance = next;
                account.updated_at = Utc::now();
                Ok(BalanceOutcome::Applied(next))
            }
            None => Ok(BalanceOutcome::Insufficient(account.balance)),
        }
    }

    async fn commit(self) -> Result<()> {
        let Self { mut guard, working } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, ValidityWindow};
    use rust_decimal_macros::dec;

    async fn seeded() -> (MemoryStore, Account, Promotion) {
        let store = MemoryStore::new();
        let account = Account::new("bob", "bob@example.com", Role::Player).with_balance(dec!(10));
        let promotion = Promotion::new("Reload", dec!(5), PromotionKind::Regular);
        store.insert_account(account.clone()).await;
        store.insert_promotion(promotion.clone()).await;
        (store, account, promotion)
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_discarded() {
        let (store, account, _) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let outcome = tx
            .apply_balance_change(account.id, BalanceChange::credit(dec!(7)))
            .await
            .unwrap();
        assert_eq!(outcome, BalanceOutcome::Applied(dec!(17)));
        drop(tx);

        assert_eq!(store.balance(account.id).await, Some(dec!(10)));
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let (store, account, _) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let outcome = tx
            .apply_balance_change(account.id, BalanceChange::debit(dec!(11)))
            .await
            .unwrap();
        assert_eq!(outcome, BalanceOutcome::Insufficient(dec!(10)));
        tx.apply_balance_change(account.id, BalanceChange::debit(dec!(3)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.balance(account.id).await, Some(dec!(7)));
    }

    #[tokio::test]
    async fn test_mark_claimed_only_once() {
        let (store, account, promotion) = seeded().await;
        let entitlement = Entitlement::new(
            account.id,
            promotion.id,
            ValidityWindow::welcome_from(Utc::now()),
        );
        store.insert_entitlement(&entitlement).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.mark_claimed(entitlement.id, Utc::now()).await.unwrap());
        assert!(!tx.mark_claimed(entitlement.id, Utc::now()).await.unwrap());
        tx.commit().await.unwrap();

        let detail = store.entitlement_by_id(entitlement.id).await.unwrap().unwrap();
        assert!(detail.entitlement.is_claimed());
    }

    #[tokio::test]
    async fn test_welcome_grant_unique_per_account() {
        let (store, account, promotion) = seeded().await;
        let window = ValidityWindow::welcome_from(Utc::now());

        store
            .insert_welcome_entitlement(&Entitlement::new(account.id, promotion.id, window))
            .await
            .unwrap();
        let err = store
            .insert_welcome_entitlement(&Entitlement::new(account.id, promotion.id, window))
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));
        assert_eq!(store.entitlements_by_account(account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_by_kind_prefers_active() {
        let store = MemoryStore::new();
        let active = Promotion::new("Welcome v2", dec!(20), PromotionKind::WelcomeBonus);
        let retired = Promotion::new("Welcome v1", dec!(10), PromotionKind::WelcomeBonus).inactive();
        store.insert_promotion(active.clone()).await;
        store.insert_promotion(retired).await;

        let found = store
            .promotion_by_kind(PromotionKind::WelcomeBonus)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, active.id);
        assert!(store.promotion_by_kind(PromotionKind::Regular).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_missing() {
        let (store, account, promotion) = seeded().await;
        let entitlement = Entitlement::new(
            account.id,
            promotion.id,
            ValidityWindow::welcome_from(Utc::now()),
        );
        store.insert_entitlement(&entitlement).await.unwrap();

        assert!(store.delete_entitlement(entitlement.id).await.unwrap());
        assert!(!store.delete_entitlement(entitlement.id).await.unwrap());
    }
}
