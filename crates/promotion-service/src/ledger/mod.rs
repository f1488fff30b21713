//! 余额账本
//!
//! 账户余额的唯一修改入口，维护"余额始终非负"不变量。
//! 读改写的原子性由存储层的条件更新保证，账本本身不在内存中做检查后写入。
//! 账本不发送通知，由调用方决定是否通知。

use std::sync::Arc;

use loyalty_shared::observability::metrics::record_balance_transaction;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{EntitlementError, Result};
use crate::models::{BalanceChange, TransactionDirection};
use crate::repository::{BalanceOutcome, EntitlementStore, StoreTransaction};

/// 余额账本
pub struct BalanceLedger<S: EntitlementStore> {
    store: Arc<S>,
}

impl<S: EntitlementStore> Clone for BalanceLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: EntitlementStore> BalanceLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// 在独立事务中变动余额，返回新余额
    #[instrument(skip(self, direction), fields(direction = direction.as_str()))]
    pub async fn apply_transaction(
        &self,
        account_id: Uuid,
        amount: Decimal,
        direction: TransactionDirection,
    ) -> Result<Decimal> {
        let mut tx = self.store.begin().await?;
        // 出错时 tx 被 drop，自动回滚
        let balance = self
            .apply_in_tx(&mut tx, account_id, BalanceChange { amount, direction })
            .await?;
        tx.commit().await?;
        Ok(balance)
    }

    /// 在调用方事务中变动余额
    pub async fn apply_in_tx(
        &self,
        tx: &mut S::Tx,
        account_id: Uuid,
        change: BalanceChange,
    ) -> Result<Decimal> {
        let direction = change.direction.as_str();

        if change.amount < Decimal::ZERO {
            record_balance_transaction(direction, "invalid");
            return Err(EntitlementError::Validation(format!(
                "金额不能为负数: {}",
                change.amount
            )));
        }

        match tx.apply_balance_change(account_id, change).await? {
            BalanceOutcome::Applied(balance) => {
                record_balance_transaction(direction, "applied");
                info!(
                    %account_id,
                    amount = %change.amount,
                    direction,
                    balance = %balance,
                    "余额变动成功"
                );
                Ok(balance)
            }
            BalanceOutcome::Insufficient(available) => {
                record_balance_transaction(direction, "insufficient");
                warn!(
                    %account_id,
                    required = %change.amount,
                    available = %available,
                    "余额不足"
                );
                Err(EntitlementError::InsufficientBalance {
                    required: change.amount,
                    available,
                })
            }
            BalanceOutcome::AccountMissing => {
                record_balance_transaction(direction, "account_missing");
                Err(EntitlementError::AccountNotFound(account_id))
            }
        }
    }
}
