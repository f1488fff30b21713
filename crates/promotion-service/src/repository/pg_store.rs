//! PostgreSQL 权益存储
//!
//! 领取路径依赖两处数据库语义：
//! - `SELECT ... FOR UPDATE OF e` 锁住权益行，同一权益的并发领取串行执行
//! - 余额出账使用 `WHERE balance >= $2` 的条件更新，读改写在一条语句内完成

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::traits::{BalanceOutcome, EntitlementStore, StoreTransaction};
use crate::error::Result;
use crate::models::{
    Account, BalanceChange, Entitlement, EntitlementDetail, Promotion, PromotionKind, Role,
    TransactionDirection,
};

const DETAIL_SELECT: &str = r#"
    SELECT e.id, e.account_id, e.promotion_id, e.starts_at, e.ends_at, e.claimed_at,
           e.created_at, e.updated_at,
           p.title AS promotion_title, p.description AS promotion_description,
           p.amount AS promotion_amount, p.is_active AS promotion_is_active,
           p.kind AS promotion_kind, p.created_at AS promotion_created_at,
           p.updated_at AS promotion_updated_at,
           a.name AS account_name, a.email AS account_email, a.role AS account_role,
           a.balance AS account_balance, a.created_at AS account_created_at,
           a.updated_at AS account_updated_at
    FROM entitlements e
    JOIN promotions p ON p.id = e.promotion_id
    JOIN accounts a ON a.id = e.account_id
"#;

/// 权益联表查询行
#[derive(sqlx::FromRow)]
struct DetailRow {
    id: Uuid,
    account_id: Uuid,
    promotion_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    promotion_title: String,
    promotion_description: String,
    promotion_amount: Decimal,
    promotion_is_active: bool,
    promotion_kind: PromotionKind,
    promotion_created_at: DateTime<Utc>,
    promotion_updated_at: DateTime<Utc>,
    account_name: String,
    account_email: String,
    account_role: Role,
    account_balance: Decimal,
    account_created_at: DateTime<Utc>,
    account_updated_at: DateTime<Utc>,
}

impl From<DetailRow> for EntitlementDetail {
    fn from(row: DetailRow) -> Self {
        Self {
            entitlement: Entitlement {
                id: row.id,
                account_id: row.account_id,
                promotion_id: row.promotion_id,
                starts_at: row.starts_at,
                ends_at: row.ends_at,
                claimed_at: row.claimed_at,
                created_at: row.created_at,
                updated_at: row.updated_at,
            },
            promotion: Promotion {
                id: row.promotion_id,
                title: row.promotion_title,
                description: row.promotion_description,
                amount: row.promotion_amount,
                is_active: row.promotion_is_active,
                kind: row.promotion_kind,
                created_at: row.promotion_created_at,
                updated_at: row.promotion_updated_at,
            },
            account: Account {
                id: row.account_id,
                name: row.account_name,
                email: row.account_email,
                role: row.account_role,
                balance: row.account_balance,
                created_at: row.account_created_at,
                updated_at: row.account_updated_at,
            },
        }
    }
}

/// 权益库表迁移集
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL 权益存储
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_entitlement_with(
        conn: &mut sqlx::PgConnection,
        entitlement: &Entitlement,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (id, account_id, promotion_id, starts_at, ends_at, claimed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entitlement.id)
        .bind(entitlement.account_id)
        .bind(entitlement.promotion_id)
        .bind(entitlement.starts_at)
        .bind(entitlement.ends_at)
        .bind(entitlement.claimed_at)
        .bind(entitlement.created_at)
        .bind(entitlement.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    type Tx = PgStoreTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        let tx = self.pool.begin().await?;
        Ok(PgStoreTransaction { tx })
    }

    async fn promotion_by_id(&self, id: Uuid) -> Result<Option<Promotion>> {
        let promotion = sqlx::query_as::<_, Promotion>(
            r#"
            SELECT id, title, description, amount, is_active, kind, created_at, updated_at
            FROM promotions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(promotion)
    }

    async fn promotion_by_kind(&self, kind: PromotionKind) -> Result<Option<Promotion>> {
        let promotion = sqlx::query_as::<_, Promotion>(
            r#"
            SELECT id, title, description, amount, is_active, kind, created_at, updated_at
            FROM promotions
            WHERE kind = $1
            ORDER BY is_active DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(promotion)
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, name, email, role, balance, created_at, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn entitlement_by_id(&self, id: Uuid) -> Result<Option<EntitlementDetail>> {
        let sql = format!("{DETAIL_SELECT} WHERE e.id = $1");
        let row = sqlx::query_as::<_, DetailRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn entitlements_by_account(&self, account_id: Uuid) -> Result<Vec<EntitlementDetail>> {
        let sql = format!("{DETAIL_SELECT} WHERE e.account_id = $1 ORDER BY e.created_at DESC");
        let rows = sqlx::query_as::<_, DetailRow>(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_entitlement_with(&mut *conn, entitlement).await
    }

    async fn insert_welcome_entitlement(&self, entitlement: &Entitlement) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        Self::insert_entitlement_with(&mut *tx, entitlement).await?;

        // 主键冲突（23505）即重复的欢迎礼包，转换为 Conflict
        sqlx::query(
            r#"
            INSERT INTO welcome_grants (account_id, entitlement_id, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(entitlement.account_id)
        .bind(entitlement.id)
        .bind(entitlement.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_entitlement(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entitlements WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// PostgreSQL 事务句柄
///
/// 包装 sqlx 事务，drop 时由 sqlx 自动回滚
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn entitlement_for_update(&mut self, id: Uuid) -> Result<Option<EntitlementDetail>> {
        let sql = format!("{DETAIL_SELECT} WHERE e.id = $1 FOR UPDATE OF e");
        let row = sqlx::query_as::<_, DetailRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn mark_claimed(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET claimed_at = $2, updated_at = $2
            WHERE id = $1 AND claimed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_balance_change(
        &mut self,
        account_id: Uuid,
        change: BalanceChange,
    ) -> Result<BalanceOutcome> {
        let updated: Option<Decimal> = match change.direction {
            TransactionDirection::Add => {
                sqlx::query_scalar(
                    r#"
                    UPDATE accounts
                    SET balance = balance + $2, updated_at = NOW()
                    WHERE id = $1
                    RETURNING balance
                    "#,
                )
                .bind(account_id)
                .bind(change.amount)
                .fetch_optional(&mut *self.tx)
                .await?
            }
            TransactionDirection::Remove => {
                sqlx::query_scalar(
                    r#"
                    UPDATE accounts
                    SET balance = balance - $2, updated_at = NOW()
                    WHERE id = $1 AND balance >= $2
                    RETURNING balance
                    "#,
                )
                .bind(account_id)
                .bind(change.amount)
                .fetch_optional(&mut *self.tx)
                .await?
            }
        };

        if let Some(balance) = updated {
            return Ok(BalanceOutcome::Applied(balance));
        }

        // 未命中：区分账户不存在与余额不足
        let current: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        debug!(%account_id, ?current, "余额条件更新未命中");
        Ok(match current {
            Some(balance) => BalanceOutcome::Insufficient(balance),
            None => BalanceOutcome::AccountMissing,
        })
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
