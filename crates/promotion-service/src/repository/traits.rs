//! 仓储 Trait 定义
//!
//! 权益引擎只依赖这里的抽象，PostgreSQL 与内存实现可互换

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Account, BalanceChange, Entitlement, EntitlementDetail, Promotion, PromotionKind};

/// 余额变动结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOutcome {
    /// 已生效，携带变动后的余额
    Applied(Decimal),
    /// 余额不足，未做任何修改，携带当前余额
    Insufficient(Decimal),
    /// 账户不存在
    AccountMissing,
}

/// 事务作用域内的存储句柄
///
/// 未提交即 drop 视为回滚，调用方取消（超时、任务中止）由此传播到存储层
#[async_trait]
pub trait StoreTransaction: Send {
    /// 读取权益快照并加行锁，同一权益上的并发事务在此串行化
    async fn entitlement_for_update(&mut self, id: Uuid) -> Result<Option<EntitlementDetail>>;

    /// 标记领取时间，仅当尚未领取时生效，返回是否写入
    async fn mark_claimed(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// 单条条件更新完成余额读改写，出账不会把余额变成负数
    async fn apply_balance_change(
        &mut self,
        account_id: Uuid,
        change: BalanceChange,
    ) -> Result<BalanceOutcome>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// 权益存储接口
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    type Tx: StoreTransaction;

    async fn begin(&self) -> Result<Self::Tx>;

    // 促销目录（只读）
    async fn promotion_by_id(&self, id: Uuid) -> Result<Option<Promotion>>;
    /// 按类型查找，激活的优先，其次最新创建的
    async fn promotion_by_kind(&self, kind: PromotionKind) -> Result<Option<Promotion>>;

    // 账户
    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>>;

    // 权益
    async fn entitlement_by_id(&self, id: Uuid) -> Result<Option<EntitlementDetail>>;
    async fn entitlements_by_account(&self, account_id: Uuid) -> Result<Vec<EntitlementDetail>>;
    async fn insert_entitlement(&self, entitlement: &Entitlement) -> Result<()>;
    /// 写入欢迎礼包权益，同一账户第二次写入返回 `Conflict`
    async fn insert_welcome_entitlement(&self, entitlement: &Entitlement) -> Result<()>;
    /// 硬删除，返回是否确有记录被删除
    async fn delete_entitlement(&self, id: Uuid) -> Result<bool>;
}
