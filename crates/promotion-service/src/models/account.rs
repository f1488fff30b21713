//! 账户与调用方身份

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{Role, TransactionDirection};

/// 会员账户
///
/// 余额始终非负，只能通过余额账本的唯一入口修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(name: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            role,
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }
}

/// 余额变动意图
///
/// 临时值对象，本身不落库，只有变动后的余额会被持久化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceChange {
    pub amount: Decimal,
    pub direction: TransactionDirection,
}

impl BalanceChange {
    pub fn credit(amount: Decimal) -> Self {
        Self {
            amount,
            direction: TransactionDirection::Add,
        }
    }

    pub fn debit(amount: Decimal) -> Self {
        Self {
            amount,
            direction: TransactionDirection::Remove,
        }
    }

    /// 对给定余额应用变动，出账导致负数时返回 None
    pub fn apply_to(&self, balance: Decimal) -> Option<Decimal> {
        match self.direction {
            TransactionDirection::Add => Some(balance + self.amount),
            TransactionDirection::Remove => {
                let next = balance - self.amount;
                (next >= Decimal::ZERO).then_some(next)
            }
        }
    }
}

/// 请求级调用方上下文
///
/// 由身份服务解析 token 得到，显式沿调用链传递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub account_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn new(account_id: Uuid, role: Role) -> Self {
        Self { account_id, role }
    }

    pub fn is_staff(&self) -> bool {
        self.role.has_privilege(Role::Staff)
    }
}
