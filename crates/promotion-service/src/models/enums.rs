//! 枚举类型定义
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化

use serde::{Deserialize, Serialize};

/// 促销类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum PromotionKind {
    /// 常规促销 - 由运营手动发放
    #[default]
    Regular,
    /// 注册欢迎礼包 - 注册事件触发自动发放，同一时间只应有一个处于激活状态
    WelcomeBonus,
}

impl PromotionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::WelcomeBonus => "welcome_bonus",
        }
    }
}

impl std::fmt::Display for PromotionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 账户角色
///
/// 数值越小权限越高，`Ord` 按权限从高到低排列
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum Role {
    Admin = 0,
    Staff = 1,
    #[default]
    Player = 2,
}

impl Role {
    /// 是否至少具备 `required` 所要求的权限
    pub fn has_privilege(self, required: Role) -> bool {
        self <= required
    }
}

/// 余额变动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionDirection {
    /// 入账（credit）
    Add,
    /// 出账（debit）
    Remove,
}

impl TransactionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// 权益状态
///
/// 不落库，由 `claimed_at` 是否为空推导
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementStatus {
    /// 待领取（初始状态）
    Pending,
    /// 已领取（终态）
    Claimed,
}
