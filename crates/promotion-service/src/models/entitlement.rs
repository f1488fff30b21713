//! 权益模型
//!
//! 一条权益 = 把一个促销发放给一个账户，带有效期窗口和领取状态

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::Account;
use super::enums::EntitlementStatus;
use super::promotion::Promotion;
use crate::error::{EntitlementError, Result};

/// 欢迎礼包有效期
pub const WELCOME_WINDOW_HOURS: i64 = 24;

/// 有效期窗口，左闭右开 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ValidityWindow {
    /// 构造窗口，`start > end` 时返回 `InvalidWindow`，不做任何修正
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(EntitlementError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// 从给定时刻起 24 小时的欢迎礼包窗口
    pub fn welcome_from(now: DateTime<Utc>) -> Self {
        Self {
            start: now,
            end: now + Duration::hours(WELCOME_WINDOW_HOURS),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// 权益记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entitlement {
    pub id: Uuid,
    pub account_id: Uuid,
    pub promotion_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// 领取时间，为空表示待领取
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn new(account_id: Uuid, promotion_id: Uuid, window: ValidityWindow) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            account_id,
            promotion_id,
            starts_at: window.start(),
            ends_at: window.end(),
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> EntitlementStatus {
        if self.claimed_at.is_some() {
            EntitlementStatus::Claimed
        } else {
            EntitlementStatus::Pending
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }

    pub fn window(&self) -> ValidityWindow {
        ValidityWindow {
            start: self.starts_at,
            end: self.ends_at,
        }
    }
}

/// 领取决策所需的快照：权益 + 促销 + 账户
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementDetail {
    pub entitlement: Entitlement,
    pub promotion: Promotion,
    pub account: Account,
}

impl EntitlementDetail {
    /// 领取资格检查
    ///
    /// 顺序固定：已领取 → 促销未激活 → 未开始 → 已过期
    pub fn check_claimable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.entitlement.is_claimed() {
            return Err(EntitlementError::AlreadyClaimed(self.entitlement.id));
        }
        if !self.promotion.is_active {
            return Err(EntitlementError::PromotionInactive(self.promotion.id.to_string()));
        }
        if now < self.entitlement.starts_at {
            return Err(EntitlementError::NotStarted {
                starts_at: self.entitlement.starts_at,
            });
        }
        if now >= self.entitlement.ends_at {
            return Err(EntitlementError::Expired {
                ends_at: self.entitlement.ends_at,
            });
        }
        Ok(())
    }
}
