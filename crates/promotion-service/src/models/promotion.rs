//! 促销目录模型
//!
//! 促销由外部目录维护，本服务只读

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::PromotionKind;

/// 促销定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Promotion {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// 领取时入账的固定金额
    pub amount: Decimal,
    pub is_active: bool,
    pub kind: PromotionKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Promotion {
    pub fn new(title: impl Into<String>, amount: Decimal, kind: PromotionKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            amount,
            is_active: true,
            kind,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}
