//! 账户通知消息
//!
//! 发布在 `notifications:{account_id}` 频道上的 JSON 负载，
//! 中继层原样转发给客户端

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::EntitlementDetail;
use crate::service::ClaimReceipt;

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    EntitlementCreated,
    EntitlementClaimed,
    /// 客户端心跳回显
    UserPing,
}

/// 通知消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub message_type: NotificationType,
    pub account_id: Uuid,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NotificationMessage {
    fn new(message_type: NotificationType, account_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            message_type,
            account_id,
            sent_at: Utc::now(),
            data,
        }
    }

    pub fn entitlement_created(detail: &EntitlementDetail) -> serde_json::Result<Self> {
        Ok(Self::new(
            NotificationType::EntitlementCreated,
            detail.entitlement.account_id,
            serde_json::to_value(detail)?,
        ))
    }

    pub fn entitlement_claimed(receipt: &ClaimReceipt) -> serde_json::Result<Self> {
        Ok(Self::new(
            NotificationType::EntitlementClaimed,
            receipt.entitlement.account_id,
            serde_json::to_value(receipt)?,
        ))
    }

    pub fn user_ping(account_id: Uuid) -> Self {
        Self::new(NotificationType::UserPing, account_id, serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let account_id = Uuid::new_v4();
        let message = NotificationMessage::user_ping(account_id);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["message_type"], "user_ping");
        assert_eq!(value["account_id"], account_id.to_string());
        assert!(value["sent_at"].is_string());

        let parsed: NotificationMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, message);
    }
}
