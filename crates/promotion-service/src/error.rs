//! 权益服务错误类型
//!
//! 定义服务层的业务错误和系统错误。业务错误按 [`ErrorKind`] 归类，
//! 由上层（HTTP 层）映射为用户可见的响应，本层不做重试。

use chrono::{DateTime, Utc};
use loyalty_shared::error::LoyaltyError;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// PostgreSQL 唯一约束冲突
const PG_UNIQUE_VIOLATION: &str = "23505";

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidWindow,
    PromotionInactive,
    NotStarted,
    Expired,
    AlreadyClaimed,
    InsufficientBalance,
    NotFound,
    Conflict,
    Validation,
    Forbidden,
    Internal,
}

/// 权益服务错误类型
#[derive(Debug, Error)]
pub enum EntitlementError {
    // === 发放相关错误 ===
    #[error("有效期窗口非法: start={start} 晚于 end={end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("促销未激活: {0}")]
    PromotionInactive(String),

    // === 领取相关错误 ===
    #[error("权益尚未生效: starts_at={starts_at}")]
    NotStarted { starts_at: DateTime<Utc> },

    #[error("权益已过期: ends_at={ends_at}")]
    Expired { ends_at: DateTime<Utc> },

    #[error("权益已被领取: {0}")]
    AlreadyClaimed(Uuid),

    // === 余额相关错误 ===
    #[error("余额不足: 需要 {required}, 可用 {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    // === 不存在 ===
    #[error("权益不存在: {0}")]
    EntitlementNotFound(Uuid),

    #[error("促销不存在: {0}")]
    PromotionNotFound(String),

    #[error("账户不存在: {0}")]
    AccountNotFound(Uuid),

    // === 调用方错误 ===
    #[error("数据冲突: {0}")]
    Conflict(String),

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("无权操作: {0}")]
    Forbidden(String),

    // === 系统错误 ===
    #[error("数据库错误: {0}")]
    Database(#[source] sqlx::Error),

    #[error("事件总线错误: {0}")]
    EventBus(String),

    #[error("传输层错误: {0}")]
    Transport(String),

    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 权益服务 Result 类型别名
pub type Result<T> = std::result::Result<T, EntitlementError>;

impl From<sqlx::Error> for EntitlementError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION) {
                let detail = db_err
                    .constraint()
                    .map(str::to_string)
                    .unwrap_or_else(|| db_err.message().to_string());
                return Self::Conflict(detail);
            }
        }
        Self::Database(err)
    }
}

impl From<LoyaltyError> for EntitlementError {
    fn from(err: LoyaltyError) -> Self {
        match err {
            LoyaltyError::Database(e) => e.into(),
            LoyaltyError::Redis(e) => Self::EventBus(e.to_string()),
            LoyaltyError::EventBus(msg) => Self::EventBus(msg),
            LoyaltyError::Serialization(e) => Self::Serialization(e),
            LoyaltyError::Validation(msg) => Self::Validation(msg),
            err @ LoyaltyError::Migration(_) => Self::Internal(err.to_string()),
            LoyaltyError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl EntitlementError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidWindow { .. } => ErrorKind::InvalidWindow,
            Self::PromotionInactive(_) => ErrorKind::PromotionInactive,
            Self::NotStarted { .. } => ErrorKind::NotStarted,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::AlreadyClaimed(_) => ErrorKind::AlreadyClaimed,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::EntitlementNotFound(_) | Self::PromotionNotFound(_) | Self::AccountNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Database(_)
            | Self::EventBus(_)
            | Self::Transport(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// 检查是否为业务错误（非系统错误）
    pub fn is_business_error(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }

    /// 获取错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidWindow { .. } => "INVALID_WINDOW",
            Self::PromotionInactive(_) => "PROMOTION_INACTIVE",
            Self::NotStarted { .. } => "NOT_STARTED",
            Self::Expired { .. } => "EXPIRED",
            Self::AlreadyClaimed(_) => "ALREADY_CLAIMED",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::EntitlementNotFound(_) => "ENTITLEMENT_NOT_FOUND",
            Self::PromotionNotFound(_) => "PROMOTION_NOT_FOUND",
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Database(_) => "DATABASE_ERROR",
            Self::EventBus(_) => "EVENT_BUS_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds() {
        let id = Uuid::new_v4();
        assert!(EntitlementError::EntitlementNotFound(id).is_not_found());
        assert!(EntitlementError::AccountNotFound(id).is_not_found());
        assert!(EntitlementError::PromotionNotFound("welcome_bonus".into()).is_not_found());
        assert!(!EntitlementError::AlreadyClaimed(id).is_not_found());
    }

    #[test]
    fn test_is_business_error() {
        assert!(EntitlementError::AlreadyClaimed(Uuid::new_v4()).is_business_error());
        assert!(EntitlementError::Conflict("welcome_grants_pkey".into()).is_business_error());
        assert!(!EntitlementError::EventBus("closed".into()).is_business_error());
        assert!(!EntitlementError::Database(sqlx::Error::RowNotFound).is_business_error());
    }

    #[test]
    fn test_error_code() {
        let now = Utc::now();
        assert_eq!(
            EntitlementError::InvalidWindow { start: now, end: now }.error_code(),
            "INVALID_WINDOW"
        );
        assert_eq!(
            EntitlementError::Expired { ends_at: now }.error_code(),
            "EXPIRED"
        );
    }

    #[test]
    fn test_from_shared_error() {
        let err: EntitlementError = LoyaltyError::EventBus("disconnected".into()).into();
        assert!(matches!(err, EntitlementError::EventBus(_)));

        let err: EntitlementError = LoyaltyError::Validation("bad".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err: EntitlementError = LoyaltyError::Database(sqlx::Error::RowNotFound).into();
        assert!(matches!(err, EntitlementError::Database(_)));

        let err: EntitlementError = LoyaltyError::Internal("boom".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), EntitlementError::Internal("boom".into()).to_string());

        let err: EntitlementError =
            LoyaltyError::Migration(sqlx::migrate::MigrateError::VersionMissing(3)).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("数据库迁移失败"));
    }
}
