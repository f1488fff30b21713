//! 数据模型
//!
//! 账户、促销、权益及相关枚举

pub mod account;
pub mod entitlement;
pub mod enums;
pub mod promotion;

pub use account::{Account, BalanceChange, Caller};
pub use entitlement::{Entitlement, EntitlementDetail, ValidityWindow, WELCOME_WINDOW_HOURS};
pub use enums::{EntitlementStatus, PromotionKind, Role, TransactionDirection};
pub use promotion::Promotion;
