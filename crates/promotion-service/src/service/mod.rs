//! 业务服务层

mod entitlement_service;

pub use entitlement_service::{ClaimReceipt, EntitlementService};
