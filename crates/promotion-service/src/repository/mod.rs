//! 数据库仓储层
//!
//! - 仓储只负责数据持久化，不包含业务逻辑
//! - 事务控制由调用方（服务层）决定
//! - [`MemoryStore`] 与 [`PgEntitlementStore`] 实现同一组 trait

mod memory_store;
mod pg_store;
mod traits;

pub use memory_store::{MemoryStore, MemoryTransaction};
pub use pg_store::{MIGRATOR, PgEntitlementStore, PgStoreTransaction};
pub use traits::*;
