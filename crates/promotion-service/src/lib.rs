//! 促销权益服务
//!
//! 为会员账户发放、跟踪并结算有时效的金额促销（权益），
//! 并在权益状态变化时向在线客户端实时推送通知。
//!
//! - [`ledger`]：余额账本，余额非负不变量的唯一修改入口
//! - [`service`]：权益引擎，发放 / 领取状态机 / 删除 / 查询
//! - [`notification`]：账户通知频道到客户端会话的中继
//! - [`worker`]：注册事件驱动的欢迎礼包消费者
//! - [`repository`]：存储抽象及 PostgreSQL、内存实现

pub mod error;
pub mod ledger;
pub mod models;
pub mod notification;
pub mod repository;
pub mod service;
pub mod worker;

pub use error::{EntitlementError, ErrorKind, Result};
pub use ledger::BalanceLedger;
pub use service::{ClaimReceipt, EntitlementService};
