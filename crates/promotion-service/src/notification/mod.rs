//! 实时通知
//!
//! 账户通知消息、客户端传输抽象、身份解析以及通知中继

mod fanout;
mod identity;
mod message;
mod transport;

pub use fanout::{NotificationHub, relay};
pub use identity::IdentityResolver;
pub use message::{NotificationMessage, NotificationType};
pub use transport::{ChannelSink, FrameSink};
