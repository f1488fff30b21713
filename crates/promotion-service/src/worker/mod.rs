//! 后台任务

mod welcome_grant;

pub use welcome_grant::{WelcomeGrantConsumer, publish_registration};
