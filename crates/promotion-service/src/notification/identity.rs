//! 调用方身份解析
//!
//! token 的签发与校验由外部身份服务负责，这里只把 token 映射为 [`Caller`]

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Caller;

/// 身份解析接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// 解析 token，无效或过期时返回 `Forbidden`
    async fn resolve_caller(&self, token: &str) -> Result<Caller>;
}
