use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// 锁存储原语
///
/// 两个操作都必须是原子的；存储本身不可达时返回 `LockStoreUnavailable`，
/// 由调用方决定失败，不做任何降级。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// 键不存在（或已过期）时写入 value 并设置过期时间，返回是否写入成功
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// 仅当键当前的值等于 value 时删除，返回是否删除成功
    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool>;

    /// 后端名称，用于日志与指标标签
    fn backend(&self) -> &'static str;
}
