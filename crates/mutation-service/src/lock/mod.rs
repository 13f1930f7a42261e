//! 分布式锁模块
//!
//! 在关系库行锁之外提供跨实例的互斥：同一资源在任意时刻最多被一个持有者锁定。
//!
//! ## 组成
//!
//! - `LockStore`：原子的 set-if-absent 与 compare-and-delete 两个原语
//! - `RedisLockStore` / `PgLockStore` / `MemoryLockStore`：三种存储后端，由配置显式选择
//! - `LockCoordinator`：令牌生成、有界重试、按全序批量加锁
//! - `LockGuard` / `LockSet`：持有凭证，显式释放；未释放即被丢弃时在后台补偿释放
//!
//! ## 使用示例
//!
//! ```ignore
//! let coordinator = LockCoordinator::new(Arc::new(MemoryLockStore::new()), LockConfig::default());
//!
//! let balance = coordinator
//!     .with_lock(&ResourceKey::account(42), None, || async { do_critical_work().await })
//!     .await?;
//! ```

mod coordinator;
mod memory_store;
mod pg_store;
mod redis_store;
mod store;

pub use coordinator::{LockConfig, LockCoordinator, LockGuard, LockSet};
pub use memory_store::MemoryLockStore;
pub use pg_store::PgLockStore;
pub use redis_store::RedisLockStore;
pub use store::LockStore;

#[cfg(test)]
pub use store::MockLockStore;
