//! 锁协调器
//!
//! 负责令牌生成、有界重试与多资源按全序加锁，锁的原子性由 `LockStore` 保证。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use playhub_shared::config::ConcurrencyConfig;
use playhub_shared::observability::metrics::names;
use rand::Rng;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::store::LockStore;
use crate::error::{MutationError, Result};
use crate::models::ResourceKey;

/// 锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 默认锁超时时间
    pub default_ttl: Duration,
    /// 获取锁的最大尝试次数，1 表示快速失败
    pub retry_count: u32,
    /// 重试间隔（实际等待会叠加随机抖动）
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl From<&ConcurrencyConfig> for LockConfig {
    fn from(config: &ConcurrencyConfig) -> Self {
        Self {
            default_ttl: config.lock_ttl(),
            retry_count: config.lock_retry_count,
            retry_delay: config.lock_retry_delay(),
        }
    }
}

/// 分布式锁协调器
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    /// 实例唯一标识，用于区分不同服务实例持有的锁
    instance_id: String,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// 尝试获取锁，不重试
    ///
    /// 资源已被占用时立即返回 `LockBusy`。
    #[instrument(skip(self), fields(backend = self.store.backend()))]
    pub async fn try_acquire(&self, key: &ResourceKey, ttl: Option<Duration>) -> Result<LockGuard> {
        let ttl = self.resolve_ttl(ttl)?;
        match self.attempt(key, ttl).await? {
            Some(guard) => Ok(guard),
            None => {
                counter!(names::LOCK_ACQUIRE_TOTAL, "outcome" => "busy").increment(1);
                Err(MutationError::LockBusy {
                    resource: key.to_string(),
                })
            }
        }
    }

    /// 获取锁
    ///
    /// 最多尝试 `retry_count` 次，每次间隔 `retry_delay` 加随机抖动；
    /// 仍未获取到时返回 `LockBusy`。锁存储故障不重试，直接返回。
    #[instrument(skip(self), fields(backend = self.store.backend()))]
    pub async fn acquire(&self, key: &ResourceKey, ttl: Option<Duration>) -> Result<LockGuard> {
        let ttl = self.resolve_ttl(ttl)?;
        let attempts = self.config.retry_count.max(1);

        for attempt in 0..attempts {
            if let Some(guard) = self.attempt(key, ttl).await? {
                if attempt > 0 {
                    debug!(resource = %key, attempt, "Lock acquired after retry");
                }
                return Ok(guard);
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff()).await;
            }
        }

        counter!(names::LOCK_ACQUIRE_TOTAL, "outcome" => "busy").increment(1);
        debug!(resource = %key, attempts, "Lock still held by another owner, giving up");
        Err(MutationError::LockBusy {
            resource: key.to_string(),
        })
    }

    /// 按全序获取多把锁
    ///
    /// 键先排序去重再逐个获取，保证任意两个调用方的加锁顺序一致；
    /// 中途失败时释放已持有的锁并返回错误。
    #[instrument(skip(self, keys), fields(count = keys.len()))]
    pub async fn acquire_all(&self, keys: &[ResourceKey], ttl: Option<Duration>) -> Result<LockSet> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in &ordered {
            match self.acquire(key, ttl).await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    if let Err(release_err) = (LockSet { guards }).release().await {
                        warn!(error = %release_err, "释放已持有的锁失败，等待 TTL 过期");
                    }
                    return Err(err);
                }
            }
        }

        Ok(LockSet { guards })
    }

    /// 在锁保护下执行操作
    ///
    /// 无论操作成功、失败，锁都会通过 compare-and-delete 释放；
    /// 释放失败只记录日志，不改变操作本身的结果。
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &ResourceKey,
        ttl: Option<Duration>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key, ttl).await?;
        let result = operation().await;

        if let Err(err) = guard.release().await {
            warn!(resource = %key, error = %err, "释放锁失败，等待 TTL 过期");
        }

        result
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Result<Duration> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.as_millis() == 0 {
            return Err(MutationError::Validation(
                "lock ttl must be at least 1ms".to_string(),
            ));
        }
        Ok(ttl)
    }

    async fn attempt(&self, key: &ResourceKey, ttl: Duration) -> Result<Option<LockGuard>> {
        // 令牌格式: instance_id:uuid
        let token = format!("{}:{}", self.instance_id, Uuid::new_v4());
        let lock_key = key.lock_key();

        let acquired = match self.store.set_if_absent(&lock_key, &token, ttl).await {
            Ok(acquired) => acquired,
            Err(err) => {
                counter!(names::LOCK_ACQUIRE_TOTAL, "outcome" => "error").increment(1);
                warn!(resource = %key, backend = self.store.backend(), error = %err, "锁存储不可用");
                return Err(err);
            }
        };

        if !acquired {
            return Ok(None);
        }

        counter!(names::LOCK_ACQUIRE_TOTAL, "outcome" => "acquired").increment(1);
        debug!(resource = %key, token = %token, "Lock acquired");

        Ok(Some(LockGuard {
            resource: *key,
            lock_key,
            token,
            ttl,
            acquired_at: Instant::now(),
            store: self.store.clone(),
            released: false,
        }))
    }

    fn backoff(&self) -> Duration {
        let base = self.config.retry_delay;
        let jitter_ms = (base.as_millis() as u64 / 2).max(1);
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// 锁守卫
///
/// 推荐使用 `release()` 显式释放。被丢弃而未释放时（取消、超时），
/// 会在当前 tokio 运行时上异步补偿释放；没有运行时则依赖 TTL 过期。
pub struct LockGuard {
    resource: ResourceKey,
    lock_key: String,
    token: String,
    ttl: Duration,
    acquired_at: Instant,
    store: Arc<dyn LockStore>,
    /// 标记锁是否已被释放，避免重复释放
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 显式释放锁
    ///
    /// 返回释放时锁是否仍归本持有者所有。返回 false 说明临界区超过了 TTL，
    /// 期间可能已有其他持有者进入，需要关注。
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;

        let owned = self
            .store
            .compare_and_delete(&self.lock_key, &self.token)
            .await?;

        if owned {
            debug!(resource = %self.resource, "Lock released");
        } else {
            counter!(names::LOCK_LOST_TOTAL, "namespace" => self.resource.namespace.as_str())
                .increment(1);
            warn!(
                resource = %self.resource,
                token = %self.token,
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                ttl_ms = self.ttl.as_millis() as u64,
                "Lock expired or changed owner before release, critical section outlived its TTL"
            );
        }

        Ok(owned)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let lock_key = std::mem::take(&mut self.lock_key);
                let token = std::mem::take(&mut self.token);
                debug!(resource = %self.resource, "LockGuard dropped without release, releasing in background");
                handle.spawn(async move {
                    if let Err(err) = store.compare_and_delete(&lock_key, &token).await {
                        warn!(lock_key = %lock_key, error = %err, "Background lock release failed, lock will expire via TTL");
                    }
                });
            }
            Err(_) => {
                warn!(
                    resource = %self.resource,
                    "LockGuard dropped outside a runtime - lock will expire via TTL"
                );
            }
        }
    }
}

/// 按全序持有的一组锁
pub struct LockSet {
    guards: Vec<LockGuard>,
}

impl LockSet {
    pub fn resources(&self) -> Vec<ResourceKey> {
        self.guards.iter().map(|g| g.resource).collect()
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// 逆序释放全部锁
    ///
    /// 每把锁都会尝试释放，返回遇到的第一个错误。
    pub async fn release(mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(guard) = self.guards.pop() {
            if let Err(err) = guard.release().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{MemoryLockStore, MockLockStore};

    fn fast_config(retry_count: u32) -> LockConfig {
        LockConfig {
            default_ttl: Duration::from_secs(5),
            retry_count,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_lock_config_default() {
        let config = LockConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(30));
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_lock_config_from_concurrency_config() {
        let config = LockConfig::from(&ConcurrencyConfig::default());
        assert_eq!(config.default_ttl, Duration::from_secs(5));
        assert_eq!(config.retry_count, 50);
        assert_eq!(config.retry_delay, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_try_acquire_fails_fast_when_busy() {
        let mut store = MockLockStore::new();
        store
            .expect_set_if_absent()
            .times(1)
            .returning(|_, _, _| Ok(false));
        store.expect_backend().return_const("mock");

        let coordinator = LockCoordinator::new(Arc::new(store), fast_config(10));
        let err = coordinator
            .try_acquire(&ResourceKey::account(1), None)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, MutationError::LockBusy { ref resource } if resource == "account:1"));
    }

    #[tokio::test]
    async fn test_acquire_gives_up_after_retry_count() {
        let mut store = MockLockStore::new();
        store
            .expect_set_if_absent()
            .times(4)
            .returning(|_, _, _| Ok(false));
        store.expect_backend().return_const("mock");

        let coordinator = LockCoordinator::new(Arc::new(store), fast_config(4));
        let err = coordinator
            .acquire(&ResourceKey::game_stats(9), None)
            .await
            .err()
            .unwrap();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_retried() {
        let mut store = MockLockStore::new();
        store
            .expect_set_if_absent()
            .times(1)
            .returning(|_, _, _| Err(MutationError::LockStoreUnavailable("refused".to_string())));
        store.expect_backend().return_const("mock");

        let coordinator = LockCoordinator::new(Arc::new(store), fast_config(5));
        let err = coordinator
            .acquire(&ResourceKey::account(1), None)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, MutationError::LockStoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_token_carries_instance_id() {
        let coordinator =
            LockCoordinator::new(Arc::new(MemoryLockStore::new()), fast_config(1));
        let guard = coordinator
            .acquire(&ResourceKey::account(3), None)
            .await
            .unwrap();

        let (instance, lock_id) = guard.token().split_once(':').unwrap();
        assert_eq!(instance, coordinator.instance_id());
        assert!(Uuid::parse_str(lock_id).is_ok());
        assert_eq!(guard.lock_key(), "lock:account:3");

        assert!(guard.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let coordinator =
            LockCoordinator::new(Arc::new(MemoryLockStore::new()), fast_config(1));
        let err = coordinator
            .acquire(&ResourceKey::account(1), Some(Duration::ZERO))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MutationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_acquire_all_releases_held_locks_on_failure() {
        let mut store = MockLockStore::new();
        store
            .expect_set_if_absent()
            .returning(|key, _, _| Ok(key.ends_with("account:1")));
        store
            .expect_compare_and_delete()
            .times(1)
            .returning(|key, _| Ok(key.ends_with("account:1")));
        store.expect_backend().return_const("mock");

        let coordinator = LockCoordinator::new(Arc::new(store), fast_config(2));
        let result = coordinator
            .acquire_all(&[ResourceKey::account(2), ResourceKey::account(1)], None)
            .await;

        assert!(matches!(result, Err(MutationError::LockBusy { .. })));
    }

    #[tokio::test]
    async fn test_acquire_all_orders_and_dedups_keys() {
        let coordinator =
            LockCoordinator::new(Arc::new(MemoryLockStore::new()), fast_config(1));
        let set = coordinator
            .acquire_all(
                &[
                    ResourceKey::game_stats(1),
                    ResourceKey::account(7),
                    ResourceKey::account(2),
                    ResourceKey::account(7),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            set.resources(),
            vec![
                ResourceKey::account(2),
                ResourceKey::account(7),
                ResourceKey::game_stats(1),
            ]
        );
        set.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_reports_lost_lock() {
        let store = Arc::new(MemoryLockStore::new());
        let coordinator = LockCoordinator::new(store.clone(), fast_config(1));

        let guard = coordinator
            .acquire(&ResourceKey::account(5), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!guard.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_is_released_in_background() {
        let store = Arc::new(MemoryLockStore::new());
        let coordinator = LockCoordinator::new(store.clone(), fast_config(1));

        let guard = coordinator
            .acquire(&ResourceKey::account(8), None)
            .await
            .unwrap();
        assert!(store.is_locked("lock:account:8"));

        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!store.is_locked("lock:account:8"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let store = Arc::new(MemoryLockStore::new());
        let coordinator = LockCoordinator::new(store.clone(), fast_config(1));

        let result: Result<()> = coordinator
            .with_lock(&ResourceKey::account(4), None, || async {
                Err(MutationError::Validation("boom".to_string()))
            })
            .await;

        assert!(matches!(result, Err(MutationError::Validation(_))));
        assert!(!store.is_locked("lock:account:4"));
    }

    #[tokio::test]
    async fn test_with_lock_excludes_concurrent_holders() {
        let store = Arc::new(MemoryLockStore::new());
        let coordinator = Arc::new(LockCoordinator::new(store, fast_config(200)));
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .with_lock(&ResourceKey::account(1), None, || async {
                        let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(now)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 0);
        }
    }
}
