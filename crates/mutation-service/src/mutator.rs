//! 并发安全的读-改-写
//!
//! 组合分布式锁与事务执行器：
//!
//! 1. 获取资源的分布式锁
//! 2. 开启事务（READ COMMITTED + 语句/锁超时 + 瞬时错误重试）
//! 3. 事务内：幂等重放检查 → 行锁读取 → update_fn → 写回
//! 4. 提交后释放锁
//!
//! 整个调用受 `operation_timeout` 约束。超时后事务随 future 一起被丢弃（回滚），
//! 锁守卫在后台释放。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use playhub_shared::config::ConcurrencyConfig;
use playhub_shared::observability::metrics::names;
use playhub_shared::retry::RetryPolicy;
use tracing::{error, instrument, warn};

use crate::error::{ErrorKind, MutationError, Result};
use crate::lock::LockCoordinator;
use crate::models::ResourceKey;
use crate::runner::{TransactionRunner, TxWork};
use crate::store::{IsolationLevel, StoreTx, TxOptions, TxStore};

/// 单个受保护字段的读写方式
#[async_trait]
pub trait Mutation<T: StoreTx>: Send + Sync {
    type Value: Send + Sync;
    type Output: Send;

    /// 要加锁的资源
    fn resource(&self) -> ResourceKey;

    /// 请求已经生效过时返回先前的结果（在行锁下执行）
    async fn replay(&self, _tx: &mut T) -> Result<Option<Self::Output>> {
        Ok(None)
    }

    /// 在行锁下读取当前值，行不存在返回 NotFound
    async fn load(&self, tx: &mut T) -> Result<Self::Value>;

    /// 写回新值，以及同一事务内的附属记录（如流水）
    async fn store(
        &self,
        tx: &mut T,
        current: &Self::Value,
        next: Self::Value,
    ) -> Result<Self::Output>;
}

/// 变更器配置
#[derive(Debug, Clone)]
pub struct MutatorConfig {
    pub tx_options: TxOptions,
    pub operation_timeout: Duration,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self::from(&ConcurrencyConfig::default())
    }
}

impl From<&ConcurrencyConfig> for MutatorConfig {
    fn from(config: &ConcurrencyConfig) -> Self {
        let retry = RetryPolicy {
            max_retries: config.tx_max_retries,
            initial_delay: Duration::from_millis(config.tx_retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.tx_retry_max_delay_ms),
            ..RetryPolicy::default()
        };

        Self {
            tx_options: TxOptions::new()
                .isolation(IsolationLevel::ReadCommitted)
                .statement_timeout(config.statement_timeout())
                .lock_timeout(config.lock_timeout())
                .retry(retry),
            operation_timeout: config.operation_timeout(),
        }
    }
}

pub struct ConcurrentMutator<S: TxStore> {
    locks: Arc<LockCoordinator>,
    runner: TransactionRunner<S>,
    config: MutatorConfig,
}

impl<S: TxStore> ConcurrentMutator<S> {
    pub fn new(locks: Arc<LockCoordinator>, store: Arc<S>, config: MutatorConfig) -> Self {
        Self {
            locks,
            runner: TransactionRunner::new(store),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        self.runner.store()
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn config(&self) -> &MutatorConfig {
        &self.config
    }

    /// 在分布式锁与行锁保护下执行一次读-改-写
    ///
    /// update_fn 在每次事务重试时都会基于新读取的值重新调用，返回错误时事务回滚。
    #[instrument(skip_all, fields(resource = %mutation.resource()))]
    pub async fn apply<M, F>(
        &self,
        mutation: &M,
        lock_ttl: Option<Duration>,
        update_fn: F,
    ) -> Result<M::Output>
    where
        M: Mutation<S::Tx>,
        F: Fn(&M::Value) -> Result<M::Value> + Send + Sync,
    {
        let resource = mutation.resource();
        let work = GuardedUpdate {
            mutation,
            update_fn: &update_fn,
        };

        self.timed(resource.namespace.as_str(), async {
            self.locks
                .with_lock(&resource, lock_ttl, || {
                    self.runner.run("guarded_update", &work, &self.config.tx_options)
                })
                .await
        })
        .await
    }

    /// 按全序锁定多个资源后在单个事务中执行工作单元
    #[instrument(skip_all, fields(resources = keys.len()))]
    pub async fn run_exclusive<W>(
        &self,
        keys: &[ResourceKey],
        lock_ttl: Option<Duration>,
        work: &W,
    ) -> Result<W::Output>
    where
        W: TxWork<S::Tx>,
    {
        let label = match keys.first() {
            Some(first) if keys.iter().all(|k| k.namespace == first.namespace) => {
                first.namespace.as_str()
            }
            _ => "mixed",
        };

        self.timed(label, async {
            let held = self.locks.acquire_all(keys, lock_ttl).await?;
            let result = self
                .runner
                .run("exclusive", work, &self.config.tx_options)
                .await;

            if let Err(err) = held.release().await {
                warn!(error = %err, "释放锁失败，等待 TTL 过期");
            }
            result
        })
        .await
    }

    async fn timed<T, Fut>(&self, resource: &'static str, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let limit = self.config.operation_timeout;

        let result = match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(resource, timeout_ms = limit.as_millis() as u64, "Mutation timed out");
                Err(MutationError::Timeout {
                    operation: "mutation",
                    after: limit,
                })
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => {
                if err.kind() == ErrorKind::Infrastructure {
                    error!(
                        resource,
                        error_code = err.error_code(),
                        error = %err,
                        "变更失败：基础设施错误"
                    );
                }
                err.error_code()
            }
        };
        counter!(names::MUTATIONS_TOTAL, "resource" => resource, "outcome" => outcome)
            .increment(1);
        histogram!(names::MUTATION_DURATION_SECONDS, "resource" => resource)
            .record(started.elapsed().as_secs_f64());

        result
    }
}

/// 把 Mutation 与 update_fn 组合成事务工作单元
struct GuardedUpdate<'a, M, F> {
    mutation: &'a M,
    update_fn: &'a F,
}

#[async_trait]
impl<'a, T, M, F> TxWork<T> for GuardedUpdate<'a, M, F>
where
    T: StoreTx,
    M: Mutation<T>,
    F: Fn(&M::Value) -> Result<M::Value> + Send + Sync,
{
    type Output = M::Output;

    async fn run(&self, tx: &mut T) -> Result<M::Output> {
        if let Some(previous) = self.mutation.replay(tx).await? {
            return Ok(previous);
        }

        let current = self.mutation.load(tx).await?;
        let next = (self.update_fn)(&current)?;
        self.mutation.store(tx, &current, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockConfig, MemoryLockStore};
    use crate::store::{MemoryStore, MemoryTx};

    struct Balance(i64);

    #[async_trait]
    impl Mutation<MemoryTx> for Balance {
        type Value = i64;
        type Output = i64;

        fn resource(&self) -> ResourceKey {
            ResourceKey::account(self.0)
        }

        async fn load(&self, tx: &mut MemoryTx) -> Result<i64> {
            tx.lock_account(self.0)
                .await?
                .map(|a| a.balance)
                .ok_or(MutationError::NotFound {
                    entity: "account",
                    id: self.0,
                })
        }

        async fn store(&self, tx: &mut MemoryTx, _current: &i64, next: i64) -> Result<i64> {
            tx.set_balance(self.0, next).await?;
            Ok(next)
        }
    }

    fn mutator(store: Arc<MemoryStore>, timeout: Duration) -> ConcurrentMutator<MemoryStore> {
        let locks = Arc::new(LockCoordinator::new(
            Arc::new(MemoryLockStore::new()),
            LockConfig {
                default_ttl: Duration::from_secs(5),
                retry_count: 1,
                retry_delay: Duration::from_millis(1),
            },
        ));
        let config = MutatorConfig {
            operation_timeout: timeout,
            ..MutatorConfig::default()
        };
        ConcurrentMutator::new(locks, store, config)
    }

    #[test]
    fn test_config_from_concurrency_config() {
        let config = MutatorConfig::from(&ConcurrencyConfig::default());
        assert_eq!(config.tx_options.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.tx_options.statement_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.tx_options.retry.unwrap().max_retries, 3);
        assert_eq!(config.operation_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_apply_updates_value() {
        let store = Arc::new(MemoryStore::new());
        store.seed_account(1, 5);
        let mutator = mutator(store.clone(), Duration::from_secs(5));

        let value = mutator
            .apply(&Balance(1), None, |v| Ok(v * 2))
            .await
            .unwrap();

        assert_eq!(value, 10);
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, 10);
        assert!(!mutator.locks().config().default_ttl.is_zero());
    }

    #[tokio::test]
    async fn test_update_fn_error_leaves_value_unchanged() {
        let store = Arc::new(MemoryStore::new());
        store.seed_account(1, 5);
        let mutator = mutator(store.clone(), Duration::from_secs(5));

        let err = mutator
            .apply(&Balance(1), None, |_| {
                Err(MutationError::Validation("rejected".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::Validation(_)));
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, 5);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let mutator = mutator(store, Duration::from_secs(5));

        let err = mutator
            .apply(&Balance(404), None, |v| Ok(*v))
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::NotFound { id: 404, .. }));
    }

    #[tokio::test]
    async fn test_operation_timeout_rolls_back_and_frees_resource() {
        let store = Arc::new(MemoryStore::new());
        store.seed_account(1, 5);
        let mutator = mutator(store.clone(), Duration::from_millis(50));

        // 外部事务持有行锁，且不设锁等待超时，apply 只能等到整体超时
        let mut blocker = store.begin(&TxOptions::new()).await.unwrap();
        blocker.lock_account(1).await.unwrap();

        let slow = ConcurrentMutator::new(
            mutator.locks().clone(),
            store.clone(),
            MutatorConfig {
                tx_options: TxOptions::new(),
                operation_timeout: Duration::from_millis(50),
            },
        );
        let err = slow
            .apply(&Balance(1), None, |v| Ok(v + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Timeout { .. }));

        blocker.rollback().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 分布式锁已在后台释放，后续调用不会返回 LockBusy
        let value = mutator.apply(&Balance(1), None, |v| Ok(v + 1)).await.unwrap();
        assert_eq!(value, 6);
        assert_eq!(store.open_transactions(), 0);
    }
}
