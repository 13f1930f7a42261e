//! 事务执行器
//!
//! 以单个事务执行一个工作单元：成功提交，失败回滚，连接在任何路径上都会归还。
//! 配置了重试策略时，瞬时错误（死锁、序列化冲突、锁等待与语句超时）会在
//! 全新的事务中重新执行整个工作单元，因此工作单元内的读取每次都是新鲜的。
//!
//! 嵌套调用 `run` 总是开启独立的事务，不会加入外层事务。

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use playhub_shared::observability::metrics::names;
use playhub_shared::retry::retry_with_policy;
use tracing::{debug, instrument, warn};

use crate::error::{MutationError, Result};
use crate::store::{StoreTx, TxOptions, TxStore};

/// 事务内执行的工作单元
#[async_trait]
pub trait TxWork<T: StoreTx>: Send + Sync {
    type Output: Send;

    async fn run(&self, tx: &mut T) -> Result<Self::Output>;
}

pub struct TransactionRunner<S: TxStore> {
    store: Arc<S>,
}

impl<S: TxStore> Clone for TransactionRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: TxStore> TransactionRunner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// 执行工作单元
    ///
    /// 重试耗尽时返回 `RetriesExhausted`；未配置重试时瞬时错误原样返回。
    /// 非瞬时错误在第一次出现时即返回。
    #[instrument(skip(self, work, options), fields(isolation = options.isolation.as_sql()))]
    pub async fn run<W>(&self, operation: &str, work: &W, options: &TxOptions) -> Result<W::Output>
    where
        W: TxWork<S::Tx>,
    {
        let Some(policy) = &options.retry else {
            return self.attempt(work, options).await;
        };

        retry_with_policy(policy, operation, MutationError::is_transient, || {
            self.attempt(work, options)
        })
        .await
        .map_err(|err| {
            if err.is_transient() {
                MutationError::RetriesExhausted {
                    attempts: policy.max_attempts(),
                    last_error: err.to_string(),
                }
            } else {
                err
            }
        })
    }

    async fn attempt<W>(&self, work: &W, options: &TxOptions) -> Result<W::Output>
    where
        W: TxWork<S::Tx>,
    {
        let mut tx = self.store.begin(options).await?;

        match work.run(&mut tx).await {
            Ok(output) => match tx.commit().await {
                Ok(()) => {
                    counter!(names::TX_ATTEMPTS_TOTAL, "outcome" => "committed").increment(1);
                    Ok(output)
                }
                Err(err) => {
                    counter!(names::TX_ATTEMPTS_TOTAL, "outcome" => "commit_failed").increment(1);
                    debug!(error = %err, "Commit failed");
                    Err(err)
                }
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    // 回滚失败不覆盖原始错误，连接由驱动在丢弃时回收
                    warn!(error = %rollback_err, cause = %err, "事务回滚失败");
                }
                counter!(names::TX_ATTEMPTS_TOTAL, "outcome" => "rolled_back").increment(1);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use playhub_shared::retry::RetryPolicy;

    use crate::error::TransientKind;
    use crate::store::{MemoryStore, MemoryTx};

    /// 读取余额加一；可指定在前几次调用时返回的错误
    struct Increment {
        account_id: i64,
        calls: AtomicU32,
        fail_first: u32,
        failure: fn() -> MutationError,
    }

    impl Increment {
        fn new(account_id: i64) -> Self {
            Self {
                account_id,
                calls: AtomicU32::new(0),
                fail_first: 0,
                failure: || MutationError::Internal("unused".to_string()),
            }
        }

        fn failing(account_id: i64, times: u32, failure: fn() -> MutationError) -> Self {
            Self {
                fail_first: times,
                failure,
                ..Self::new(account_id)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TxWork<MemoryTx> for Increment {
        type Output = i64;

        async fn run(&self, tx: &mut MemoryTx) -> Result<i64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let account = tx
                .lock_account(self.account_id)
                .await?
                .ok_or(MutationError::NotFound {
                    entity: "account",
                    id: self.account_id,
                })?;
            tx.set_balance(self.account_id, account.balance + 1).await?;
            if call < self.fail_first {
                return Err((self.failure)());
            }
            Ok(account.balance + 1)
        }
    }

    fn deadlock() -> MutationError {
        MutationError::transient(TransientKind::Deadlock, "40P01")
    }

    fn retrying(max_retries: u32) -> TxOptions {
        TxOptions::new().retry(RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        })
    }

    fn setup() -> (Arc<MemoryStore>, TransactionRunner<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.seed_account(1, 10);
        let runner = TransactionRunner::new(store.clone());
        (store, runner)
    }

    #[tokio::test]
    async fn test_commits_on_success() {
        let (store, runner) = setup();
        let work = Increment::new(1);

        let balance = runner.run("inc", &work, &TxOptions::new()).await.unwrap();

        assert_eq!(balance, 11);
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, 11);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_rolls_back_on_error() {
        let (store, runner) = setup();
        let work = Increment::failing(1, 1, || MutationError::Validation("nope".to_string()));

        let err = runner.run("inc", &work, &retrying(3)).await.unwrap_err();

        assert!(matches!(err, MutationError::Validation(_)));
        // 非瞬时错误不重试
        assert_eq!(work.calls(), 1);
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, 10);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_in_fresh_transaction() {
        let (store, runner) = setup();
        let work = Increment::failing(1, 2, deadlock);

        let balance = runner.run("inc", &work, &retrying(3)).await.unwrap();

        assert_eq!(work.calls(), 3);
        // 前两次的写入均已回滚，只生效一次
        assert_eq!(balance, 11);
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, 11);
    }

    #[tokio::test]
    async fn test_commit_failure_is_classified_and_retried() {
        let (store, runner) = setup();
        store.fail_next_commits(TransientKind::SerializationFailure, 1);
        let work = Increment::new(1);

        let balance = runner.run("inc", &work, &retrying(2)).await.unwrap();

        assert_eq!(work.calls(), 2);
        assert_eq!(balance, 11);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (store, runner) = setup();
        let work = Increment::failing(1, 100, deadlock);

        let err = runner.run("inc", &work, &retrying(2)).await.unwrap_err();

        match err {
            MutationError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("deadlock"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(work.calls(), 3);
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, 10);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_without_retry_transient_error_is_returned_as_is() {
        let (_store, runner) = setup();
        let work = Increment::failing(1, 1, deadlock);

        let err = runner
            .run("inc", &work, &TxOptions::new())
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(work.calls(), 1);
    }

    #[tokio::test]
    async fn test_nested_run_opens_independent_transaction() {
        let (store, runner) = setup();
        store.seed_account(2, 0);

        let mut outer = store.begin(&TxOptions::new()).await.unwrap();
        outer.set_balance(1, 99).await.unwrap();

        let inner = Increment::new(2);
        runner.run("inner", &inner, &TxOptions::new()).await.unwrap();
        outer.rollback().await.unwrap();

        assert_eq!(store.account(1).await.unwrap().unwrap().balance, 10);
        assert_eq!(store.account(2).await.unwrap().unwrap().balance, 1);
    }
}
