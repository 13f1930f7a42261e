//! 组件装配
//!
//! 每个进程只构建一次，之后以 `Arc` 共享，不使用全局单例。

use std::sync::Arc;

use anyhow::Result;
use playhub_shared::config::{AppConfig, ConcurrencyConfig, LockBackend};
use playhub_shared::database::Database;
use playhub_shared::redis_conn::RedisConnector;
use sqlx::migrate::Migrator;
use tracing::info;

use crate::audit::{AuditSink, PgAuditSink, TracingAuditSink};
use crate::lock::{LockConfig, LockCoordinator, LockStore, MemoryLockStore, PgLockStore, RedisLockStore};
use crate::mutator::{ConcurrentMutator, MutatorConfig};
use crate::service::{CounterService, LedgerService};
use crate::store::{MemoryStore, PgStore, TxStore};

/// 本服务的数据库迁移
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// 装配完成的变更核心
pub struct MutationContext<S: TxStore> {
    pub store: Arc<S>,
    pub locks: Arc<LockCoordinator>,
    pub mutator: Arc<ConcurrentMutator<S>>,
    pub ledger: Arc<LedgerService<S>>,
    pub counters: Arc<CounterService<S>>,
}

impl<S: TxStore> MutationContext<S> {
    pub fn assemble(
        store: Arc<S>,
        lock_store: Arc<dyn LockStore>,
        audit: Arc<dyn AuditSink>,
        config: &ConcurrencyConfig,
    ) -> Self {
        let locks = Arc::new(LockCoordinator::new(lock_store, LockConfig::from(config)));
        let mutator = Arc::new(ConcurrentMutator::new(
            locks.clone(),
            store.clone(),
            MutatorConfig::from(config),
        ));
        let ledger = Arc::new(LedgerService::new(mutator.clone(), audit.clone()));
        let counters = Arc::new(CounterService::new(mutator.clone(), audit));

        Self {
            store,
            locks,
            mutator,
            ledger,
            counters,
        }
    }
}

impl MutationContext<PgStore> {
    /// 基于 PostgreSQL 构建，锁后端按配置选择
    pub async fn build(config: &AppConfig, db: &Database) -> Result<Self> {
        let concurrency = &config.concurrency;
        concurrency.validate()?;

        let lock_store: Arc<dyn LockStore> = match concurrency.lock_backend {
            LockBackend::Redis => {
                let redis = RedisConnector::new(&config.redis)?;
                redis.health_check().await?;
                Arc::new(RedisLockStore::new(redis.connection().await?))
            }
            LockBackend::Postgres => Arc::new(PgLockStore::new(db.pool().clone())),
            LockBackend::Memory => {
                if config.is_production() {
                    anyhow::bail!("memory lock backend cannot coordinate multiple instances");
                }
                Arc::new(MemoryLockStore::new())
            }
        };

        let context = Self::assemble(
            Arc::new(PgStore::new(db.pool().clone())),
            lock_store,
            Arc::new(PgAuditSink::new(db.pool().clone())),
            concurrency,
        );

        info!(
            lock_backend = context.locks.backend(),
            instance_id = context.locks.instance_id(),
            lock_ttl_ms = concurrency.lock_ttl_ms,
            operation_timeout_ms = concurrency.operation_timeout_ms,
            "Mutation core initialized"
        );

        Ok(context)
    }
}

impl MutationContext<MemoryStore> {
    /// 单进程内存实现，审计输出到日志
    pub fn in_memory(config: &ConcurrencyConfig) -> Self {
        Self::assemble(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLockStore::new()),
            Arc::new(TracingAuditSink),
            config,
        )
    }
}
