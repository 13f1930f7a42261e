//! 关系存储抽象
//!
//! 变更核心只依赖下面两组窄接口：
//!
//! - `TxStore`：开启事务，以及不加锁的只读查询
//! - `StoreTx`：事务内的悲观行锁读取、字段更新、流水追加与提交/回滚
//!
//! ## 实现
//!
//! - `PgStore`：PostgreSQL（`SELECT ... FOR UPDATE`，SQLSTATE 区分瞬时错误）
//! - `MemoryStore`：进程内实现，逐行互斥模拟行锁，支持注入瞬时故障，用于测试与单机开发

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use playhub_shared::retry::RetryPolicy;

use crate::error::Result;
use crate::models::{Account, GameStats, LedgerEntry, NewLedgerEntry};

pub use memory::{MemoryStore, MemoryTx};
pub use postgres::{PgStore, PgTx};

/// 事务隔离级别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// 事务选项
///
/// `retry` 为 None 时不做任何重试，瞬时错误原样返回。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub statement_timeout: Option<Duration>,
    pub lock_timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = None;
        self
    }
}

/// 可开启事务的关系存储
#[async_trait]
pub trait TxStore: Send + Sync + 'static {
    type Tx: StoreTx;

    /// 开启事务并应用隔离级别与超时设置
    async fn begin(&self, options: &TxOptions) -> Result<Self::Tx>;

    // 不加锁的只读查询
    async fn account(&self, id: i64) -> Result<Option<Account>>;
    async fn game_stats(&self, id: i64) -> Result<Option<GameStats>>;
    async fn find_entry(
        &self,
        account_id: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<Option<LedgerEntry>>;
    /// 按时间倒序返回最近的 limit 条流水
    async fn list_entries(&self, account_id: i64, limit: i64) -> Result<Vec<LedgerEntry>>;
}

/// 事务句柄
///
/// 句柄被丢弃而未提交时视为回滚，连接随之归还。
#[async_trait]
pub trait StoreTx: Send + Sized + 'static {
    /// 悲观锁读取账户行
    async fn lock_account(&mut self, id: i64) -> Result<Option<Account>>;
    async fn set_balance(&mut self, id: i64, balance: i64) -> Result<()>;

    /// 悲观锁读取统计行
    async fn lock_game_stats(&mut self, id: i64) -> Result<Option<GameStats>>;
    async fn set_game_stats(&mut self, stats: &GameStats) -> Result<()>;

    async fn find_entry(
        &mut self,
        account_id: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<Option<LedgerEntry>>;
    /// 追加流水；幂等键冲突返回 DuplicateEntry
    async fn insert_entry(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry>;

    async fn commit(self) -> Result<()>;
    async fn rollback(self) -> Result<()>;
}
