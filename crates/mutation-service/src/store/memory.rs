//! 进程内存储实现
//!
//! 语义与 PostgreSQL 实现保持一致：
//!
//! - 行锁：每行一把 tokio 互斥锁，事务持有到提交或回滚；等待超过 `lock_timeout` 返回瞬时错误
//! - 写缓冲：事务内的修改在提交时才对其他读者可见
//! - 唯一约束：`(account_id, source, source_ref)` 重复时返回 DuplicateEntry
//!
//! 另外提供故障注入与带外写入，便于验证重试路径。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::{StoreTx, TxOptions, TxStore};
use crate::error::{MutationError, Result, TransientKind};
use crate::models::{Account, GameStats, LedgerEntry, NewLedgerEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Account(i64),
    GameStats(i64),
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<i64, Account>,
    game_stats: HashMap<i64, GameStats>,
    entries: Vec<LedgerEntry>,
}

impl Tables {
    fn find_entry(&self, account_id: i64, source: &str, source_ref: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| {
            e.account_id == account_id && e.source == source && e.source_ref == source_ref
        })
    }
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: DashMap<RowKey, Arc<tokio::sync::Mutex<()>>>,
    commit_faults: Mutex<VecDeque<TransientKind>>,
    next_entry_id: AtomicI64,
    open_transactions: AtomicUsize,
}

/// 进程内存储
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建账户行（行由其他模块创建，这里仅用于初始化数据）
    pub fn seed_account(&self, id: i64, balance: i64) {
        self.inner
            .tables
            .lock()
            .accounts
            .insert(id, Account::new(id, balance));
    }

    pub fn seed_game_stats(&self, stats: GameStats) {
        self.inner.tables.lock().game_stats.insert(stats.id, stats);
    }

    /// 绕过行锁直接写入已提交数据，模拟其他进程的并发修改
    pub fn poke_balance(&self, id: i64, balance: i64) {
        if let Some(account) = self.inner.tables.lock().accounts.get_mut(&id) {
            account.balance = balance;
        }
    }

    /// 让接下来的 times 次提交以指定瞬时错误失败
    pub fn fail_next_commits(&self, kind: TransientKind, times: usize) {
        let mut faults = self.inner.commit_faults.lock();
        faults.extend(std::iter::repeat_n(kind, times));
    }

    /// 已提交的全部流水（按写入顺序）
    pub fn entries(&self, account_id: i64) -> Vec<LedgerEntry> {
        self.inner
            .tables
            .lock()
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    /// 尚未结束的事务数
    pub fn open_transactions(&self) -> usize {
        self.inner.open_transactions.load(Ordering::SeqCst)
    }

    /// 当前保留的行锁条目数，无人持有或等待的条目会被回收
    pub fn row_lock_count(&self) -> usize {
        self.inner.row_locks.len()
    }
}

impl Inner {
    /// 仅当没有事务持有或等待该行时移除其互斥锁
    fn prune_row_lock(&self, key: &RowKey) {
        self.row_locks
            .remove_if(key, |_, row| Arc::strong_count(row) == 1);
    }
}

#[async_trait]
impl TxStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, options: &TxOptions) -> Result<MemoryTx> {
        self.inner.open_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTx {
            inner: self.inner.clone(),
            lock_timeout: options.lock_timeout,
            row_guards: HashMap::new(),
            accounts: HashMap::new(),
            game_stats: HashMap::new(),
            entries: Vec::new(),
        })
    }

    async fn account(&self, id: i64) -> Result<Option<Account>> {
        Ok(self.inner.tables.lock().accounts.get(&id).copied())
    }

    async fn game_stats(&self, id: i64) -> Result<Option<GameStats>> {
        Ok(self.inner.tables.lock().game_stats.get(&id).copied())
    }

    async fn find_entry(
        &self,
        account_id: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<Option<LedgerEntry>> {
        let tables = self.inner.tables.lock();
        Ok(tables.find_entry(account_id, source, source_ref).cloned())
    }

    async fn list_entries(&self, account_id: i64, limit: i64) -> Result<Vec<LedgerEntry>> {
        let tables = self.inner.tables.lock();
        Ok(tables
            .entries
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// 进程内事务
///
/// 丢弃即回滚：缓冲的写入被丢弃，行锁随守卫一起释放。
pub struct MemoryTx {
    inner: Arc<Inner>,
    lock_timeout: Option<Duration>,
    row_guards: HashMap<RowKey, OwnedMutexGuard<()>>,
    accounts: HashMap<i64, Account>,
    game_stats: HashMap<i64, GameStats>,
    entries: Vec<LedgerEntry>,
}

impl MemoryTx {
    async fn lock_row(&mut self, key: RowKey) -> Result<()> {
        if self.row_guards.contains_key(&key) {
            return Ok(());
        }

        let row = self.inner.row_locks.entry(key).or_default().clone();
        let guard = match self.lock_timeout {
            Some(limit) => match tokio::time::timeout(limit, row.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    self.inner.prune_row_lock(&key);
                    return Err(MutationError::transient(
                        TransientKind::LockWaitTimeout,
                        format!("row lock wait exceeded {limit:?}"),
                    ));
                }
            },
            None => row.lock_owned().await,
        };

        self.row_guards.insert(key, guard);
        Ok(())
    }

    fn current_account(&self, id: i64) -> Option<Account> {
        self.accounts
            .get(&id)
            .copied()
            .or_else(|| self.inner.tables.lock().accounts.get(&id).copied())
    }

    fn current_game_stats(&self, id: i64) -> Option<GameStats> {
        self.game_stats
            .get(&id)
            .copied()
            .or_else(|| self.inner.tables.lock().game_stats.get(&id).copied())
    }

    fn duplicate(entry: &NewLedgerEntry) -> MutationError {
        MutationError::DuplicateEntry {
            account_id: entry.account_id,
            source_name: entry.source.clone(),
            source_ref: entry.source_ref.clone(),
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_account(&mut self, id: i64) -> Result<Option<Account>> {
        self.lock_row(RowKey::Account(id)).await?;
        Ok(self.current_account(id))
    }

    async fn set_balance(&mut self, id: i64, balance: i64) -> Result<()> {
        self.lock_row(RowKey::Account(id)).await?;
        if self.current_account(id).is_none() {
            return Err(MutationError::NotFound {
                entity: "account",
                id,
            });
        }
        // 与 accounts.balance >= 0 的 CHECK 约束一致
        if balance < 0 {
            return Err(MutationError::InsufficientBalance {
                required: 0,
                available: 0,
            });
        }
        self.accounts.insert(id, Account::new(id, balance));
        Ok(())
    }

    async fn lock_game_stats(&mut self, id: i64) -> Result<Option<GameStats>> {
        self.lock_row(RowKey::GameStats(id)).await?;
        Ok(self.current_game_stats(id))
    }

    async fn set_game_stats(&mut self, stats: &GameStats) -> Result<()> {
        self.lock_row(RowKey::GameStats(stats.id)).await?;
        if self.current_game_stats(stats.id).is_none() {
            return Err(MutationError::NotFound {
                entity: "game_stats",
                id: stats.id,
            });
        }
        self.game_stats.insert(stats.id, *stats);
        Ok(())
    }

    async fn find_entry(
        &mut self,
        account_id: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<Option<LedgerEntry>> {
        let pending = self.entries.iter().find(|e| {
            e.account_id == account_id && e.source == source && e.source_ref == source_ref
        });
        if let Some(entry) = pending {
            return Ok(Some(entry.clone()));
        }

        let tables = self.inner.tables.lock();
        Ok(tables.find_entry(account_id, source, source_ref).cloned())
    }

    async fn insert_entry(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry> {
        if self
            .find_entry(entry.account_id, &entry.source, &entry.source_ref)
            .await?
            .is_some()
        {
            return Err(Self::duplicate(entry));
        }

        let stored = LedgerEntry {
            id: self.inner.next_entry_id.fetch_add(1, Ordering::SeqCst) + 1,
            account_id: entry.account_id,
            amount: entry.amount,
            kind: entry.kind,
            source: entry.source.clone(),
            source_ref: entry.source_ref.clone(),
            resulting_balance: entry.resulting_balance,
            created_at: Utc::now(),
        };
        self.entries.push(stored.clone());
        Ok(stored)
    }

    async fn commit(mut self) -> Result<()> {
        if let Some(kind) = self.inner.commit_faults.lock().pop_front() {
            return Err(MutationError::transient(kind, "injected commit failure"));
        }

        let mut tables = self.inner.tables.lock();

        // 唯一约束在提交时再校验一次，覆盖未持有行锁的并发写入
        for entry in &self.entries {
            if tables
                .find_entry(entry.account_id, &entry.source, &entry.source_ref)
                .is_some()
            {
                return Err(MutationError::DuplicateEntry {
                    account_id: entry.account_id,
                    source_name: entry.source.clone(),
                    source_ref: entry.source_ref.clone(),
                });
            }
        }

        tables.accounts.extend(self.accounts.drain());
        tables.game_stats.extend(self.game_stats.drain());
        tables.entries.append(&mut self.entries);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        let guards = std::mem::take(&mut self.row_guards);
        let keys: Vec<RowKey> = guards.keys().copied().collect();
        drop(guards);
        for key in &keys {
            self.inner.prune_row_lock(key);
        }
        self.inner.open_transactions.fetch_sub(1, Ordering::SeqCst);
    }
}
