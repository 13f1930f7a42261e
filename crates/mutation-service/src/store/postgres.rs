//! PostgreSQL 存储实现

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::{StoreTx, TxOptions, TxStore};
use crate::error::{MutationError, Result};
use crate::models::{Account, GameStats, LedgerEntry, NewLedgerEntry};

const ENTRY_COLUMNS: &str =
    "id, account_id, amount, kind, source, source_ref, resulting_balance, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TxStore for PgStore {
    type Tx = PgTx;

    async fn begin(&self, options: &TxOptions) -> Result<PgTx> {
        let mut tx = self.pool.begin().await?;

        // SET TRANSACTION 必须是事务内的第一条语句
        let isolation = format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            options.isolation.as_sql()
        );
        sqlx::query(&isolation).execute(&mut *tx).await?;

        if let Some(timeout) = options.statement_timeout {
            let sql = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        if let Some(timeout) = options.lock_timeout {
            let sql = format!("SET LOCAL lock_timeout = {}", timeout.as_millis());
            sqlx::query(&sql).execute(&mut *tx).await?;
        }

        Ok(PgTx { tx })
    }

    async fn account(&self, id: i64) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT id, balance FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn game_stats(&self, id: i64) -> Result<Option<GameStats>> {
        let stats = sqlx::query_as::<_, GameStats>(
            "SELECT id, play_count, average_rating, rating_count FROM game_stats WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn find_entry(
        &self,
        account_id: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE account_id = $1 AND source = $2 AND source_ref = $3"
        );
        let entry = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .bind(source)
            .bind(source_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn list_entries(&self, account_id: i64, limit: i64) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE account_id = $1 ORDER BY id DESC LIMIT $2"
        );
        let entries = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }
}

/// PostgreSQL 事务句柄
///
/// 未提交即被丢弃时，sqlx 会回滚事务并将连接归还连接池。
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_account(&mut self, id: i64) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, balance FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(account)
    }

    async fn set_balance(&mut self, id: i64, balance: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE accounts SET balance = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(balance)
                .execute(&mut *self.tx)
                .await?;

        if result.rows_affected() == 0 {
            return Err(MutationError::NotFound {
                entity: "account",
                id,
            });
        }
        Ok(())
    }

    async fn lock_game_stats(&mut self, id: i64) -> Result<Option<GameStats>> {
        let stats = sqlx::query_as::<_, GameStats>(
            r#"
            SELECT id, play_count, average_rating, rating_count
            FROM game_stats
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(stats)
    }

    async fn set_game_stats(&mut self, stats: &GameStats) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE game_stats
            SET play_count = $2, average_rating = $3, rating_count = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(stats.id)
        .bind(stats.play_count)
        .bind(stats.average_rating)
        .bind(stats.rating_count)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MutationError::NotFound {
                entity: "game_stats",
                id: stats.id,
            });
        }
        Ok(())
    }

    async fn find_entry(
        &mut self,
        account_id: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries \
             WHERE account_id = $1 AND source = $2 AND source_ref = $3"
        );
        let entry = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(account_id)
            .bind(source)
            .bind(source_ref)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(entry)
    }

    async fn insert_entry(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry> {
        let sql = format!(
            r#"
            INSERT INTO ledger_entries
                (account_id, amount, kind, source, source_ref, resulting_balance)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(entry.account_id)
            .bind(entry.amount)
            .bind(entry.kind)
            .bind(&entry.source)
            .bind(&entry.source_ref)
            .bind(entry.resulting_balance)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| match MutationError::from(e) {
                MutationError::DuplicateEntry { .. } => MutationError::DuplicateEntry {
                    account_id: entry.account_id,
                    source_name: entry.source.clone(),
                    source_ref: entry.source_ref.clone(),
                },
                other => other,
            })
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
