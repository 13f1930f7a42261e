//! PostgreSQL 锁存储
//!
//! 基于 `distributed_locks` 表：`lock_key` 为主键，过期行可被新的持有者原子接管。
//! 适用于没有 Redis 的部署，只能通过配置显式启用。

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::debug;

use super::store::LockStore;
use crate::error::{MutationError, Result};

pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 清理全部过期锁，返回删除的行数
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}

fn unavailable(err: sqlx::Error) -> MutationError {
    MutationError::LockStoreUnavailable(err.to_string())
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| MutationError::Validation(format!("lock ttl out of range: {e}")))?;
        let expires_at = Utc::now() + ttl;

        // 键不存在时插入；已存在但过期时由新持有者接管
        let result = sqlx::query(
            r#"
            INSERT INTO distributed_locks (lock_key, owner_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE
                SET owner_id = EXCLUDED.owner_id,
                    expires_at = EXCLUDED.expires_at
                WHERE distributed_locks.expires_at < NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        let acquired = result.rows_affected() > 0;
        if acquired {
            debug!(key = %key, "Database lock acquired");
        }
        Ok(acquired)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM distributed_locks
            WHERE lock_key = $1 AND owner_id = $2 AND expires_at >= NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() > 0)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
