//! PostgreSQL 连接池
//!
//! 变更核心的持久化存储、PG 锁后端与审计表共用同一个连接池。
//! 进程启动时数据库可能尚未就绪，连接阶段对网络类错误做有限次退避重试。

use crate::config::DatabaseConfig;
use crate::error::{InfraError, Result};
use crate::retry::{RetryPolicy, retry_with_policy};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// 启动阶段的连接重试策略
fn connect_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 5,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    }
}

/// 仅网络层与连接池超时值得重试；认证失败、库不存在等配置错误直接返回
fn is_connect_retryable(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 创建数据库连接池
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds));

        let pool = retry_with_policy(
            &connect_policy(),
            "database_connect",
            is_connect_retryable,
            || options.clone().connect(&config.url),
        )
        .await?;

        info!("Database connection pool created");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(InfraError::from)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }

    /// 运行迁移
    ///
    /// migrate! 宏在编译期解析迁移目录，因此由持有 migrations 目录的服务 crate 提供 Migrator。
    #[instrument(skip(self, migrator), fields(embedded = migrator.iter().count()))]
    pub async fn run_migrations(&self, migrator: &Migrator) -> Result<()> {
        migrator.run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retried_on_connect() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(is_connect_retryable(&io));
        assert!(is_connect_retryable(&sqlx::Error::PoolTimedOut));
        assert!(!is_connect_retryable(&sqlx::Error::RowNotFound));
        assert!(!is_connect_retryable(&sqlx::Error::Configuration(
            "bad url".into()
        )));
    }

    #[test]
    fn test_connect_policy_is_bounded() {
        let policy = connect_policy();
        assert!(policy.max_retries > 0);
        assert!(policy.delay_for_attempt(10) <= Duration::from_secs(5));
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_database_connection() {
        let config = crate::test_utils::test_database_config();
        let db = Database::connect(&config).await.unwrap();
        db.health_check().await.unwrap();
        db.close().await;
    }
}
