//! Redis 连接管理模块
//!
//! 提供 Redis 客户端创建与健康检查，上层（如分布式锁）按需获取多路复用连接。

use crate::config::RedisConfig;
use crate::error::{InfraError, Result};
use redis::Client;
use redis::aio::MultiplexedConnection;
use tracing::info;

/// Redis 客户端包装
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
}

impl RedisConnector {
    /// 创建 Redis 客户端
    ///
    /// 仅解析 URL，不建立连接；首次使用或 `health_check` 时才真正连接。
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取底层客户端
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 获取多路复用连接
    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(InfraError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(InfraError::from)
    }
}
