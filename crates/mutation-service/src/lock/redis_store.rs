//! Redis 锁存储
//!
//! 获取使用 `SET key token NX PX ttl`，释放使用 Lua 脚本原子地比较并删除，
//! 避免误删已过期后被其他持有者重新获取的锁。

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::MultiplexedConnection;

use super::store::LockStore;
use crate::error::{MutationError, Result};

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// 基于 Redis 的锁存储
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    release_script: Script,
}

impl RedisLockStore {
    /// 多路复用连接可在任务间廉价克隆，每次操作克隆一份使用
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

fn unavailable(err: redis::RedisError) -> MutationError {
    MutationError::LockStoreUnavailable(err.to_string())
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();

        // SET NX 成功时返回 "OK"，键已存在时返回 nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(deleted > 0)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
