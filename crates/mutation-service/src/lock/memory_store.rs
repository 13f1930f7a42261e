//! 进程内锁存储
//!
//! 仅在单进程内互斥，适用于单实例部署与测试。过期判断基于单调时钟。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::store::LockStore;
use crate::error::Result;

#[derive(Debug, Clone)]
struct Holder {
    token: String,
    expires_at: Instant,
}

impl Holder {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: DashMap<String, Holder>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 键当前是否被未过期的持有者占用
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|h| h.is_live(now))
    }

    /// 当前未过期的锁数量
    pub fn live_locks(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|h| h.is_live(now)).count()
    }

    /// 保留的条目数（含尚未回收的过期条目）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        // 持有者崩溃后不会释放，在加锁时顺带回收过期条目
        self.entries.retain(|_, h| h.is_live(now));

        let holder = Holder {
            token: value.to_string(),
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(holder);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, h| h.token == value && h.is_live(now));
        Ok(removed.is_some())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let store = MemoryLockStore::new();
        let ttl = Duration::from_secs(5);

        assert!(store.set_if_absent("lock:account:1", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock:account:1", "b", ttl).await.unwrap());
        assert!(store.set_if_absent("lock:account:2", "b", ttl).await.unwrap());
        assert_eq!(store.live_locks(), 2);
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_matching_token() {
        let store = MemoryLockStore::new();
        store
            .set_if_absent("lock:account:1", "a", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("lock:account:1", "b").await.unwrap());
        assert!(store.is_locked("lock:account:1"));
        assert!(store.compare_and_delete("lock:account:1", "a").await.unwrap());
        assert!(!store.is_locked("lock:account:1"));
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_taken_over() {
        let store = MemoryLockStore::new();
        store
            .set_if_absent("lock:game_stats:7", "crashed", Duration::from_millis(20))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.is_locked("lock:game_stats:7"));
        assert!(
            store
                .set_if_absent("lock:game_stats:7", "next", Duration::from_secs(5))
                .await
                .unwrap()
        );
        // 过期持有者的释放不会删除新持有者的锁
        assert!(!store.compare_and_delete("lock:game_stats:7", "crashed").await.unwrap());
        assert!(store.is_locked("lock:game_stats:7"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_reclaimed_on_acquire() {
        let store = MemoryLockStore::new();
        for id in 0..50 {
            store
                .set_if_absent(&format!("lock:account:{id}"), "crashed", Duration::from_millis(20))
                .await
                .unwrap();
        }
        store
            .set_if_absent("lock:account:live", "a", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.len(), 51);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            store
                .set_if_absent("lock:account:next", "b", Duration::from_secs(5))
                .await
                .unwrap()
        );

        assert_eq!(store.len(), 2);
        assert_eq!(store.live_locks(), 2);
        assert!(store.is_locked("lock:account:live"));
    }
}
