//! 资源键
//!
//! 分布式锁以资源键为粒度。键的全序（先命名空间，再数值 id）
//! 同时也是多资源加锁的全局顺序，用于消除循环等待。

use std::fmt;

/// 资源命名空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceNamespace {
    Account,
    GameStats,
}

impl ResourceNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::GameStats => "game_stats",
        }
    }
}

/// 受保护资源的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub namespace: ResourceNamespace,
    pub id: i64,
}

impl ResourceKey {
    pub fn account(id: i64) -> Self {
        Self {
            namespace: ResourceNamespace::Account,
            id,
        }
    }

    pub fn game_stats(id: i64) -> Self {
        Self {
            namespace: ResourceNamespace::GameStats,
            id,
        }
    }

    /// 锁存储中的 key
    pub fn lock_key(&self) -> String {
        format!("lock:{}", self)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace.as_str(), self.id)
    }
}
