//! 并发安全变更核心
//!
//! 多实例部署下，对共享数值状态（账户余额、游戏统计）执行读-改-写时，
//! 保证不丢失更新、不出现非法中间态、幂等请求只生效一次。
//!
//! ## 核心功能
//!
//! - **分布式锁**：跨实例互斥，令牌化释放，TTL 兜底
//! - **事务执行**：隔离级别与超时设置，瞬时错误自动重试，任何路径都归还连接
//! - **受保护变更**：锁 → 事务 → 行锁读取 → 计算 → 写回 → 提交 → 释放
//! - **积分账本**：入账、扣减、转账，流水只追加
//! - **统计计数**：游玩次数与评分均值
//!
//! ## 模块结构
//!
//! - `models`: 领域模型定义
//! - `error`: 错误类型定义
//! - `lock`: 分布式锁模块
//! - `store`: 关系存储抽象与实现
//! - `runner`: 事务执行器
//! - `mutator`: 受保护的读-改-写
//! - `service`: 账本与计数服务
//! - `audit`: 审计事件
//! - `bootstrap`: 组件装配

pub mod audit;
pub mod bootstrap;
pub mod error;
pub mod lock;
pub mod models;
pub mod mutator;
pub mod runner;
pub mod service;
pub mod store;

pub use audit::{AuditAction, AuditEvent, AuditSink};
pub use bootstrap::{MIGRATOR, MutationContext};
pub use error::{ErrorKind, MutationError, Result, TransientKind};
pub use lock::{LockConfig, LockCoordinator, LockGuard, LockSet, LockStore};
pub use models::*;
pub use mutator::{ConcurrentMutator, Mutation, MutatorConfig};
pub use runner::{TransactionRunner, TxWork};
pub use service::{CounterService, LedgerService};
pub use store::{IsolationLevel, MemoryStore, PgStore, StoreTx, TxOptions, TxStore};
