//! 变更核心错误类型
//!
//! 按处理方式划分错误：校验与业务错误就近返回，不进入重试；
//! 瞬时存储错误只在 TransactionRunner 内部重试；基础设施错误立即上抛。

use std::time::Duration;

use thiserror::Error;

/// 瞬时存储错误的具体类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Deadlock,
    SerializationFailure,
    LockWaitTimeout,
    StatementTimeout,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deadlock => "deadlock detected",
            Self::SerializationFailure => "serialization failure",
            Self::LockWaitTimeout => "lock wait timeout",
            Self::StatementTimeout => "statement timeout",
        };
        f.write_str(s)
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 参数不合法，永远不会因重试而成功
    Validation,
    /// 业务规则拒绝（余额不足、资源不存在），面向用户
    BusinessRule,
    /// 资源被占用，由调用方按策略决定是否重试
    LockBusy,
    /// 存储层竞争，仅在事务执行器内部重试
    Transient,
    /// 存储不可达等基础设施故障
    Infrastructure,
}

/// 变更核心错误类型
#[derive(Debug, Error)]
pub enum MutationError {
    // === 校验错误 ===
    #[error("参数校验失败: {0}")]
    Validation(String),

    // === 业务错误 ===
    #[error("余额不足: 需要 {required}, 可用 {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("重复的流水记录: account_id={account_id}, source={source_name}, source_ref={source_ref}")]
    DuplicateEntry {
        account_id: i64,
        source_name: String,
        source_ref: String,
    },

    // === 并发控制 ===
    #[error("资源被占用: {resource}")]
    LockBusy { resource: String },

    #[error("锁存储不可用: {0}")]
    LockStoreUnavailable(String),

    #[error("瞬时存储错误 ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("重试 {attempts} 次后仍失败: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("操作超时: {operation} 超过 {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    // === 系统错误 ===
    #[error("数据库错误: {0}")]
    Database(sqlx::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 变更核心 Result 类型别名
pub type Result<T> = std::result::Result<T, MutationError>;

impl MutationError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InsufficientBalance { .. } | Self::NotFound { .. } | Self::DuplicateEntry { .. } => {
                ErrorKind::BusinessRule
            }
            Self::LockBusy { .. } => ErrorKind::LockBusy,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::LockStoreUnavailable(_)
            | Self::RetriesExhausted { .. }
            | Self::Timeout { .. }
            | Self::Database(_)
            | Self::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// 是否为事务执行器可以内部重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// 调用方是否可以在退避后重新发起请求
    ///
    /// 仅 LockBusy 与重试耗尽属于此类；瞬时错误已在内部重试过，不会出现在公开接口上。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockBusy { .. } | Self::RetriesExhausted { .. })
    }

    /// 检查是否为业务错误（非系统错误）
    pub fn is_business_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::BusinessRule)
    }

    /// 获取错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DuplicateEntry { .. } => "DUPLICATE_ENTRY",
            Self::LockBusy { .. } => "LOCK_BUSY",
            Self::LockStoreUnavailable(_) => "LOCK_STORE_UNAVAILABLE",
            Self::Transient { .. } => "TRANSIENT_STORE_ERROR",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }
}

/// PostgreSQL SQLSTATE
mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
}

impl From<sqlx::Error> for MutationError {
    /// 按 SQLSTATE 区分瞬时竞争与真正的数据库故障
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
            _ => None,
        };

        let transient_kind = match code.as_deref() {
            Some(sqlstate::DEADLOCK_DETECTED) => Some(TransientKind::Deadlock),
            Some(sqlstate::SERIALIZATION_FAILURE) => Some(TransientKind::SerializationFailure),
            Some(sqlstate::LOCK_NOT_AVAILABLE) => Some(TransientKind::LockWaitTimeout),
            Some(sqlstate::QUERY_CANCELED) => Some(TransientKind::StatementTimeout),
            _ => None,
        };

        if let Some(kind) = transient_kind {
            return Self::transient(kind, err.to_string());
        }

        match code.as_deref() {
            // 调用方持有上下文时会改写为带字段的 DuplicateEntry，这里只做兜底
            Some(sqlstate::UNIQUE_VIOLATION) => Self::DuplicateEntry {
                account_id: 0,
                source_name: String::new(),
                source_ref: err.to_string(),
            },
            Some(sqlstate::CHECK_VIOLATION) => Self::InsufficientBalance {
                required: 0,
                available: 0,
            },
            _ => Self::Database(err),
        }
    }
}
