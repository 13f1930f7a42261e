//! 审计事件
//!
//! 变更提交后产生一条审计事件。投递是尽力而为的：失败只记录日志与指标，
//! 绝不会让已经提交的变更变成失败。

mod sinks;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use playhub_shared::observability::metrics::names;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::models::ResourceKey;

pub use sinks::{MemoryAuditSink, PgAuditSink, TracingAuditSink};

/// 审计动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Credit,
    Debit,
    Transfer,
    IncrementPlayCount,
    UpdateRating,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::Transfer => "transfer",
            Self::IncrementPlayCount => "increment_play_count",
            Self::UpdateRating => "update_rating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub resource: String,
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, resource: &ResourceKey, detail: serde_json::Value) -> Self {
        Self {
            action,
            resource: resource.to_string(),
            detail,
            occurred_at: Utc::now(),
        }
    }
}

/// 审计事件接收端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// 投递审计事件，失败只记录
pub async fn emit(sink: &Arc<dyn AuditSink>, event: AuditEvent) {
    if let Err(err) = sink.record(&event).await {
        counter!(names::AUDIT_FAILURES_TOTAL, "action" => event.action.as_str()).increment(1);
        warn!(
            action = event.action.as_str(),
            resource = %event.resource,
            error = %err,
            "审计事件投递失败"
        );
    }
}
