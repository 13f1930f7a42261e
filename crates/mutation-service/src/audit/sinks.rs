use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use tracing::info;

use super::{AuditEvent, AuditSink};
use crate::error::Result;

/// 以结构化日志输出审计事件
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        info!(
            target: "audit",
            action = event.action.as_str(),
            resource = %event.resource,
            detail = %event.detail,
            occurred_at = %event.occurred_at,
            "audit"
        );
        Ok(())
    }
}

/// 写入 audit_log 表
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (action, resource, detail, occurred_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.action.as_str())
        .bind(&event.resource)
        .bind(&event.detail)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// 内存收集，用于测试
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
