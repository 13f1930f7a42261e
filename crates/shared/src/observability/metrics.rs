//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::config::ObservabilityConfig;

/// 并发变更核心使用的指标名
pub mod names {
    pub const MUTATIONS_TOTAL: &str = "mutation_total";
    pub const MUTATION_DURATION_SECONDS: &str = "mutation_duration_seconds";
    pub const LOCK_ACQUIRE_TOTAL: &str = "lock_acquire_total";
    pub const LOCK_LOST_TOTAL: &str = "lock_lost_total";
    pub const TX_ATTEMPTS_TOTAL: &str = "transaction_attempts_total";
    pub const AUDIT_FAILURES_TOTAL: &str = "audit_failures_total";
}

/// 初始化 Prometheus 指标导出
///
/// 安装全局 recorder，并在指定端口暴露 `/metrics` 端点（需在 tokio 运行时内调用）。
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name)
        .install()?;

    register_common_metrics(service_name);
    info!("Metrics exporter listening on {}", addr);

    Ok(())
}

/// 注册通用指标描述
///
/// 这些描述会出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        names::MUTATIONS_TOTAL,
        "Guarded mutations by resource namespace and outcome"
    );
    metrics::describe_histogram!(
        names::MUTATION_DURATION_SECONDS,
        "End-to-end duration of guarded mutations in seconds"
    );
    metrics::describe_counter!(
        names::LOCK_ACQUIRE_TOTAL,
        "Distributed lock acquisition attempts by outcome"
    );
    metrics::describe_counter!(
        names::LOCK_LOST_TOTAL,
        "Locks that expired or changed owner before release"
    );
    metrics::describe_counter!(
        names::TX_ATTEMPTS_TOTAL,
        "Transaction attempts by outcome"
    );
    metrics::describe_counter!(
        names::AUDIT_FAILURES_TOTAL,
        "Audit events that could not be delivered"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}
