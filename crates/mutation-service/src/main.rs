//! 并发变更核心服务进程
//!
//! 加载配置、连接存储、执行迁移并装配变更核心，作为上层业务接口的宿主进程。

use anyhow::Result;
use playhub_shared::{config::AppConfig, database::Database, observability};
use tokio::signal;
use tracing::info;

use playhub_mutation::{MIGRATOR, MutationContext};

const SERVICE_NAME: &str = "playhub-mutation";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME)?;

    // 2. 初始化可观测性
    let _guard = observability::init(&config.service_name, &config.observability)?;
    info!(environment = %config.environment, "Starting {}...", SERVICE_NAME);

    // 3. 数据库连接与迁移
    let db = Database::connect(&config.database).await?;
    db.run_migrations(&MIGRATOR).await?;
    info!("Database connection established");

    // 4. 装配变更核心
    let context = MutationContext::build(&config, &db).await?;
    db.health_check().await?;
    info!(
        lock_backend = context.locks.backend(),
        "{} is ready", SERVICE_NAME
    );

    // 5. 等待退出信号
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    db.close().await;
    Ok(())
}
