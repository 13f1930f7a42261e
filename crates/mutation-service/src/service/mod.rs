//! 服务层
//!
//! 业务模块通过这里的两个服务修改共享状态，不直接操作存储。
//!
//! - `ledger_service`: 积分入账、扣减、转账与流水查询
//! - `counter_service`: 游玩次数与评分

pub mod counter_service;
pub mod ledger_service;

pub use counter_service::CounterService;
pub use ledger_service::{LedgerService, MAX_HISTORY_LIMIT, TRANSFER_SOURCE};
