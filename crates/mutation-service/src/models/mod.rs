//! 领域模型
//!
//! 变更核心只更新已存在的 Account / GameStats 行，从不创建或删除；
//! LedgerEntry 只追加，不修改。

mod account;
mod keys;
mod ledger;
mod stats;

pub use account::Account;
pub use keys::{ResourceKey, ResourceNamespace};
pub use ledger::{EntryKind, LedgerEntry, LedgerReceipt, NewLedgerEntry, TransferReceipt};
pub use stats::{GameStats, MAX_RATING, MIN_RATING};
