use serde::{Deserialize, Serialize};

/// 积分账户
///
/// `balance` 恒为非负，只能经由 LedgerService 修改。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub balance: i64,
}

impl Account {
    pub fn new(id: i64, balance: i64) -> Self {
        Self { id, balance }
    }
}
