use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 流水类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    /// 获得积分（+）
    Earn,
    /// 消耗积分（-）
    Spend,
    /// 转入（+）
    TransferIn,
    /// 转出（-）
    TransferOut,
}

impl EntryKind {
    /// 该类型的金额符号
    pub fn sign(&self) -> i64 {
        match self {
            Self::Earn | Self::TransferIn => 1,
            Self::Spend | Self::TransferOut => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earn => "EARN",
            Self::Spend => "SPEND",
            Self::TransferIn => "TRANSFER_IN",
            Self::TransferOut => "TRANSFER_OUT",
        }
    }
}

/// 积分流水
///
/// 只追加、不可变。`(account_id, source, source_ref)` 唯一，作为幂等键。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: i64,
    /// 带符号金额
    pub amount: i64,
    pub kind: EntryKind,
    pub source: String,
    pub source_ref: String,
    pub resulting_balance: i64,
    pub created_at: DateTime<Utc>,
}

/// 待写入的流水
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub account_id: i64,
    pub amount: i64,
    pub kind: EntryKind,
    pub source: String,
    pub source_ref: String,
    pub resulting_balance: i64,
}

impl NewLedgerEntry {
    /// 按流水类型给金额加上符号
    pub fn new(
        account_id: i64,
        kind: EntryKind,
        magnitude: i64,
        source: impl Into<String>,
        source_ref: impl Into<String>,
        resulting_balance: i64,
    ) -> Self {
        Self {
            account_id,
            amount: kind.sign() * magnitude,
            kind,
            source: source.into(),
            source_ref: source_ref.into(),
            resulting_balance,
        }
    }
}

/// 记账结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReceipt {
    pub entry_id: i64,
    pub account_id: i64,
    pub balance: i64,
    /// 命中幂等键、返回的是此前已完成的结果
    pub replayed: bool,
}

impl LedgerReceipt {
    pub fn from_entry(entry: &LedgerEntry, replayed: bool) -> Self {
        Self {
            entry_id: entry.id,
            account_id: entry.account_id,
            balance: entry.resulting_balance,
            replayed,
        }
    }
}

/// 转账结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub transfer_ref: String,
    pub from: LedgerReceipt,
    pub to: LedgerReceipt,
}
