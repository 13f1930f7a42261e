//! 积分账本服务
//!
//! 账户余额的全部写入都经过这里：
//!
//! - 入账 / 扣减：单账户读-改-写，每次写入一条流水
//! - 转账：两个账户在同一事务中完成，要么都生效要么都不生效
//!
//! ## 幂等
//!
//! `(account_id, source, source_ref)` 唯一确定一次请求，分三层保证：
//!
//! 1. 锁外快速查询，命中直接返回先前的回执
//! 2. 行锁内再次查询，消除并发重复请求之间的竞态
//! 3. 数据库唯一约束兜底，冲突时按已存在的流水返回

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::audit::{self, AuditAction, AuditEvent, AuditSink};
use crate::error::{MutationError, Result};
use crate::models::{
    Account, EntryKind, LedgerEntry, LedgerReceipt, NewLedgerEntry, ResourceKey, TransferReceipt,
};
use crate::mutator::{ConcurrentMutator, Mutation};
use crate::runner::TxWork;
use crate::store::{StoreTx, TxStore};

/// 转账流水使用的 source，普通入账与扣减不可使用
pub const TRANSFER_SOURCE: &str = "transfer";

const MAX_SOURCE_LEN: usize = 64;
const MAX_SOURCE_REF_LEN: usize = 128;
pub const MAX_HISTORY_LIMIT: i64 = 500;

/// 积分账本服务
pub struct LedgerService<S: TxStore> {
    mutator: Arc<ConcurrentMutator<S>>,
    audit: Arc<dyn AuditSink>,
}

impl<S: TxStore> LedgerService<S> {
    pub fn new(mutator: Arc<ConcurrentMutator<S>>, audit: Arc<dyn AuditSink>) -> Self {
        Self { mutator, audit }
    }

    fn store(&self) -> &S {
        self.mutator.store()
    }

    /// 入账
    #[instrument(skip(self))]
    pub async fn credit(
        &self,
        account_id: i64,
        amount: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<LedgerReceipt> {
        self.post(EntryKind::Earn, account_id, amount, source, source_ref)
            .await
    }

    /// 扣减，余额不足时返回 InsufficientBalance 且余额不变
    #[instrument(skip(self))]
    pub async fn debit(
        &self,
        account_id: i64,
        amount: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<LedgerReceipt> {
        self.post(EntryKind::Spend, account_id, amount, source, source_ref)
            .await
    }

    async fn post(
        &self,
        kind: EntryKind,
        account_id: i64,
        amount: i64,
        source: &str,
        source_ref: &str,
    ) -> Result<LedgerReceipt> {
        validate_amount(amount)?;
        validate_source(source)?;
        validate_source_ref(source_ref)?;

        // 1. 锁外幂等检查
        if let Some(entry) = self.store().find_entry(account_id, source, source_ref).await? {
            info!(account_id, source, source_ref, "幂等请求，返回已存在的流水");
            return Ok(LedgerReceipt::from_entry(&entry, true));
        }

        // 2. 锁内读-改-写
        let mutation = PostEntry {
            account_id,
            kind,
            amount,
            source,
            source_ref,
        };
        let result = self
            .mutator
            .apply(&mutation, None, |balance: &i64| {
                next_balance(kind, *balance, amount)
            })
            .await;

        // 3. 唯一约束冲突按已存在的流水返回
        let receipt = match result {
            Err(err @ MutationError::DuplicateEntry { .. }) => {
                return match self.store().find_entry(account_id, source, source_ref).await? {
                    Some(entry) => Ok(LedgerReceipt::from_entry(&entry, true)),
                    None => Err(err),
                };
            }
            other => other?,
        };

        if receipt.replayed {
            return Ok(receipt);
        }

        info!(
            account_id,
            kind = kind.as_str(),
            amount,
            balance = receipt.balance,
            entry_id = receipt.entry_id,
            "流水已记账"
        );

        let action = match kind {
            EntryKind::Spend => AuditAction::Debit,
            _ => AuditAction::Credit,
        };
        audit::emit(
            &self.audit,
            AuditEvent::new(
                action,
                &ResourceKey::account(account_id),
                json!({
                    "entry_id": receipt.entry_id,
                    "amount": kind.sign() * amount,
                    "source": source,
                    "source_ref": source_ref,
                    "balance": receipt.balance,
                }),
            ),
        )
        .await;

        Ok(receipt)
    }

    /// 转账，自动生成转账流水号
    pub async fn transfer(&self, from: i64, to: i64, amount: i64) -> Result<TransferReceipt> {
        let transfer_ref = Uuid::now_v7().to_string();
        self.transfer_with_ref(from, to, amount, &transfer_ref)
            .await
    }

    /// 使用调用方提供的幂等键转账
    ///
    /// 两个账户的分布式锁与行锁都按账户 ID 升序获取，反向并发转账不会互相等待成环。
    #[instrument(skip(self))]
    pub async fn transfer_with_ref(
        &self,
        from: i64,
        to: i64,
        amount: i64,
        transfer_ref: &str,
    ) -> Result<TransferReceipt> {
        if from == to {
            return Err(MutationError::Validation(
                "cannot transfer to the same account".to_string(),
            ));
        }
        validate_amount(amount)?;
        validate_source_ref(transfer_ref)?;

        if let Some(receipt) = self.find_transfer(from, to, amount, transfer_ref).await? {
            info!(from, to, transfer_ref, "幂等请求，返回已存在的转账");
            return Ok(receipt);
        }

        let work = TransferWork {
            from,
            to,
            amount,
            transfer_ref,
        };
        let result = self
            .mutator
            .run_exclusive(
                &[ResourceKey::account(from), ResourceKey::account(to)],
                None,
                &work,
            )
            .await;

        let receipt = match result {
            Err(err @ MutationError::DuplicateEntry { .. }) => {
                return match self.find_transfer(from, to, amount, transfer_ref).await? {
                    Some(receipt) => Ok(receipt),
                    None => Err(err),
                };
            }
            other => other?,
        };

        if receipt.from.replayed {
            return Ok(receipt);
        }

        info!(
            from,
            to,
            amount,
            transfer_ref,
            from_balance = receipt.from.balance,
            to_balance = receipt.to.balance,
            "转账完成"
        );

        audit::emit(
            &self.audit,
            AuditEvent::new(
                AuditAction::Transfer,
                &ResourceKey::account(from),
                json!({
                    "to": to,
                    "amount": amount,
                    "transfer_ref": transfer_ref,
                    "from_balance": receipt.from.balance,
                    "to_balance": receipt.to.balance,
                }),
            ),
        )
        .await;

        Ok(receipt)
    }

    /// 查询余额
    pub async fn get_balance(&self, account_id: i64) -> Result<i64> {
        self.store()
            .account(account_id)
            .await?
            .map(|a| a.balance)
            .ok_or(MutationError::NotFound {
                entity: "account",
                id: account_id,
            })
    }

    /// 最近的流水，按时间倒序
    #[instrument(skip(self))]
    pub async fn history(&self, account_id: i64, limit: i64) -> Result<Vec<LedgerEntry>> {
        if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(MutationError::Validation(format!(
                "limit must be between 1 and {MAX_HISTORY_LIMIT}"
            )));
        }
        self.get_balance(account_id).await?;
        self.store().list_entries(account_id, limit).await
    }

    /// 按幂等键查找已完成的转账；键已被方向或金额不同的转账占用时返回 DuplicateEntry
    async fn find_transfer(
        &self,
        from: i64,
        to: i64,
        amount: i64,
        transfer_ref: &str,
    ) -> Result<Option<TransferReceipt>> {
        let Some(out) = self
            .store()
            .find_entry(from, TRANSFER_SOURCE, transfer_ref)
            .await?
        else {
            return Ok(None);
        };
        let Some(incoming) = self
            .store()
            .find_entry(to, TRANSFER_SOURCE, transfer_ref)
            .await?
        else {
            return Ok(None);
        };
        replayed_transfer(from, amount, transfer_ref, &out, &incoming).map(Some)
    }
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(MutationError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

fn validate_source(source: &str) -> Result<()> {
    if source.trim().is_empty() || source.len() > MAX_SOURCE_LEN {
        return Err(MutationError::Validation(format!(
            "source must be 1-{MAX_SOURCE_LEN} characters"
        )));
    }
    if source == TRANSFER_SOURCE {
        return Err(MutationError::Validation(format!(
            "source '{TRANSFER_SOURCE}' is reserved for transfers"
        )));
    }
    Ok(())
}

fn validate_source_ref(source_ref: &str) -> Result<()> {
    if source_ref.trim().is_empty() || source_ref.len() > MAX_SOURCE_REF_LEN {
        return Err(MutationError::Validation(format!(
            "source_ref must be 1-{MAX_SOURCE_REF_LEN} characters"
        )));
    }
    Ok(())
}

/// 按流水类型计算新余额
fn next_balance(kind: EntryKind, balance: i64, amount: i64) -> Result<i64> {
    match kind {
        EntryKind::Spend | EntryKind::TransferOut => {
            if balance < amount {
                return Err(MutationError::InsufficientBalance {
                    required: amount,
                    available: balance,
                });
            }
            Ok(balance - amount)
        }
        EntryKind::Earn | EntryKind::TransferIn => balance
            .checked_add(amount)
            .ok_or_else(|| MutationError::Validation("balance overflow".to_string())),
    }
}

/// 已存在的两条流水必须与本次请求的方向、金额一致才算重放
fn replayed_transfer(
    from: i64,
    amount: i64,
    transfer_ref: &str,
    out: &LedgerEntry,
    incoming: &LedgerEntry,
) -> Result<TransferReceipt> {
    let same_request = out.kind == EntryKind::TransferOut
        && incoming.kind == EntryKind::TransferIn
        && out.amount == -amount
        && incoming.amount == amount;
    if !same_request {
        return Err(MutationError::DuplicateEntry {
            account_id: from,
            source_name: TRANSFER_SOURCE.to_string(),
            source_ref: transfer_ref.to_string(),
        });
    }
    Ok(transfer_receipt(transfer_ref, out, incoming, true))
}

fn transfer_receipt(
    transfer_ref: &str,
    out: &LedgerEntry,
    incoming: &LedgerEntry,
    replayed: bool,
) -> TransferReceipt {
    TransferReceipt {
        transfer_ref: transfer_ref.to_string(),
        from: LedgerReceipt::from_entry(out, replayed),
        to: LedgerReceipt::from_entry(incoming, replayed),
    }
}

async fn lock_account<T: StoreTx>(tx: &mut T, id: i64) -> Result<Account> {
    tx.lock_account(id).await?.ok_or(MutationError::NotFound {
        entity: "account",
        id,
    })
}

/// 单账户入账/扣减
struct PostEntry<'a> {
    account_id: i64,
    kind: EntryKind,
    amount: i64,
    source: &'a str,
    source_ref: &'a str,
}

#[async_trait]
impl<'a, T: StoreTx> Mutation<T> for PostEntry<'a> {
    type Value = i64;
    type Output = LedgerReceipt;

    fn resource(&self) -> ResourceKey {
        ResourceKey::account(self.account_id)
    }

    async fn replay(&self, tx: &mut T) -> Result<Option<LedgerReceipt>> {
        let entry = tx
            .find_entry(self.account_id, self.source, self.source_ref)
            .await?;
        Ok(entry.map(|e| LedgerReceipt::from_entry(&e, true)))
    }

    async fn load(&self, tx: &mut T) -> Result<i64> {
        Ok(lock_account(tx, self.account_id).await?.balance)
    }

    async fn store(&self, tx: &mut T, _current: &i64, next: i64) -> Result<LedgerReceipt> {
        tx.set_balance(self.account_id, next).await?;
        let entry = tx
            .insert_entry(&NewLedgerEntry::new(
                self.account_id,
                self.kind,
                self.amount,
                self.source,
                self.source_ref,
                next,
            ))
            .await?;
        Ok(LedgerReceipt::from_entry(&entry, false))
    }
}

/// 两账户转账
struct TransferWork<'a> {
    from: i64,
    to: i64,
    amount: i64,
    transfer_ref: &'a str,
}

#[async_trait]
impl<'a, T: StoreTx> TxWork<T> for TransferWork<'a> {
    type Output = TransferReceipt;

    async fn run(&self, tx: &mut T) -> Result<TransferReceipt> {
        // 行锁按账户 ID 升序获取
        let (low, high) = if self.from < self.to {
            (self.from, self.to)
        } else {
            (self.to, self.from)
        };
        let low_account = lock_account(tx, low).await?;
        let high_account = lock_account(tx, high).await?;
        let (source, target) = if self.from == low {
            (low_account, high_account)
        } else {
            (high_account, low_account)
        };

        let replayed_out = tx
            .find_entry(self.from, TRANSFER_SOURCE, self.transfer_ref)
            .await?;
        if let Some(out) = replayed_out {
            if let Some(incoming) = tx
                .find_entry(self.to, TRANSFER_SOURCE, self.transfer_ref)
                .await?
            {
                return replayed_transfer(
                    self.from,
                    self.amount,
                    self.transfer_ref,
                    &out,
                    &incoming,
                );
            }
        }

        let from_balance = next_balance(EntryKind::TransferOut, source.balance, self.amount)?;
        let to_balance = next_balance(EntryKind::TransferIn, target.balance, self.amount)?;

        tx.set_balance(self.from, from_balance).await?;
        tx.set_balance(self.to, to_balance).await?;

        let out = tx
            .insert_entry(&NewLedgerEntry::new(
                self.from,
                EntryKind::TransferOut,
                self.amount,
                TRANSFER_SOURCE,
                self.transfer_ref,
                from_balance,
            ))
            .await?;
        let incoming = tx
            .insert_entry(&NewLedgerEntry::new(
                self.to,
                EntryKind::TransferIn,
                self.amount,
                TRANSFER_SOURCE,
                self.transfer_ref,
                to_balance,
            ))
            .await?;

        Ok(transfer_receipt(self.transfer_ref, &out, &incoming, false))
    }
}
