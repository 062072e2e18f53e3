// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The ledger service: the one public contract for moving points.
//!
//! Composes the balance store and the transaction log into single atomic
//! operations. Action handlers call [`Ledger::spend`] before performing a
//! paid action; referral/purchase handlers call [`Ledger::earn`]. Nothing
//! else mutates balances or appends transactions.
//!
//! # Dual-write policy
//!
//! `spend` and `earn` write twice: balance first, then log. The balance
//! mutation is authoritative. A log append that fails after a successful
//! balance write is queued for backfill and the operation still reports
//! success; rolling back (or reporting failure) would invite the caller to
//! retry a charge that already landed, with no log record for the
//! idempotency guard to match against.
//!
//! # Invariants
//!
//! - A balance never goes negative.
//! - One transaction record per mutating operation; replays append nothing.
//! - The signed sum of a user's transactions equals their balance, except
//!   while a failed append sits in the backfill queue.

use crate::balance::{BalanceSnapshot, BalanceStore};
use crate::base::{TransactionId, UserId};
use crate::error::LedgerError;
use crate::transaction::{
    ActionType, Pagination, References, Transaction, TransactionFilter, TransactionPage,
    TransactionSummary,
};
use crate::transaction_log::TransactionLog;
use chrono::Utc;
use crossbeam::queue::SegQueue;
use std::thread;
use std::time::Duration;

/// Internal retries of a debit/credit that exhausted its CAS attempts.
const CONFLICT_RETRY_LIMIT: u32 = 8;

/// Base backoff between conflict retries; doubles each attempt.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(1);

/// Outcome of a successful `spend` or `earn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Balance after the operation (or the recorded post-state on replay).
    pub balance: i64,
    pub transaction_id: TransactionId,
    /// True when an idempotency key matched and nothing was re-debited.
    pub replayed: bool,
}

/// Points ledger service.
pub struct Ledger {
    balances: BalanceStore,
    log: TransactionLog,
    /// Records whose append failed after the balance write landed; drained
    /// by [`Ledger::flush_backfill`].
    pending: SegQueue<Transaction>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            balances: BalanceStore::new(),
            log: TransactionLog::new(),
            pending: SegQueue::new(),
        }
    }

    /// Provisions a user's balance row, optionally with a signup grant.
    ///
    /// A non-zero grant is recorded as an `earn` transaction so the ledger
    /// reconciles from the first row.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - negative grant.
    /// - [`LedgerError::UserExists`] - already provisioned.
    pub fn register_user(&self, user_id: UserId, signup_grant: i64) -> Result<i64, LedgerError> {
        let balance = self.balances.register(user_id, signup_grant)?;
        if signup_grant > 0 {
            self.record(Transaction {
                id: TransactionId::generate(),
                user_id,
                action_type: ActionType::Earn,
                amount: signup_grant,
                description: "signup grant".to_owned(),
                references: References::none(),
                balance_after: balance,
                created_at: Utc::now(),
            });
        }
        Ok(balance)
    }

    /// Removes a user's balance row (account deletion cascade).
    pub fn remove_user(&self, user_id: UserId) -> bool {
        self.balances.remove(user_id)
    }

    /// Authorizes and accounts for a paid action.
    ///
    /// The gated action must not start until this returns `Ok`; a refusal
    /// means the action is aborted. The idempotency key must be generated
    /// and persisted by the caller before invoking `spend`, so a retry after
    /// an ambiguous outcome replays instead of double-debiting.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - amount is zero or negative.
    /// - [`LedgerError::EmptyIdempotencyKey`] - unusable key.
    /// - [`LedgerError::IdempotencyKeyReuse`] - key bound to another user
    ///   or to a non-spend record.
    /// - [`LedgerError::UserNotFound`] - no balance row.
    /// - [`LedgerError::InsufficientBalance`] - refused; nothing appended.
    /// - [`LedgerError::Internal`] - storage gave out; safe to retry with
    ///   the same key once it recovers.
    pub fn spend(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
        idempotency_key: TransactionId,
        references: References,
    ) -> Result<Receipt, LedgerError> {
        if idempotency_key.is_empty() {
            return Err(LedgerError::EmptyIdempotencyKey);
        }
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }

        // Replay check before any debit attempt. A timed-out client retrying
        // with the same key must land here, not on a second debit.
        if let Some(existing) = self.log.get(&idempotency_key) {
            if existing.user_id != user_id || existing.action_type != ActionType::Spend {
                return Err(LedgerError::IdempotencyKeyReuse);
            }
            tracing::debug!(user = %user_id, key = %idempotency_key, "idempotent spend replay");
            return Ok(Receipt {
                balance: existing.balance_after,
                transaction_id: existing.id.clone(),
                replayed: true,
            });
        }

        let balance = self.with_conflict_retry(|| self.balances.try_debit(user_id, amount))?;

        self.record(Transaction {
            id: idempotency_key.clone(),
            user_id,
            action_type: ActionType::Spend,
            amount: -amount,
            description: description.to_owned(),
            references,
            balance_after: balance,
            created_at: Utc::now(),
        });

        Ok(Receipt {
            balance,
            transaction_id: idempotency_key,
            replayed: false,
        })
    }

    /// Credits a user and records the grant.
    ///
    /// `source_type` names where the credits came from and must be a credit
    /// kind. Credit and log land as a unit: a failed credit appends nothing.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidSourceType`] - `source_type` is `Spend`.
    /// - [`LedgerError::InvalidAmount`] / [`LedgerError::AmountOverflow`]
    /// - [`LedgerError::UserNotFound`]
    pub fn earn(
        &self,
        user_id: UserId,
        amount: i64,
        description: &str,
        source_type: ActionType,
        references: References,
    ) -> Result<Receipt, LedgerError> {
        if !source_type.is_credit() {
            return Err(LedgerError::InvalidSourceType);
        }
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let balance = self.with_conflict_retry(|| self.balances.credit(user_id, amount))?;

        let id = TransactionId::generate();
        self.record(Transaction {
            id: id.clone(),
            user_id,
            action_type: source_type,
            amount,
            description: description.to_owned(),
            references,
            balance_after: balance,
            created_at: Utc::now(),
        });

        Ok(Receipt {
            balance,
            transaction_id: id,
            replayed: false,
        })
    }

    /// Current balance. Unsynchronized snapshot; may trail an in-flight
    /// debit.
    pub fn balance_of(&self, user_id: UserId) -> Result<i64, LedgerError> {
        self.balances.credits(user_id)
    }

    pub fn balance_snapshot(&self, user_id: UserId) -> Result<BalanceSnapshot, LedgerError> {
        self.balances.snapshot(user_id)
    }

    /// Snapshots of every balance row, unordered.
    pub fn balance_snapshots(&self) -> Vec<BalanceSnapshot> {
        self.balances.snapshots()
    }

    /// One page of a user's history, newest first.
    pub fn list_transactions(
        &self,
        user_id: UserId,
        filter: &TransactionFilter,
        page: &Pagination,
    ) -> Result<TransactionPage, LedgerError> {
        if !self.balances.contains(user_id) {
            return Err(LedgerError::UserNotFound);
        }
        Ok(self.log.list(user_id, filter, page))
    }

    /// Per-kind totals for reporting. Not authoritative for the balance.
    pub fn summarize(&self, user_id: UserId) -> Result<TransactionSummary, LedgerError> {
        if !self.balances.contains(user_id) {
            return Err(LedgerError::UserNotFound);
        }
        Ok(self.log.summarize(user_id))
    }

    /// `balance - signed sum of transactions`. Zero except while an append
    /// sits in the backfill queue.
    pub fn reconciliation_drift(&self, user_id: UserId) -> Result<i64, LedgerError> {
        let balance = self.balances.credits(user_id)?;
        Ok(balance - self.log.signed_sum(user_id))
    }

    /// Re-appends records whose original append failed. Returns how many
    /// landed. Stops early if the log is still failing.
    pub fn flush_backfill(&self) -> usize {
        let mut flushed = 0;
        while let Some(tx) = self.pending.pop() {
            match self.log.append(tx.clone()) {
                Ok(_) => flushed += 1,
                Err(err) => {
                    tracing::warn!(error = %err, "backfill append still failing");
                    self.pending.push(tx);
                    break;
                }
            }
        }
        flushed
    }

    /// Number of records awaiting backfill.
    pub fn backfill_len(&self) -> usize {
        self.pending.len()
    }

    /// Appends, queueing for backfill on failure. The balance write this
    /// record describes has already landed and is never rolled back.
    fn record(&self, tx: Transaction) {
        if let Err(err) = self.log.append(tx.clone()) {
            tracing::warn!(
                error = %err,
                id = %tx.id,
                user = %tx.user_id,
                "transaction append failed after balance write; queued for backfill"
            );
            self.pending.push(tx);
        }
    }

    /// Retries an operation that reported a lost CAS race. Conflicts are an
    /// internal matter and never reach the caller; exhausting the retries
    /// maps to [`LedgerError::Internal`].
    fn with_conflict_retry(
        &self,
        op: impl Fn() -> Result<i64, LedgerError>,
    ) -> Result<i64, LedgerError> {
        for attempt in 0..CONFLICT_RETRY_LIMIT {
            match op() {
                Err(LedgerError::Conflict) => {
                    thread::sleep(CONFLICT_BACKOFF * 2u32.saturating_pow(attempt));
                }
                other => return other,
            }
        }
        Err(LedgerError::Internal)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}
