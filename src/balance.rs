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

//! Authoritative per-user balance with atomic conditional mutation.
//!
//! The correctness hazard this module exists for: a naive read-compare-write
//! debit lets two concurrent spenders both observe a sufficient balance and
//! both write, driving the balance negative. [`Balance::try_debit`] instead
//! performs the check and the decrement as one `compare_exchange`, so under
//! any interleaving of N concurrent debits the set that succeeds is exactly
//! what some serial ordering would have admitted.
//!
//! Different users' balances are independent rows in a [`DashMap`]; there is
//! no cross-user coordination and no global lock.

use crate::base::UserId;
use crate::error::LedgerError;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// CAS attempts before a debit or credit reports [`LedgerError::Conflict`].
/// The ledger service retries conflicts with backoff; callers never see them.
const MAX_CAS_ATTEMPTS: u32 = 64;

/// One user's balance row.
///
/// `credits` is the single authoritative word; `updated_at_ms` trails it and
/// is informational only.
#[derive(Debug)]
pub struct Balance {
    user_id: UserId,
    credits: AtomicI64,
    updated_at_ms: AtomicI64,
}

impl Balance {
    fn new(user_id: UserId, credits: i64, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            credits: AtomicI64::new(credits),
            updated_at_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.updated_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn credits(&self) -> i64 {
        self.credits.load(Ordering::Acquire)
    }

    /// Decrements `credits` by `amount` only if `credits >= amount`.
    ///
    /// Returns the new balance on success. A lost race re-reads and retries;
    /// an observed shortfall refuses immediately.
    fn try_debit(&self, amount: i64) -> Result<i64, LedgerError> {
        let mut current = self.credits.load(Ordering::Acquire);
        for _ in 0..MAX_CAS_ATTEMPTS {
            if current < amount {
                return Err(LedgerError::InsufficientBalance);
            }
            let next = current - amount;
            match self.credits.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug_assert!(next >= 0, "debit drove balance negative: {next}");
                    self.touch();
                    return Ok(next);
                }
                Err(observed) => {
                    current = observed;
                    std::hint::spin_loop();
                }
            }
        }
        Err(LedgerError::Conflict)
    }

    /// Unconditional addition, with the same CAS discipline so a concurrent
    /// debit is never partially observed.
    fn credit(&self, amount: i64) -> Result<i64, LedgerError> {
        let mut current = self.credits.load(Ordering::Acquire);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let next = current
                .checked_add(amount)
                .ok_or(LedgerError::AmountOverflow)?;
            match self.credits.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.touch();
                    return Ok(next);
                }
                Err(observed) => {
                    current = observed;
                    std::hint::spin_loop();
                }
            }
        }
        Err(LedgerError::Conflict)
    }

    fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            user_id: self.user_id,
            credits: self.credits(),
            updated_at: Utc
                .timestamp_millis_opt(self.updated_at_ms.load(Ordering::Acquire))
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Point-in-time view of a balance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub user_id: UserId,
    pub credits: i64,
    pub updated_at: DateTime<Utc>,
}

/// Store of all balance rows, keyed by user.
///
/// Rows are created at provisioning and mutated only through the ledger
/// service; nothing else holds a reference to the counters.
#[derive(Debug, Default)]
pub struct BalanceStore {
    balances: DashMap<UserId, Balance>,
}

impl BalanceStore {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
        }
    }

    /// Creates the balance row for a user.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - negative initial credits.
    /// - [`LedgerError::UserExists`] - row already present.
    pub fn register(&self, user_id: UserId, initial_credits: i64) -> Result<i64, LedgerError> {
        if initial_credits < 0 {
            return Err(LedgerError::InvalidAmount);
        }
        match self.balances.entry(user_id) {
            Entry::Occupied(_) => Err(LedgerError::UserExists),
            Entry::Vacant(entry) => {
                entry.insert(Balance::new(user_id, initial_credits, Utc::now()));
                Ok(initial_credits)
            }
        }
    }

    /// Removes a balance row (account deletion cascade).
    pub fn remove(&self, user_id: UserId) -> bool {
        self.balances.remove(&user_id).is_some()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.balances.contains_key(&user_id)
    }

    /// Atomic conditional debit. See [`Balance::try_debit`].
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - amount is zero or negative.
    /// - [`LedgerError::UserNotFound`] - no row for the user.
    /// - [`LedgerError::InsufficientBalance`] - debit refused.
    /// - [`LedgerError::Conflict`] - CAS attempts exhausted under contention.
    pub fn try_debit(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let balance = self
            .balances
            .get(&user_id)
            .ok_or(LedgerError::UserNotFound)?;
        balance.try_debit(amount)
    }

    /// Unconditional credit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - amount is zero or negative.
    /// - [`LedgerError::UserNotFound`] - no row for the user.
    /// - [`LedgerError::AmountOverflow`] - credit would overflow `i64`.
    pub fn credit(&self, user_id: UserId, amount: i64) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let balance = self
            .balances
            .get(&user_id)
            .ok_or(LedgerError::UserNotFound)?;
        balance.credit(amount)
    }

    /// Unsynchronized snapshot read; may trail an in-flight debit.
    pub fn credits(&self, user_id: UserId) -> Result<i64, LedgerError> {
        self.balances
            .get(&user_id)
            .map(|b| b.credits())
            .ok_or(LedgerError::UserNotFound)
    }

    pub fn snapshot(&self, user_id: UserId) -> Result<BalanceSnapshot, LedgerError> {
        self.balances
            .get(&user_id)
            .map(|b| b.snapshot())
            .ok_or(LedgerError::UserNotFound)
    }

    /// Snapshots of every row, unordered.
    pub fn snapshots(&self) -> Vec<BalanceSnapshot> {
        self.balances.iter().map(|entry| entry.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}
