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

//! Append-only transaction log, idempotent on transaction id.
//!
//! Appending a transaction whose id already exists is a no-op that hands
//! back the stored record; this is what makes retried spends safe. Lookups
//! by id and per-user range scans are served from two indexes over shared
//! [`Arc<Transaction>`]s.

use crate::base::{TransactionId, UserId};
use crate::error::LedgerError;
use crate::transaction::{
    Pagination, Transaction, TransactionFilter, TransactionPage, TransactionSummary,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::sync::Arc;

/// What an append did.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// First write for this id.
    Recorded(Arc<Transaction>),
    /// Id already present; the stored record, untouched.
    Replayed(Arc<Transaction>),
}

impl AppendOutcome {
    pub fn record(&self) -> &Arc<Transaction> {
        match self {
            AppendOutcome::Recorded(tx) | AppendOutcome::Replayed(tx) => tx,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, AppendOutcome::Replayed(_))
    }
}

/// Concurrent append-only log with per-user ordering.
///
/// `by_id` gives O(1) idempotency checks via the entry API's atomic
/// check-and-insert; `by_user` keeps each user's records in insertion order,
/// which is also `created_at` order, for range queries.
#[derive(Debug, Default)]
pub struct TransactionLog {
    by_id: DashMap<TransactionId, Arc<Transaction>>,
    by_user: DashMap<UserId, RwLock<Vec<Arc<Transaction>>>>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Appends a transaction, or replays the existing record for its id.
    ///
    /// The `Result` is part of the storage contract: a backing store can
    /// fail, and the ledger service queues the record for backfill when it
    /// does. The in-memory log itself always succeeds.
    pub fn append(&self, tx: Transaction) -> Result<AppendOutcome, LedgerError> {
        match self.by_id.entry(tx.id.clone()) {
            Entry::Occupied(entry) => Ok(AppendOutcome::Replayed(Arc::clone(entry.get()))),
            Entry::Vacant(entry) => {
                let user_id = tx.user_id;
                let tx = Arc::new(tx);
                entry.insert(Arc::clone(&tx));
                self.by_user
                    .entry(user_id)
                    .or_default()
                    .write()
                    .push(Arc::clone(&tx));
                Ok(AppendOutcome::Recorded(tx))
            }
        }
    }

    pub fn get(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.by_id.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// One page of a user's history, newest first.
    ///
    /// `total` counts every record matching the filter, so callers can page
    /// past the first window.
    pub fn list(
        &self,
        user_id: UserId,
        filter: &TransactionFilter,
        page: &Pagination,
    ) -> TransactionPage {
        let Some(rows) = self.by_user.get(&user_id) else {
            return TransactionPage {
                items: Vec::new(),
                total: 0,
            };
        };
        let rows = rows.read();

        let mut total = 0usize;
        let mut items = Vec::with_capacity(page.limit.min(rows.len()));
        for tx in rows.iter().rev().filter(|tx| filter.matches(tx)) {
            if total >= page.offset && items.len() < page.limit {
                items.push((**tx).clone());
            }
            total += 1;
        }

        TransactionPage { items, total }
    }

    /// Aggregates signed amounts per action kind. Never authoritative for
    /// the balance; the balance store is.
    pub fn summarize(&self, user_id: UserId) -> TransactionSummary {
        let mut summary = TransactionSummary::default();
        if let Some(rows) = self.by_user.get(&user_id) {
            for tx in rows.read().iter() {
                summary.accumulate(tx);
            }
        }
        summary
    }

    /// Signed sum of every record for a user. Used by reconciliation checks.
    pub fn signed_sum(&self, user_id: UserId) -> i64 {
        self.by_user
            .get(&user_id)
            .map(|rows| rows.read().iter().map(|tx| tx.amount).sum())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
