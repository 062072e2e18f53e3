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

//! # Points Ledger
//!
//! This library provides the points/credits ledger of a lead-management
//! product: a per-user balance that gates paid actions (AI replies, bulk
//! sends, analyses). Every gated action atomically verifies sufficient
//! balance, deducts it, and records an auditable transaction, and does so
//! correctly when many actions for the same user race concurrently.
//!
//! ## Core Components
//!
//! - [`Ledger`]: The public contract — `spend`, `earn`, `balance_of`,
//!   `list_transactions` — composing balance store and transaction log
//! - [`BalanceStore`]: Authoritative per-user balance with atomic
//!   conditional debit
//! - [`TransactionLog`]: Append-only history, idempotent on transaction id
//! - [`RewardGranter`]: Referral reward issuance with expiry windows
//! - [`LedgerError`]: Typed refusals and failures
//!
//! ## Example
//!
//! ```
//! use points_ledger::{Ledger, References, TransactionId, UserId};
//!
//! let ledger = Ledger::new();
//! ledger.register_user(UserId(1), 100).unwrap();
//!
//! // Authorize a paid action before performing it
//! let receipt = ledger
//!     .spend(UserId(1), 5, "AI reply", TransactionId::from("req-1"), References::none())
//!     .unwrap();
//! assert_eq!(receipt.balance, 95);
//!
//! // A retried request with the same key charges exactly once
//! let replay = ledger
//!     .spend(UserId(1), 5, "AI reply", TransactionId::from("req-1"), References::none())
//!     .unwrap();
//! assert_eq!(replay.balance, 95);
//! assert!(replay.replayed);
//! ```
//!
//! ## Thread Safety
//!
//! Debits are compare-and-swap operations on per-user atomics: under any
//! interleaving of concurrent spends the balance never goes negative and
//! the admitted subset matches some serial ordering. Different users never
//! contend.

pub mod balance;
mod base;
pub mod error;
mod ledger;
pub mod reward;
mod transaction;
mod transaction_log;

pub use balance::{BalanceSnapshot, BalanceStore};
pub use base::{RewardId, TransactionId, UserId};
pub use error::LedgerError;
pub use ledger::{Ledger, Receipt};
pub use reward::{Reward, RewardGranter, RewardStatus};
pub use transaction::{
    ActionType, Pagination, References, Transaction, TransactionFilter, TransactionPage,
    TransactionSummary,
};
pub use transaction_log::{AppendOutcome, TransactionLog};
