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

//! Error types for ledger operations.

use thiserror::Error;

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Credit would overflow the balance
    #[error("amount overflows balance")]
    AmountOverflow,

    /// Idempotency key is empty
    #[error("empty idempotency key")]
    EmptyIdempotencyKey,

    /// Idempotency key already bound to a different user or operation
    #[error("idempotency key already used by another operation")]
    IdempotencyKeyReuse,

    /// No balance row exists for the user
    #[error("user not found")]
    UserNotFound,

    /// A balance row already exists for the user
    #[error("user already registered")]
    UserExists,

    /// Debit refused: it would take the balance negative
    #[error("insufficient points balance")]
    InsufficientBalance,

    /// Lost a compare-and-swap race; retried internally, never surfaced
    #[error("balance update conflict")]
    Conflict,

    /// Source type is not a credit kind
    #[error("source type cannot credit a balance")]
    InvalidSourceType,

    /// Referenced reward does not exist
    #[error("reward not found")]
    RewardNotFound,

    /// Reward expired before it could be consumed
    #[error("reward has expired")]
    RewardExpired,

    /// Reward value was already fully applied
    #[error("reward already consumed")]
    RewardConsumed,

    /// Storage layer unreachable or exhausted retries
    #[error("ledger storage unavailable")]
    Internal,
}

impl LedgerError {
    /// Whether retrying the same call (with the same idempotency key) can
    /// possibly succeed once conditions change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict | LedgerError::Internal)
    }
}
