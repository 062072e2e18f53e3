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

//! Transaction records and the query types for reading them back.
//!
//! A [`Transaction`] is immutable once appended. Its `amount` is signed:
//! negative for spends, positive for every credit kind. `balance_after`
//! captures the post-operation balance so an idempotent replay can answer
//! from the log without touching the balance store.

use crate::base::{TransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What moved the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Spend,
    Earn,
    Purchase,
    Subscription,
    Refund,
    ReferralReward,
}

impl ActionType {
    /// Credit kinds add to the balance; only `Spend` debits it.
    pub fn is_credit(&self) -> bool {
        !matches!(self, ActionType::Spend)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Spend => "spend",
            ActionType::Earn => "earn",
            ActionType::Purchase => "purchase",
            ActionType::Subscription => "subscription",
            ActionType::Refund => "refund",
            ActionType::ReferralReward => "referral_reward",
        }
    }
}

/// Optional links from a transaction to the domain objects that caused it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct References {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

impl References {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Immutable record of one balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub action_type: ActionType,
    /// Signed; negative for spend.
    pub amount: i64,
    pub description: String,
    pub references: References,
    /// Balance immediately after this mutation landed.
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// Filters for listing a user's transactions.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub action_type: Option<ActionType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        if let Some(action_type) = self.action_type {
            if tx.action_type != action_type {
                return false;
            }
        }
        if let Some(from) = self.from {
            if tx.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if tx.created_at > to {
                return false;
            }
        }
        true
    }
}

/// Offset/limit pagination. The limit is caller-supplied but clamped.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Pagination {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 100;

    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.min(Self::MAX_LIMIT),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

/// One page of a user's history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub items: Vec<Transaction>,
    /// Count of all records matching the filter, not just this page.
    pub total: usize,
}

/// Signed amounts folded per action kind. Reporting only; the balance store
/// stays authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    /// Magnitude of all spend debits.
    pub total_spent: i64,
    /// Credits from earn, refund, and referral rewards.
    pub total_earned: i64,
    /// Credits from purchases and subscriptions.
    pub total_purchased: i64,
}

impl TransactionSummary {
    pub fn accumulate(&mut self, tx: &Transaction) {
        match tx.action_type {
            ActionType::Spend => self.total_spent += tx.amount.abs(),
            ActionType::Earn | ActionType::Refund | ActionType::ReferralReward => {
                self.total_earned += tx.amount;
            }
            ActionType::Purchase | ActionType::Subscription => {
                self.total_purchased += tx.amount;
            }
        }
    }

    /// Net signed effect of everything summarized.
    pub fn net(&self) -> i64 {
        self.total_earned + self.total_purchased - self.total_spent
    }
}
