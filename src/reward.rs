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

//! Referral reward issuance on top of [`Ledger::earn`].
//!
//! Reward lifecycle:
//!
//  created ──grant──► Active ──consume──► Consumed
//!                       │
//!                       └──(now >= expires_at)──► Expired
//!
//! Granting credits the user and writes the reward record as one unit; a
//! failed earn records nothing. Expiry is checked on access and by the
//! [`RewardGranter::expire_due`] sweep. Records are never deleted, only
//! their status flips.

use crate::base::{RewardId, UserId};
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::transaction::{ActionType, References};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Where a reward is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Active,
    Expired,
    Consumed,
}

/// A time-bounded grant of credits tied to a triggering event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reward {
    pub id: RewardId,
    pub user_id: UserId,
    pub reward_type: String,
    pub reward_value: i64,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RewardStatus,
}

impl Reward {
    /// The activity flag surfaced to callers; only `Active` counts.
    pub fn is_active(&self) -> bool {
        matches!(self.status, RewardStatus::Active)
    }

    /// A ttl of zero expires at its own grant instant, so the boundary is
    /// inclusive.
    fn expired_by(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Issues referral rewards and tracks their lifecycle.
pub struct RewardGranter {
    ledger: Arc<Ledger>,
    rewards: DashMap<RewardId, Reward>,
    by_user: DashMap<UserId, RwLock<Vec<RewardId>>>,
}

impl RewardGranter {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            rewards: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Grants a referral reward: credits the user via `earn` and writes the
    /// reward record as one unit.
    ///
    /// A `ttl_seconds` of zero records the reward already expired and moves
    /// no credits; it can never be consumed.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - non-positive value.
    /// - [`LedgerError::UserNotFound`] - no balance row; nothing recorded.
    pub fn grant_referral_reward(
        &self,
        user_id: UserId,
        reward_type: &str,
        value: i64,
        ttl_seconds: u64,
    ) -> Result<Reward, LedgerError> {
        if value <= 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds as i64);

        let status = if ttl_seconds == 0 {
            RewardStatus::Expired
        } else {
            self.ledger.earn(
                user_id,
                value,
                &format!("referral reward: {reward_type}"),
                ActionType::ReferralReward,
                References::none(),
            )?;
            RewardStatus::Active
        };

        let reward = Reward {
            id: RewardId::generate(),
            user_id,
            reward_type: reward_type.to_owned(),
            reward_value: value,
            granted_at: now,
            expires_at,
            status,
        };
        self.insert(reward.clone());
        Ok(reward)
    }

    /// Marks an active reward's value as fully applied.
    ///
    /// The on-access expiry check runs first: an overdue reward flips to
    /// `Expired` and refuses.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::RewardNotFound`]
    /// - [`LedgerError::RewardExpired`]
    /// - [`LedgerError::RewardConsumed`]
    pub fn consume(&self, id: &RewardId) -> Result<Reward, LedgerError> {
        let mut entry = self.rewards.get_mut(id).ok_or(LedgerError::RewardNotFound)?;
        let reward = entry.value_mut();

        if reward.is_active() && reward.expired_by(Utc::now()) {
            reward.status = RewardStatus::Expired;
        }
        match reward.status {
            RewardStatus::Expired => Err(LedgerError::RewardExpired),
            RewardStatus::Consumed => Err(LedgerError::RewardConsumed),
            RewardStatus::Active => {
                reward.status = RewardStatus::Consumed;
                Ok(reward.clone())
            }
        }
    }

    /// Fetches a reward, applying the on-access expiry check.
    pub fn get(&self, id: &RewardId) -> Option<Reward> {
        let mut entry = self.rewards.get_mut(id)?;
        let reward = entry.value_mut();
        if reward.is_active() && reward.expired_by(Utc::now()) {
            reward.status = RewardStatus::Expired;
        }
        Some(reward.clone())
    }

    /// Flips every overdue active reward to `Expired`. Returns how many
    /// flipped. The background-check analog of the on-access path.
    pub fn expire_due(&self) -> usize {
        let now = Utc::now();
        let mut flipped = 0;
        for mut entry in self.rewards.iter_mut() {
            let reward = entry.value_mut();
            if reward.is_active() && reward.expired_by(now) {
                reward.status = RewardStatus::Expired;
                flipped += 1;
            }
        }
        flipped
    }

    /// A user's grants, newest first. Historical record; includes expired
    /// and consumed rewards.
    pub fn rewards_for(&self, user_id: UserId) -> Vec<Reward> {
        let Some(ids) = self.by_user.get(&user_id) else {
            return Vec::new();
        };
        ids.read()
            .iter()
            .rev()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    fn insert(&self, reward: Reward) {
        self.by_user
            .entry(reward.user_id)
            .or_default()
            .write()
            .push(reward.id.clone());
        self.rewards.insert(reward.id.clone(), reward);
    }
}
