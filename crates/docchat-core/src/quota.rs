//! Quota accounting rules.
//!
//! Pure state transitions on a [`QuotaAccount`]. Each returns the next
//! version of the account (version bumped) without touching storage; the
//! application's `QuotaLedger` packages the result into a [`QuotaCommit`]
//! and hands it to [`Store::commit_quota`](crate::store::Store::commit_quota),
//! which applies it only if the stored version still matches.

use serde::Serialize;

use crate::error::{DocChatError, Result};
use crate::models::{now_ts, QuotaAccount, Reservation, ReservationState, UsageEntry};

impl QuotaAccount {
    /// Provisionally charge `estimated` tokens.
    ///
    /// Fails with [`DocChatError::QuotaExceeded`] when
    /// `consumed + estimated > allocated`.
    pub fn try_reserve(&self, estimated: i64) -> Result<QuotaAccount> {
        if estimated < 0 {
            return Err(DocChatError::Validation(format!(
                "estimated cost must be >= 0, got {}",
                estimated
            )));
        }
        if self.consumed + estimated > self.allocated {
            return Err(DocChatError::QuotaExceeded {
                user_id: self.user_id.clone(),
                requested: estimated,
                remaining: self.remaining(),
            });
        }
        Ok(self.next(self.allocated, self.consumed + estimated))
    }

    /// Replace a reservation's estimate with the actual cost. May push
    /// `consumed` above `allocated`.
    pub fn apply_reconcile(&self, estimated: i64, actual: i64) -> QuotaAccount {
        self.next(self.allocated, self.consumed + (actual - estimated))
    }

    /// Reverse a reservation entirely.
    pub fn apply_release(&self, estimated: i64) -> QuotaAccount {
        self.next(self.allocated, self.consumed - estimated)
    }

    /// Admin change to the allocation. The result may not go below zero.
    pub fn apply_adjustment(&self, delta: i64) -> Result<QuotaAccount> {
        let allocated = self.allocated + delta;
        if allocated < 0 {
            return Err(DocChatError::Validation(format!(
                "allocation for {} would become {} (< 0)",
                self.user_id, allocated
            )));
        }
        Ok(self.next(allocated, self.consumed))
    }

    fn next(&self, allocated: i64, consumed: i64) -> QuotaAccount {
        QuotaAccount {
            user_id: self.user_id.clone(),
            allocated,
            consumed,
            version: self.version + 1,
            updated_at: now_ts(),
        }
    }
}

/// Change to a reservation record made in the same atomic commit as the
/// account update.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationChange {
    None,
    /// Record a new outstanding reservation.
    Create(Reservation),
    /// Move an outstanding reservation to a settled state. The commit fails
    /// if the reservation is no longer outstanding.
    Settle { id: String, to: ReservationState },
}

/// One optimistic quota write.
///
/// A store applies it atomically and only when the stored account version is
/// still `expected_version` (and, for `Settle`, the reservation is still
/// outstanding). Otherwise nothing is written.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCommit {
    pub expected_version: u64,
    pub account: QuotaAccount,
    pub reservation: ReservationChange,
    pub usage: Option<UsageEntry>,
}

/// Read-only view of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaBalance {
    pub user_id: String,
    pub allocated: i64,
    pub consumed: i64,
    pub remaining: i64,
    pub version: u64,
}

impl From<&QuotaAccount> for QuotaBalance {
    fn from(a: &QuotaAccount) -> Self {
        Self {
            user_id: a.user_id.clone(),
            allocated: a.allocated,
            consumed: a.consumed,
            remaining: a.remaining(),
            version: a.version,
        }
    }
}

/// What `consumed` must equal given a user's reservations: reconciled
/// actual costs plus outstanding estimates.
pub fn expected_consumed(reservations: &[Reservation]) -> i64 {
    reservations
        .iter()
        .map(|r| match r.state {
            ReservationState::Outstanding => r.estimated,
            ReservationState::Reconciled { actual } => actual,
            ReservationState::Released => 0,
        })
        .sum()
}
