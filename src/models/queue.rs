//! Spool entries and their delivery lifecycle.

use super::Photo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery state of a spooled photo.
///
/// ```text
/// pending ──next_pending──▶ delivering ──mark_delivered──▶ delivered
///    ▲                          │
///    └──mark_failed(transient)──┤
///       release / restart       └──mark_failed(permanent)──▶ failed_permanent
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting for delivery.
    Pending,
    /// Handed to the upload client; never survives a restart.
    Delivering,
    /// Acknowledged by the receiver. Terminal: the spool drops the row and
    /// only counts it.
    Delivered,
    /// Rejected by the receiver; payload retained for the operator.
    FailedPermanent,
}

impl DeliveryState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Delivering,
        Self::Delivered,
        Self::FailedPermanent,
    ];

    /// Returns the storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::FailedPermanent => "failed_permanent",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown delivery state: {s}")))
    }
}

/// A photo held by the spool together with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    seq: i64,
    photo: Photo,
    state: DeliveryState,
    attempts: u32,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub(crate) const fn new(
        seq: i64,
        photo: Photo,
        state: DeliveryState,
        attempts: u32,
        last_error: Option<String>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq,
            photo,
            state,
            attempts,
            last_error,
            enqueued_at,
        }
    }

    /// Capture-order sequence number.
    #[must_use]
    pub const fn seq(&self) -> i64 {
        self.seq
    }

    /// The spooled photo.
    #[must_use]
    pub const fn photo(&self) -> &Photo {
        &self.photo
    }

    /// Delivery state at the time this entry was read.
    #[must_use]
    pub const fn state(&self) -> DeliveryState {
        self.state
    }

    /// Failed delivery attempts so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reason of the most recent failed attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// When the entry was written to the spool.
    #[must_use]
    pub const fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }
}
