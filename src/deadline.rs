use crate::{
    error::{MarketError, Result},
    model::OfferId,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Validation window for reserved offers.
///
/// Delivery can be validated while `now - purchased_at <= deadline`; the
/// permissionless refund opens strictly after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineMonitor {
    deadline: Duration,
}

impl DeadlineMonitor {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::seconds(secs as i64))
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// `None` when the expiry lies beyond the representable time range.
    pub fn expires_at(&self, purchased_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        purchased_at.checked_add_signed(self.deadline)
    }

    pub fn is_open(&self, purchased_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - purchased_at <= self.deadline
    }

    pub fn ensure_open(&self, offer_id: OfferId, purchased_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if self.is_open(purchased_at, now) {
            return Ok(());
        }
        Err(MarketError::DeadlineExceeded {
            offer_id,
            overdue_secs: self
                .expires_at(purchased_at)
                .map_or(0, |expires_at| (now - expires_at).num_seconds()),
        })
    }

    pub fn ensure_expired(&self, offer_id: OfferId, purchased_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        if !self.is_open(purchased_at, now) {
            return Ok(());
        }
        Err(MarketError::DeadlineNotReached {
            offer_id,
            remaining_secs: self
                .expires_at(purchased_at)
                .map_or(i64::MAX, |expires_at| (expires_at - now).num_seconds()),
        })
    }
}
