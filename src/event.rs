use crate::{
    access::Role,
    escrow::FeeSplit,
    model::{Amount, CertificateId, OfferId},
    Address,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Rejected,
    DeadlineExpired,
}

/// Lifecycle events, one per committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Created {
        offer_id: OfferId,
        producer: Address,
        quantity: u64,
        price_per_unit: Amount,
        energy_type: String,
    },
    Validated {
        offer_id: OfferId,
        oracle: Address,
        approved: bool,
        metadata_ref: Option<String>,
    },
    Cancelled {
        offer_id: OfferId,
        producer: Address,
    },
    CommitmentPlaced {
        consumer: Address,
        superseded: bool,
    },
    Purchased {
        offer_id: OfferId,
        buyer: Address,
        amount: Amount,
    },
    Distributed {
        offer_id: OfferId,
        oracle: Address,
        split: FeeSplit,
        certificate_id: Option<CertificateId>,
    },
    Refunded {
        offer_id: OfferId,
        buyer: Address,
        amount: Amount,
        reason: RefundReason,
    },
    Paused {
        by: Address,
    },
    Unpaused {
        by: Address,
    },
    RoleGranted {
        role: Role,
        account: Address,
        by: Address,
    },
    RoleRevoked {
        role: Role,
        account: Address,
        by: Address,
    },
}

impl MarketEvent {
    pub fn offer_id(&self) -> Option<OfferId> {
        match self {
            MarketEvent::Created { offer_id, .. }
            | MarketEvent::Validated { offer_id, .. }
            | MarketEvent::Cancelled { offer_id, .. }
            | MarketEvent::Purchased { offer_id, .. }
            | MarketEvent::Distributed { offer_id, .. }
            | MarketEvent::Refunded { offer_id, .. } => Some(*offer_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: MarketEvent,
}

/// Append-only event log; `seq` starts at 1.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    pub fn push(&mut self, at: DateTime<Utc>, event: MarketEvent) -> u64 {
        let seq = self.records.len() as u64 + 1;
        self.records.push(EventRecord { seq, at, event });
        seq
    }

    /// Records with `seq > since`.
    pub fn since(&self, since: u64) -> Vec<EventRecord> {
        let start = usize::try_from(since).unwrap_or(usize::MAX).min(self.records.len());
        self.records[start..].to_vec()
    }

    pub fn last_seq(&self) -> u64 {
        self.records.len() as u64
    }
}
