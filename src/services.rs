//! Collaborators the engine consumes but does not own: the value-transfer
//! ledger, the reward-token ledger and the certificate registry.
//!
//! Mints go through reserve/commit/release so the engine can make them
//! atomic with its own state transition.

use crate::{
    deadline::Clock,
    error::MarketError,
    model::{Amount, CertificateId, OfferId},
    Address,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("insufficient balance for {account}: needed {needed}, available {available}")]
    InsufficientBalance {
        account: Address,
        needed: Amount,
        available: Amount,
    },

    #[error("daily production reward cap of {cap} exceeded")]
    DailyCapExceeded { cap: Amount },

    #[error("rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn into_market(self, service: &'static str) -> MarketError {
        MarketError::ExternalDependencyFailure {
            service,
            reason: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub to: Address,
    pub amount: Amount,
}

impl Transfer {
    pub fn new(to: Address, amount: Amount) -> Self {
        Self { to, amount }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ValueLedger: Send + Sync {
    /// Debits `from` once and credits every leg, or changes nothing.
    fn transfer_batch(&self, from: &Address, legs: &[Transfer]) -> Result<(), ServiceError>;

    fn balance_of(&self, account: &Address) -> Amount;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Production,
    Purchase,
    Sale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardReservation {
    pub id: Uuid,
    pub kind: RewardKind,
    pub to: Address,
    pub amount: Amount,
}

#[cfg_attr(test, mockall::automock)]
pub trait RewardLedger: Send + Sync {
    fn reserve(&self, kind: RewardKind, to: &Address, base_amount: Amount) -> Result<RewardReservation, ServiceError>;

    fn commit(&self, reservation: RewardReservation);

    fn release(&self, reservation: RewardReservation);

    fn balance_of(&self, account: &Address) -> Amount;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub offer_id: OfferId,
    pub to: Address,
    pub quantity: u64,
    pub energy_type: String,
    pub metadata_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateReservation {
    pub id: Uuid,
    pub request: CertificateRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: CertificateId,
    pub owner: Address,
    pub offer_id: OfferId,
    pub quantity: u64,
    pub energy_type: String,
    pub metadata_ref: String,
    pub issued_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
pub trait CertificateRegistry: Send + Sync {
    fn reserve(&self, request: CertificateRequest) -> Result<CertificateReservation, ServiceError>;

    fn commit(&self, reservation: CertificateReservation) -> CertificateId;

    fn release(&self, reservation: CertificateReservation);

    fn certificate(&self, id: CertificateId) -> Option<Certificate>;
}

/// Handles to every collaborator the engine calls.
#[derive(Clone)]
pub struct ExternalServices {
    pub value: Arc<dyn ValueLedger>,
    pub rewards: Arc<dyn RewardLedger>,
    pub certificates: Arc<dyn CertificateRegistry>,
}

#[derive(Debug, Default)]
pub struct InMemoryValueLedger {
    balances: Mutex<HashMap<Address, Amount>>,
}

impl InMemoryValueLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances(balances: impl IntoIterator<Item = (Address, Amount)>) -> Self {
        let ledger = Self::new();
        for (account, amount) in balances {
            ledger.deposit(&account, amount);
        }
        ledger
    }

    pub fn deposit(&self, account: &Address, amount: Amount) {
        *self.balances.lock().entry(account.clone()).or_insert(0) += amount;
    }
}

impl ValueLedger for InMemoryValueLedger {
    fn transfer_batch(&self, from: &Address, legs: &[Transfer]) -> Result<(), ServiceError> {
        let needed = legs
            .iter()
            .try_fold(0 as Amount, |acc, leg| acc.checked_add(leg.amount))
            .ok_or_else(|| ServiceError::Rejected("transfer total overflows".to_string()))?;

        let mut balances = self.balances.lock();
        let available = balances.get(from).copied().unwrap_or(0);
        if available < needed {
            return Err(ServiceError::InsufficientBalance {
                account: from.clone(),
                needed,
                available,
            });
        }

        balances.insert(from.clone(), available - needed);
        for leg in legs {
            *balances.entry(leg.to.clone()).or_insert(0) += leg.amount;
        }
        Ok(())
    }

    fn balance_of(&self, account: &Address) -> Amount {
        self.balances.lock().get(account).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct RewardBook {
    balances: HashMap<Address, Amount>,
    pending: HashMap<Uuid, RewardReservation>,
    production_log: VecDeque<(DateTime<Utc>, Amount)>,
}

impl RewardBook {
    fn production_in_window(&mut self, now: DateTime<Utc>) -> Amount {
        let window_start = now - Duration::hours(24);
        while matches!(self.production_log.front(), Some((at, _)) if *at <= window_start) {
            self.production_log.pop_front();
        }
        let minted: Amount = self.production_log.iter().map(|(_, amount)| amount).sum();
        let pending: Amount = self
            .pending
            .values()
            .filter(|r| r.kind == RewardKind::Production)
            .map(|r| r.amount)
            .sum();
        minted + pending
    }
}

/// Reward ledger with a rolling 24h cap on production rewards.
pub struct InMemoryRewardLedger {
    clock: Arc<dyn Clock>,
    daily_production_cap: Amount,
    book: Mutex<RewardBook>,
}

impl InMemoryRewardLedger {
    pub fn new(clock: Arc<dyn Clock>, daily_production_cap: Amount) -> Self {
        Self {
            clock,
            daily_production_cap,
            book: Mutex::new(RewardBook::default()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.book.lock().pending.len()
    }
}

impl RewardLedger for InMemoryRewardLedger {
    fn reserve(&self, kind: RewardKind, to: &Address, base_amount: Amount) -> Result<RewardReservation, ServiceError> {
        let mut book = self.book.lock();
        if kind == RewardKind::Production {
            let used = book.production_in_window(self.clock.now());
            if used.saturating_add(base_amount) > self.daily_production_cap {
                return Err(ServiceError::DailyCapExceeded {
                    cap: self.daily_production_cap,
                });
            }
        }

        let reservation = RewardReservation {
            id: Uuid::new_v4(),
            kind,
            to: to.clone(),
            amount: base_amount,
        };
        book.pending.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    fn commit(&self, reservation: RewardReservation) {
        let mut book = self.book.lock();
        let Some(pending) = book.pending.remove(&reservation.id) else {
            tracing::warn!("Commit of unknown reward reservation {}", reservation.id);
            return;
        };
        if pending.kind == RewardKind::Production {
            let now = self.clock.now();
            book.production_log.push_back((now, pending.amount));
        }
        *book.balances.entry(pending.to).or_insert(0) += pending.amount;
    }

    fn release(&self, reservation: RewardReservation) {
        self.book.lock().pending.remove(&reservation.id);
    }

    fn balance_of(&self, account: &Address) -> Amount {
        self.book.lock().balances.get(account).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct CertificateBook {
    last_id: CertificateId,
    pending: HashMap<Uuid, CertificateRequest>,
    issued: BTreeMap<CertificateId, Certificate>,
}

pub struct InMemoryCertificateRegistry {
    clock: Arc<dyn Clock>,
    book: Mutex<CertificateBook>,
}

impl InMemoryCertificateRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            book: Mutex::new(CertificateBook::default()),
        }
    }

    pub fn certificates_of(&self, owner: &Address) -> Vec<Certificate> {
        self.book
            .lock()
            .issued
            .values()
            .filter(|c| &c.owner == owner)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.book.lock().pending.len()
    }
}

impl CertificateRegistry for InMemoryCertificateRegistry {
    fn reserve(&self, request: CertificateRequest) -> Result<CertificateReservation, ServiceError> {
        if request.metadata_ref.is_empty() {
            return Err(ServiceError::Rejected("certificate metadata reference is empty".to_string()));
        }
        let reservation = CertificateReservation {
            id: Uuid::new_v4(),
            request,
        };
        self.book.lock().pending.insert(reservation.id, reservation.request.clone());
        Ok(reservation)
    }

    fn commit(&self, reservation: CertificateReservation) -> CertificateId {
        let mut book = self.book.lock();
        book.pending.remove(&reservation.id);
        book.last_id += 1;
        let id = book.last_id;
        let request = reservation.request;
        book.issued.insert(
            id,
            Certificate {
                id,
                owner: request.to,
                offer_id: request.offer_id,
                quantity: request.quantity,
                energy_type: request.energy_type,
                metadata_ref: request.metadata_ref,
                issued_at: self.clock.now(),
            },
        );
        id
    }

    fn release(&self, reservation: CertificateReservation) {
        self.book.lock().pending.remove(&reservation.id);
    }

    fn certificate(&self, id: CertificateId) -> Option<Certificate> {
        self.book.lock().issued.get(&id).cloned()
    }
}
