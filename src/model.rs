use crate::{MarketError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Native value in its smallest unit (18 decimals).
pub type Amount = u128;

/// One whole unit of native value.
pub const UNIT: Amount = 1_000_000_000_000_000_000;

pub type CertificateId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(MarketError::InputValidation("Address cannot be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferId(pub u64);

impl fmt::Display for OfferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    PendingCreation,
    Active,
    Reserved,
    Completed,
    Refunded,
    Cancelled,
}

impl OfferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OfferState::Completed | OfferState::Refunded | OfferState::Cancelled)
    }

    pub fn can_transition_to(self, next: OfferState) -> bool {
        use OfferState::*;
        matches!(
            (self, next),
            (PendingCreation, Active)
                | (PendingCreation, Cancelled)
                | (Active, Reserved)
                | (Reserved, Completed)
                | (Reserved, Refunded)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OfferState::PendingCreation => "pending_creation",
            OfferState::Active => "active",
            OfferState::Reserved => "reserved",
            OfferState::Completed => "completed",
            OfferState::Refunded => "refunded",
            OfferState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OfferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OfferState {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending_creation" => Ok(OfferState::PendingCreation),
            "active" => Ok(OfferState::Active),
            "reserved" => Ok(OfferState::Reserved),
            "completed" => Ok(OfferState::Completed),
            "refunded" => Ok(OfferState::Refunded),
            "cancelled" => Ok(OfferState::Cancelled),
            other => Err(MarketError::InputValidation(format!("Unknown offer state: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub producer: Address,
    pub quantity: u64,
    pub price_per_unit: Amount,
    pub energy_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: OfferState,
    pub buyer: Option<Address>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub metadata_ref: Option<String>,
    pub certificate_id: Option<CertificateId>,
}

impl Offer {
    pub fn new(
        id: OfferId,
        producer: Address,
        quantity: u64,
        price_per_unit: Amount,
        energy_type: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            producer,
            quantity,
            price_per_unit,
            energy_type,
            created_at,
            updated_at: created_at,
            state: OfferState::PendingCreation,
            buyer: None,
            purchased_at: None,
            metadata_ref: None,
            certificate_id: None,
        }
    }

    /// Exact payment a buyer must attach: `quantity * price_per_unit`.
    pub fn total_price(&self) -> Result<Amount> {
        total_price(self.quantity, self.price_per_unit)
    }

    pub fn expect_state(&self, expected: OfferState) -> Result<()> {
        if self.state != expected {
            return Err(MarketError::StateMismatch {
                offer_id: self.id,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub fn transition(&mut self, next: OfferState, at: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MarketError::StateMismatch {
                offer_id: self.id,
                expected: next,
                actual: self.state,
            });
        }
        self.state = next;
        self.updated_at = at;
        Ok(())
    }
}

pub fn total_price(quantity: u64, price_per_unit: Amount) -> Result<Amount> {
    Amount::from(quantity)
        .checked_mul(price_per_unit)
        .ok_or_else(|| MarketError::InputValidation("Total price overflows".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferLimits {
    pub max_quantity: u64,
    pub max_price: Amount,
    pub max_energy_type_len: usize,
}

impl OfferLimits {
    pub fn check(&self, quantity: u64, price_per_unit: Amount, energy_type: &str) -> Result<()> {
        if quantity == 0 {
            return Err(MarketError::InputValidation("Quantity must be greater than 0".to_string()));
        }
        if quantity > self.max_quantity {
            return Err(MarketError::InputValidation(format!(
                "Quantity {} exceeds maximum {}",
                quantity, self.max_quantity
            )));
        }
        if price_per_unit == 0 {
            return Err(MarketError::InputValidation("Price must be greater than 0".to_string()));
        }
        if price_per_unit > self.max_price {
            return Err(MarketError::InputValidation(format!(
                "Price {} exceeds maximum {}",
                price_per_unit, self.max_price
            )));
        }
        if energy_type.is_empty() {
            return Err(MarketError::InputValidation("Energy type cannot be empty".to_string()));
        }
        if energy_type.len() > self.max_energy_type_len {
            return Err(MarketError::InputValidation(format!(
                "Energy type exceeds {} bytes",
                self.max_energy_type_len
            )));
        }
        total_price(quantity, price_per_unit)?;
        Ok(())
    }
}

impl Default for OfferLimits {
    fn default() -> Self {
        Self {
            max_quantity: 1_000_000,
            max_price: UNIT,
            max_energy_type_len: 32,
        }
    }
}
