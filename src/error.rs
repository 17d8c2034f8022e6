use thiserror::Error;
use crate::model::{Amount, OfferId, OfferState};
use crate::Address;

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    #[error("Invalid input: {0}")]
    InputValidation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Offer {offer_id} is {actual}, expected {expected}")]
    StateMismatch {
        offer_id: OfferId,
        expected: OfferState,
        actual: OfferState,
    },

    #[error("Payment mismatch: expected {expected}, got {provided}")]
    PaymentMismatch { expected: Amount, provided: Amount },

    #[error("Revealed secret does not match the commitment of {0}")]
    CommitmentMismatch(Address),

    #[error("Validation deadline for offer {offer_id} passed {overdue_secs}s ago; use the deadline refund")]
    DeadlineExceeded { offer_id: OfferId, overdue_secs: i64 },

    #[error("Validation deadline for offer {offer_id} has {remaining_secs}s remaining")]
    DeadlineNotReached { offer_id: OfferId, remaining_secs: i64 },

    #[error("Marketplace is paused")]
    Paused,

    #[error("External dependency failed ({service}): {reason}")]
    ExternalDependencyFailure { service: &'static str, reason: String },

    #[error("Offer not found: {0}")]
    OfferNotFound(OfferId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl MarketError {
    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::InputValidation(_) => "input_validation",
            MarketError::Unauthorized(_) => "unauthorized",
            MarketError::StateMismatch { .. } => "state_mismatch",
            MarketError::PaymentMismatch { .. } => "payment_mismatch",
            MarketError::CommitmentMismatch(_) => "commitment_mismatch",
            MarketError::DeadlineExceeded { .. } => "deadline_exceeded",
            MarketError::DeadlineNotReached { .. } => "deadline_not_reached",
            MarketError::Paused => "paused",
            MarketError::ExternalDependencyFailure { .. } => "external_dependency_failure",
            MarketError::OfferNotFound(_) => "offer_not_found",
            MarketError::Config(_) => "config",
            MarketError::Serialization(_) => "serialization",
            MarketError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MarketError {
    fn from(err: toml::de::Error) -> Self {
        MarketError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for MarketError {
    fn from(err: toml::ser::Error) -> Self {
        MarketError::Config(err.to_string())
    }
}

impl From<std::io::Error> for MarketError {
    fn from(err: std::io::Error) -> Self {
        MarketError::Io(err.to_string())
    }
}

impl From<hex::FromHexError> for MarketError {
    fn from(err: hex::FromHexError) -> Self {
        MarketError::InputValidation(format!("invalid hex: {}", err))
    }
}
