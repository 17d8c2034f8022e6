//! # Energy Escrow - peer-to-peer energy offers with oracle-validated escrow
//!
//! Producers list energy offers, oracles attest to them, consumers buy them
//! through a commit-reveal purchase and payments sit in escrow until an oracle
//! validates delivery.
//!
//! ## Architecture
//!
//! - **Marketplace**: the single-lock engine driving the offer state machine
//! - **Access**: role membership, capability checks and the global pause flag
//! - **Commitments**: one outstanding `sha256(secret)` per consumer
//! - **Escrow**: held payments and the parts-per-1000 fee split
//! - **Services**: value ledger, reward ledger and certificate registry seams,
//!   with reserve/commit/release semantics for mints
//! - **API**: axum router exposing the engine over HTTP

pub mod access;
pub mod api;
pub mod commitment;
pub mod config;
pub mod deadline;
pub mod error;
pub mod escrow;
pub mod event;
pub mod market;
pub mod model;
pub mod registry;
pub mod services;

pub use access::{AccessControl, Role, RolePolicy};
pub use config::AppConfig;
pub use deadline::{Clock, ManualClock, SystemClock};
pub use error::{MarketError, Result};
pub use escrow::{FeeSchedule, FeeSplit};
pub use event::{EventRecord, MarketEvent};
pub use market::{MarketSettings, Marketplace, ValidationOutcome};
pub use model::{Address, Amount, CertificateId, Offer, OfferId, OfferState, UNIT};
pub use services::{
    ExternalServices, InMemoryCertificateRegistry, InMemoryRewardLedger, InMemoryValueLedger,
};
