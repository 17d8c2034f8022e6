//! Commit-reveal purchase intents.
//!
//! A consumer first publishes `sha256(secret)`, then reveals `secret` when it
//! purchases. The target offer stays hidden until the purchase settles.

use crate::{
    error::{MarketError, Result},
    Address,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub type CommitmentHash = [u8; 32];

pub fn commitment_hash(secret: &[u8]) -> CommitmentHash {
    Sha256::digest(secret).into()
}

/// Fresh 32-byte secret for a purchase.
pub fn generate_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

pub fn parse_hash(value: &str) -> Result<CommitmentHash> {
    let bytes = hex::decode(value.trim_start_matches("0x"))?;
    bytes
        .try_into()
        .map_err(|_| MarketError::InputValidation("Commitment hash must be 32 bytes".to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    #[serde(with = "hex_hash")]
    pub hash: CommitmentHash,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CommitmentLedger {
    commitments: HashMap<Address, Commitment>,
}

impl CommitmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the consumer's commitment, returning the one it supersedes.
    pub fn commit(
        &mut self,
        consumer: Address,
        hash: CommitmentHash,
        at: DateTime<Utc>,
    ) -> Option<Commitment> {
        self.commitments.insert(consumer, Commitment { hash, committed_at: at })
    }

    /// Checks `sha256(secret)` against the stored commitment without consuming it.
    pub fn verify(&self, consumer: &Address, secret: &[u8]) -> Result<()> {
        match self.commitments.get(consumer) {
            Some(commitment) if commitment.hash == commitment_hash(secret) => Ok(()),
            _ => Err(MarketError::CommitmentMismatch(consumer.clone())),
        }
    }

    /// Drops a commitment after the purchase it guarded has settled.
    pub fn consume(&mut self, consumer: &Address) -> Option<Commitment> {
        self.commitments.remove(consumer)
    }

    pub fn get(&self, consumer: &Address) -> Option<&Commitment> {
        self.commitments.get(consumer)
    }

    pub fn len(&self) -> usize {
        self.commitments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commitments.is_empty()
    }
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let value = String::deserialize(deserializer)?;
        super::parse_hash(&value).map_err(serde::de::Error::custom)
    }
}
