use crate::{
    error::{MarketError, Result},
    model::{Amount, OfferId},
    services::Transfer,
    Address,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fee proportions are expressed in parts per this denominator.
pub const PARTS_DENOMINATOR: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub producer_parts: u32,
    pub oracle_parts: u32,
    pub pool_parts: u32,
}

impl FeeSchedule {
    pub fn new(producer_parts: u32, oracle_parts: u32, pool_parts: u32) -> Result<Self> {
        let schedule = Self {
            producer_parts,
            oracle_parts,
            pool_parts,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<()> {
        let named = self.producer_parts as u64 + self.oracle_parts as u64 + self.pool_parts as u64;
        if named > PARTS_DENOMINATOR as u64 {
            return Err(MarketError::Config(format!(
                "Fee parts sum to {}, above {}",
                named, PARTS_DENOMINATOR
            )));
        }
        Ok(())
    }

    /// Parts left over for the remainder beneficiary.
    pub fn remainder_parts(&self) -> u32 {
        PARTS_DENOMINATOR - self.producer_parts - self.oracle_parts - self.pool_parts
    }

    /// Splits `total` so that the four shares add up to it exactly. Every
    /// rounding remainder lands on the remainder beneficiary.
    pub fn split(&self, total: Amount) -> FeeSplit {
        let producer = share(total, self.producer_parts);
        let oracle = share(total, self.oracle_parts);
        let pool = share(total, self.pool_parts);
        FeeSplit {
            producer,
            oracle,
            pool,
            remainder: total - producer - oracle - pool,
        }
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            producer_parts: 750,
            oracle_parts: 200,
            pool_parts: 20,
        }
    }
}

/// `floor(total * parts / 1000)` without overflowing on large totals.
fn share(total: Amount, parts: u32) -> Amount {
    let denominator = PARTS_DENOMINATOR as Amount;
    let parts = parts as Amount;
    (total / denominator) * parts + (total % denominator) * parts / denominator
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub producer: Amount,
    pub oracle: Amount,
    pub pool: Amount,
    pub remainder: Amount,
}

impl FeeSplit {
    pub fn total(&self) -> Amount {
        self.producer + self.oracle + self.pool + self.remainder
    }
}

/// Who gets paid when a delivery is approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRecipients {
    pub producer: Address,
    pub oracle: Address,
    pub pool: Address,
    pub remainder: Address,
}

impl PayoutRecipients {
    pub fn legs(&self, split: &FeeSplit) -> Vec<Transfer> {
        vec![
            Transfer::new(self.producer.clone(), split.producer),
            Transfer::new(self.oracle.clone(), split.oracle),
            Transfer::new(self.pool.clone(), split.pool),
            Transfer::new(self.remainder.clone(), split.remainder),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowHold {
    pub offer_id: OfferId,
    pub buyer: Address,
    pub amount: Amount,
    pub held_at: DateTime<Utc>,
}

/// Sole owner of escrowed funds between purchase and distribution or refund.
#[derive(Debug, Clone, Default)]
pub struct EscrowManager {
    holds: HashMap<OfferId, EscrowHold>,
}

impl EscrowManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&mut self, hold: EscrowHold) -> Result<()> {
        if self.holds.contains_key(&hold.offer_id) {
            return Err(MarketError::InputValidation(format!(
                "Escrow already held for offer {}",
                hold.offer_id
            )));
        }
        tracing::debug!("Escrow hold of {} for offer {}", hold.amount, hold.offer_id);
        self.holds.insert(hold.offer_id, hold);
        Ok(())
    }

    pub fn get(&self, offer_id: OfferId) -> Option<&EscrowHold> {
        self.holds.get(&offer_id)
    }

    pub fn held(&self, offer_id: OfferId) -> Amount {
        self.holds.get(&offer_id).map(|hold| hold.amount).unwrap_or(0)
    }

    pub fn release(&mut self, offer_id: OfferId) -> Option<EscrowHold> {
        self.holds.remove(&offer_id)
    }

    pub fn total_held(&self) -> Amount {
        self.holds.values().map(|hold| hold.amount).sum()
    }
}
