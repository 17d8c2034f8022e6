//! The offer escrow engine.
//!
//! Every mutating entry point runs under one lock, checks the pause flag and
//! the caller's capability, asserts the offer's source state, and only then
//! touches collaborators. Mints are reserved first, the value transfer runs
//! next, and reservations are committed only once nothing else can fail.

use crate::{
    access::{AccessControl, Role, RolePolicy},
    commitment::{Commitment, CommitmentHash, CommitmentLedger},
    config::AppConfig,
    deadline::{Clock, DeadlineMonitor},
    error::{MarketError, Result},
    escrow::{EscrowHold, EscrowManager, FeeSchedule, FeeSplit, PayoutRecipients},
    event::{EventLog, EventRecord, MarketEvent, RefundReason},
    model::{total_price, Address, Amount, CertificateId, Offer, OfferId, OfferLimits, OfferState},
    registry::OfferRegistry,
    services::{
        CertificateRequest, CertificateReservation, ExternalServices, RewardKind, RewardReservation, Transfer,
    },
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct MarketSettings {
    pub limits: OfferLimits,
    pub deadline: DeadlineMonitor,
    pub fees: FeeSchedule,
    pub escrow_account: Address,
    pub platform_pool: Address,
    pub remainder_beneficiary: Address,
    pub production_reward_per_unit: Amount,
    pub purchase_reward: Amount,
    pub sale_reward: Amount,
}

impl MarketSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            limits: config.offer_limits(),
            deadline: DeadlineMonitor::from_secs(config.market.validation_deadline_secs),
            fees: config.fee_schedule(),
            escrow_account: Address::parse(&config.market.escrow_account)?,
            platform_pool: Address::parse(&config.fees.platform_pool)?,
            remainder_beneficiary: Address::parse(&config.fees.remainder_beneficiary)?,
            production_reward_per_unit: Amount::from(config.rewards.production_reward_per_unit),
            purchase_reward: Amount::from(config.rewards.purchase_reward),
            sale_reward: Amount::from(config.rewards.sale_reward),
        })
    }
}

/// Result of a delivery validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Distributed {
        split: FeeSplit,
        certificate_id: Option<CertificateId>,
    },
    Refunded {
        amount: Amount,
    },
}

#[derive(Debug, Default)]
struct MarketState {
    access: AccessControl,
    registry: OfferRegistry,
    commitments: CommitmentLedger,
    escrow: EscrowManager,
    events: EventLog,
}

/// Mint reservations that are released unless explicitly committed.
struct PendingEffects<'a> {
    services: &'a ExternalServices,
    rewards: Vec<RewardReservation>,
    certificate: Option<CertificateReservation>,
}

impl<'a> PendingEffects<'a> {
    fn new(services: &'a ExternalServices) -> Self {
        Self {
            services,
            rewards: Vec::new(),
            certificate: None,
        }
    }

    fn reserve_reward(&mut self, kind: RewardKind, to: &Address, amount: Amount) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let reservation = self
            .services
            .rewards
            .reserve(kind, to, amount)
            .map_err(|e| e.into_market("reward ledger"))?;
        self.rewards.push(reservation);
        Ok(())
    }

    fn reserve_certificate(&mut self, request: CertificateRequest) -> Result<()> {
        let reservation = self
            .services
            .certificates
            .reserve(request)
            .map_err(|e| e.into_market("certificate registry"))?;
        self.certificate = Some(reservation);
        Ok(())
    }

    fn commit(mut self) -> Option<CertificateId> {
        for reservation in self.rewards.drain(..) {
            self.services.rewards.commit(reservation);
        }
        self.certificate
            .take()
            .map(|reservation| self.services.certificates.commit(reservation))
    }
}

impl Drop for PendingEffects<'_> {
    fn drop(&mut self) {
        if self.rewards.is_empty() && self.certificate.is_none() {
            return;
        }
        error!(
            "Rolling back {} reward and {} certificate reservation(s)",
            self.rewards.len(),
            usize::from(self.certificate.is_some())
        );
        for reservation in self.rewards.drain(..) {
            self.services.rewards.release(reservation);
        }
        if let Some(reservation) = self.certificate.take() {
            self.services.certificates.release(reservation);
        }
    }
}

pub struct Marketplace {
    settings: MarketSettings,
    services: ExternalServices,
    clock: Arc<dyn Clock>,
    state: Mutex<MarketState>,
}

impl Marketplace {
    pub fn new(
        settings: MarketSettings,
        access: AccessControl,
        services: ExternalServices,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            services,
            clock,
            state: Mutex::new(MarketState {
                access,
                ..MarketState::default()
            }),
        }
    }

    pub fn settings(&self) -> &MarketSettings {
        &self.settings
    }

    pub fn create_offer(
        &self,
        producer: &Address,
        quantity: u64,
        price_per_unit: Amount,
        energy_type: &str,
    ) -> Result<OfferId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.ensure_not_paused()?;
        state.access.require(Role::Producer, producer)?;
        self.settings.limits.check(quantity, price_per_unit, energy_type)?;

        let now = self.clock.now();
        let id = state.registry.next_id();
        let offer = Offer::new(id, producer.clone(), quantity, price_per_unit, energy_type.to_string(), now);
        state.registry.insert(offer)?;
        state.events.push(
            now,
            MarketEvent::Created {
                offer_id: id,
                producer: producer.clone(),
                quantity,
                price_per_unit,
                energy_type: energy_type.to_string(),
            },
        );

        info!("Offer {} created by {}: {} x {} ({})", id, producer, quantity, price_per_unit, energy_type);
        Ok(id)
    }

    /// Oracle verdict on a freshly created offer. `metadata_ref` is required
    /// on approval; it becomes the certificate metadata at completion.
    pub fn validate_offer_creation(
        &self,
        oracle: &Address,
        offer_id: OfferId,
        approved: bool,
        metadata_ref: &str,
    ) -> Result<OfferState> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.ensure_not_paused()?;
        state.access.require(Role::Oracle, oracle)?;

        let offer = state.registry.get_mut(offer_id)?;
        offer.expect_state(OfferState::PendingCreation)?;

        let now = self.clock.now();
        let mut updated = offer.clone();
        let mut effects = PendingEffects::new(&self.services);

        if approved {
            if metadata_ref.trim().is_empty() {
                return Err(MarketError::InputValidation(
                    "Metadata reference is required to approve an offer".to_string(),
                ));
            }
            let reward = total_price(updated.quantity, self.settings.production_reward_per_unit)?;
            effects.reserve_reward(RewardKind::Production, &updated.producer, reward)?;
            updated.metadata_ref = Some(metadata_ref.to_string());
            updated.transition(OfferState::Active, now)?;
        } else {
            updated.transition(OfferState::Cancelled, now)?;
        }

        effects.commit();
        let next_state = updated.state;
        *offer = updated;
        state.events.push(
            now,
            MarketEvent::Validated {
                offer_id,
                oracle: oracle.clone(),
                approved,
                metadata_ref: approved.then(|| metadata_ref.to_string()),
            },
        );

        info!("Offer {} creation {} by oracle {}", offer_id, if approved { "approved" } else { "rejected" }, oracle);
        Ok(next_state)
    }

    pub fn cancel_unvalidated_offer(&self, producer: &Address, offer_id: OfferId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.ensure_not_paused()?;
        state.access.require(Role::Producer, producer)?;

        let offer = state.registry.get_mut(offer_id)?;
        if &offer.producer != producer {
            return Err(MarketError::Unauthorized(format!(
                "{} is not the producer of offer {}",
                producer, offer_id
            )));
        }
        offer.expect_state(OfferState::PendingCreation)?;

        let now = self.clock.now();
        offer.transition(OfferState::Cancelled, now)?;
        state.events.push(
            now,
            MarketEvent::Cancelled {
                offer_id,
                producer: producer.clone(),
            },
        );

        info!("Offer {} withdrawn by producer {}", offer_id, producer);
        Ok(())
    }

    pub fn commit_to_purchase(&self, consumer: &Address, hash: CommitmentHash) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.ensure_not_paused()?;
        state.access.require(Role::Consumer, consumer)?;

        let now = self.clock.now();
        let superseded = state.commitments.commit(consumer.clone(), hash, now).is_some();
        state.events.push(
            now,
            MarketEvent::CommitmentPlaced {
                consumer: consumer.clone(),
                superseded,
            },
        );

        info!("Purchase commitment placed by {} (superseded: {})", consumer, superseded);
        Ok(())
    }

    /// Reveals `secret`, debits exactly `quantity * price_per_unit` from the
    /// consumer into escrow, and reserves the offer.
    pub fn purchase_offer(
        &self,
        consumer: &Address,
        offer_id: OfferId,
        secret: &[u8],
        payment: Amount,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.ensure_not_paused()?;
        state.access.require(Role::Consumer, consumer)?;

        let offer = state.registry.get_mut(offer_id)?;
        offer.expect_state(OfferState::Active)?;

        let expected = offer.total_price()?;
        if payment != expected {
            return Err(MarketError::PaymentMismatch {
                expected,
                provided: payment,
            });
        }
        state.commitments.verify(consumer, secret)?;

        let now = self.clock.now();
        let mut updated = offer.clone();
        updated.buyer = Some(consumer.clone());
        updated.purchased_at = Some(now);
        updated.transition(OfferState::Reserved, now)?;

        let mut effects = PendingEffects::new(&self.services);
        effects.reserve_reward(RewardKind::Purchase, consumer, self.settings.purchase_reward)?;

        state.escrow.hold(EscrowHold {
            offer_id,
            buyer: consumer.clone(),
            amount: payment,
            held_at: now,
        })?;
        let deposit = [Transfer::new(self.settings.escrow_account.clone(), payment)];
        if let Err(err) = self.services.value.transfer_batch(consumer, &deposit) {
            state.escrow.release(offer_id);
            error!("Payment collection for offer {} from {} failed: {}", offer_id, consumer, err);
            return Err(err.into_market("value ledger"));
        }

        effects.commit();
        state.commitments.consume(consumer);
        *offer = updated;
        state.events.push(
            now,
            MarketEvent::Purchased {
                offer_id,
                buyer: consumer.clone(),
                amount: payment,
            },
        );

        info!("Offer {} reserved by {} with {} in escrow", offer_id, consumer, payment);
        Ok(())
    }

    /// Oracle verdict on delivery. Approval splits the escrow between the
    /// producer, the validating oracle, the platform pool and the remainder
    /// beneficiary; rejection refunds the buyer.
    pub fn validate_and_distribute(
        &self,
        oracle: &Address,
        offer_id: OfferId,
        approved: bool,
    ) -> Result<ValidationOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.ensure_not_paused()?;
        state.access.require(Role::Oracle, oracle)?;

        let offer = state.registry.get_mut(offer_id)?;
        offer.expect_state(OfferState::Reserved)?;
        let (buyer, purchased_at) = reservation_of(offer)?;

        let now = self.clock.now();
        self.settings.deadline.ensure_open(offer_id, purchased_at, now)?;
        let amount = state.escrow.held(offer_id);

        let mut updated = offer.clone();
        let mut effects = PendingEffects::new(&self.services);

        let (legs, outcome_split) = if approved {
            let split = self.settings.fees.split(amount);
            let recipients = PayoutRecipients {
                producer: updated.producer.clone(),
                oracle: oracle.clone(),
                pool: self.settings.platform_pool.clone(),
                remainder: self.settings.remainder_beneficiary.clone(),
            };
            effects.reserve_reward(RewardKind::Sale, &updated.producer, self.settings.sale_reward)?;
            effects.reserve_certificate(CertificateRequest {
                offer_id,
                to: updated.producer.clone(),
                quantity: updated.quantity,
                energy_type: updated.energy_type.clone(),
                metadata_ref: updated.metadata_ref.clone().unwrap_or_default(),
            })?;
            updated.transition(OfferState::Completed, now)?;
            (recipients.legs(&split), Some(split))
        } else {
            updated.transition(OfferState::Refunded, now)?;
            (vec![Transfer::new(buyer.clone(), amount)], None)
        };

        self.services
            .value
            .transfer_batch(&self.settings.escrow_account, &legs)
            .map_err(|err| {
                error!("Escrow payout for offer {} failed: {}", offer_id, err);
                err.into_market("value ledger")
            })?;

        let certificate_id = effects.commit();
        state.escrow.release(offer_id);
        updated.certificate_id = certificate_id;
        *offer = updated;

        let outcome = match outcome_split {
            Some(split) => {
                state.events.push(
                    now,
                    MarketEvent::Distributed {
                        offer_id,
                        oracle: oracle.clone(),
                        split,
                        certificate_id,
                    },
                );
                info!(
                    "Offer {} completed: producer {}, oracle {}, pool {}, remainder {}",
                    offer_id, split.producer, split.oracle, split.pool, split.remainder
                );
                ValidationOutcome::Distributed { split, certificate_id }
            }
            None => {
                state.events.push(
                    now,
                    MarketEvent::Refunded {
                        offer_id,
                        buyer: buyer.clone(),
                        amount,
                        reason: RefundReason::Rejected,
                    },
                );
                info!("Offer {} delivery rejected by {}; refunded {} to {}", offer_id, oracle, amount, buyer);
                ValidationOutcome::Refunded { amount }
            }
        };
        Ok(outcome)
    }

    /// Refunds the buyer of a reserved offer whose validation window has
    /// closed. Anyone may call it.
    pub fn refund_expired(&self, caller: &Address, offer_id: OfferId) -> Result<Amount> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.ensure_not_paused()?;

        let offer = state.registry.get_mut(offer_id)?;
        offer.expect_state(OfferState::Reserved)?;
        let (buyer, purchased_at) = reservation_of(offer)?;

        let now = self.clock.now();
        self.settings.deadline.ensure_expired(offer_id, purchased_at, now)?;
        let amount = state.escrow.held(offer_id);

        let mut updated = offer.clone();
        updated.transition(OfferState::Refunded, now)?;

        self.services
            .value
            .transfer_batch(&self.settings.escrow_account, &[Transfer::new(buyer.clone(), amount)])
            .map_err(|err| {
                error!("Deadline refund for offer {} failed: {}", offer_id, err);
                err.into_market("value ledger")
            })?;

        state.escrow.release(offer_id);
        *offer = updated;
        state.events.push(
            now,
            MarketEvent::Refunded {
                offer_id,
                buyer: buyer.clone(),
                amount,
                reason: RefundReason::DeadlineExpired,
            },
        );

        info!("Offer {} expired unvalidated; {} refunded {} to {}", offer_id, caller, amount, buyer);
        Ok(amount)
    }

    pub fn pause(&self, pauser: &Address) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.require(Role::Pauser, pauser)?;
        state.access.ensure_not_paused()?;

        state.access.set_paused(true);
        state.events.push(self.clock.now(), MarketEvent::Paused { by: pauser.clone() });
        info!("Marketplace paused by {}", pauser);
        Ok(())
    }

    pub fn unpause(&self, pauser: &Address) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.require(Role::Pauser, pauser)?;
        if !state.access.is_paused() {
            return Err(MarketError::InputValidation("Marketplace is not paused".to_string()));
        }

        state.access.set_paused(false);
        state.events.push(self.clock.now(), MarketEvent::Unpaused { by: pauser.clone() });
        info!("Marketplace unpaused by {}", pauser);
        Ok(())
    }

    /// Returns false when the account already held the role.
    pub fn grant_role(&self, admin: &Address, role: Role, account: &Address) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.require(Role::Admin, admin)?;

        let changed = state.access.grant(role, account.clone());
        if changed {
            state.events.push(
                self.clock.now(),
                MarketEvent::RoleGranted {
                    role,
                    account: account.clone(),
                    by: admin.clone(),
                },
            );
            info!("Role {} granted to {} by {}", role, account, admin);
        }
        Ok(changed)
    }

    /// Returns false when the account did not hold the role.
    pub fn revoke_role(&self, admin: &Address, role: Role, account: &Address) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.access.require(Role::Admin, admin)?;

        let changed = state.access.revoke(role, account);
        if changed {
            state.events.push(
                self.clock.now(),
                MarketEvent::RoleRevoked {
                    role,
                    account: account.clone(),
                    by: admin.clone(),
                },
            );
            info!("Role {} revoked from {} by {}", role, account, admin);
        }
        Ok(changed)
    }

    pub fn offer(&self, offer_id: OfferId) -> Result<Offer> {
        self.state.lock().registry.get(offer_id).cloned()
    }

    pub fn offers(&self) -> Vec<Offer> {
        self.state.lock().registry.all().to_vec()
    }

    pub fn offers_by_producer(&self, producer: &Address) -> Vec<Offer> {
        self.state.lock().registry.by_producer(producer).cloned().collect()
    }

    pub fn offers_in_state(&self, offer_state: OfferState) -> Vec<Offer> {
        self.state.lock().registry.in_state(offer_state).cloned().collect()
    }

    pub fn commitment_of(&self, consumer: &Address) -> Option<Commitment> {
        self.state.lock().commitments.get(consumer).cloned()
    }

    pub fn escrowed_amount(&self, offer_id: OfferId) -> Amount {
        self.state.lock().escrow.held(offer_id)
    }

    pub fn total_escrowed(&self) -> Amount {
        self.state.lock().escrow.total_held()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().access.is_paused()
    }

    pub fn has_role(&self, role: Role, account: &Address) -> bool {
        self.state.lock().access.has_role(role, account)
    }

    pub fn role_members(&self, role: Role) -> Vec<Address> {
        self.state.lock().access.members(role)
    }

    pub fn events_since(&self, seq: u64) -> Vec<EventRecord> {
        self.state.lock().events.since(seq)
    }
}

fn reservation_of(offer: &Offer) -> Result<(Address, DateTime<Utc>)> {
    match (&offer.buyer, offer.purchased_at) {
        (Some(buyer), Some(purchased_at)) => Ok((buyer.clone(), purchased_at)),
        _ => Err(MarketError::InputValidation(format!(
            "Offer {} is reserved without a buyer",
            offer.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commitment_hash;
    use crate::deadline::ManualClock;
    use crate::model::UNIT;
    use crate::services::{
        CertificateRegistry, InMemoryCertificateRegistry, InMemoryRewardLedger, InMemoryValueLedger,
        MockCertificateRegistry, MockRewardLedger, MockValueLedger, RewardLedger, ServiceError, ValueLedger,
    };
    use chrono::Duration;

    const SECRET: &[u8] = b"correct horse battery staple";
    const PRICE: Amount = UNIT / 1000;

    fn addr(name: &str) -> Address {
        Address::new(name)
    }

    struct Harness {
        market: Marketplace,
        clock: Arc<ManualClock>,
        value: Arc<InMemoryValueLedger>,
        rewards: Arc<InMemoryRewardLedger>,
        certificates: Arc<InMemoryCertificateRegistry>,
    }

    fn access() -> AccessControl {
        AccessControl::new()
            .with_members(Role::Producer, [addr("producer"), addr("producer-2")])
            .with_members(Role::Consumer, [addr("consumer")])
            .with_members(Role::Oracle, [addr("oracle")])
            .with_members(Role::Admin, [addr("admin")])
            .with_members(Role::Pauser, [addr("pauser")])
    }

    fn settings() -> MarketSettings {
        MarketSettings::from_config(&AppConfig::default()).unwrap()
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let value = Arc::new(InMemoryValueLedger::new());
        let rewards = Arc::new(InMemoryRewardLedger::new(clock.clone(), 10_000_000));
        let certificates = Arc::new(InMemoryCertificateRegistry::new(clock.clone()));
        value.deposit(&addr("consumer"), 10 * UNIT);

        let services = ExternalServices {
            value: value.clone(),
            rewards: rewards.clone(),
            certificates: certificates.clone(),
        };
        let market = Marketplace::new(settings(), access(), services, clock.clone());
        Harness {
            market,
            clock,
            value,
            rewards,
            certificates,
        }
    }

    impl Harness {
        fn active_offer(&self) -> OfferId {
            let id = self.market.create_offer(&addr("producer"), 1000, PRICE, "solar").unwrap();
            self.market
                .validate_offer_creation(&addr("oracle"), id, true, "ipfs://offer-meta")
                .unwrap();
            id
        }

        fn reserved_offer(&self) -> OfferId {
            let id = self.active_offer();
            self.market
                .commit_to_purchase(&addr("consumer"), commitment_hash(SECRET))
                .unwrap();
            self.market.purchase_offer(&addr("consumer"), id, SECRET, UNIT).unwrap();
            id
        }

        fn deadline(&self) -> Duration {
            self.market.settings().deadline.deadline()
        }
    }

    #[test]
    fn test_approved_creation_activates_and_mints_once() {
        let h = harness();
        let id = h.market.create_offer(&addr("producer"), 1000, PRICE, "solar").unwrap();
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::PendingCreation);

        let next = h
            .market
            .validate_offer_creation(&addr("oracle"), id, true, "ipfs://meta")
            .unwrap();
        assert_eq!(next, OfferState::Active);

        let offer = h.market.offer(id).unwrap();
        assert_eq!(offer.state, OfferState::Active);
        assert_eq!(offer.metadata_ref.as_deref(), Some("ipfs://meta"));
        assert_eq!(h.rewards.balance_of(&addr("producer")), 1000);
    }

    #[test]
    fn test_create_rejects_invalid_input_and_wrong_role() {
        let h = harness();
        let err = h.market.create_offer(&addr("producer"), 0, PRICE, "solar").unwrap_err();
        assert!(matches!(err, MarketError::InputValidation(_)));
        assert!(h.market.create_offer(&addr("producer"), 1, UNIT + 1, "solar").is_err());
        assert!(h.market.create_offer(&addr("producer"), 1, 1, &"x".repeat(64)).is_err());

        let err = h.market.create_offer(&addr("consumer"), 1, 1, "solar").unwrap_err();
        assert!(matches!(err, MarketError::Unauthorized(_)));
        assert!(h.market.offers().is_empty());
    }

    #[test]
    fn test_rejected_creation_cancels_without_reward() {
        let h = harness();
        let id = h.market.create_offer(&addr("producer"), 10, PRICE, "wind").unwrap();
        assert_eq!(
            h.market.validate_offer_creation(&addr("oracle"), id, false, "").unwrap(),
            OfferState::Cancelled
        );
        assert_eq!(h.rewards.balance_of(&addr("producer")), 0);

        let err = h
            .market
            .validate_offer_creation(&addr("oracle"), id, true, "ipfs://late")
            .unwrap_err();
        assert!(matches!(err, MarketError::StateMismatch { actual: OfferState::Cancelled, .. }));
    }

    #[test]
    fn test_creation_validation_guards() {
        let h = harness();
        let id = h.market.create_offer(&addr("producer"), 10, PRICE, "wind").unwrap();

        let err = h.market.validate_offer_creation(&addr("producer"), id, true, "m").unwrap_err();
        assert!(matches!(err, MarketError::Unauthorized(_)));
        assert!(matches!(
            h.market.validate_offer_creation(&addr("oracle"), id, true, " "),
            Err(MarketError::InputValidation(_))
        ));
        assert_eq!(
            h.market.validate_offer_creation(&addr("oracle"), OfferId(99), true, "m"),
            Err(MarketError::OfferNotFound(OfferId(99)))
        );
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::PendingCreation);
    }

    #[test]
    fn test_only_owning_producer_cancels_pending_offer() {
        let h = harness();
        let id = h.market.create_offer(&addr("producer"), 10, PRICE, "wind").unwrap();

        let err = h.market.cancel_unvalidated_offer(&addr("producer-2"), id).unwrap_err();
        assert!(matches!(err, MarketError::Unauthorized(_)));

        h.market.cancel_unvalidated_offer(&addr("producer"), id).unwrap();
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::Cancelled);

        let active = h.active_offer();
        assert!(matches!(
            h.market.cancel_unvalidated_offer(&addr("producer"), active),
            Err(MarketError::StateMismatch { expected: OfferState::PendingCreation, .. })
        ));
    }

    #[test]
    fn test_purchase_requires_exact_payment() {
        let h = harness();
        let id = h.active_offer();
        h.market
            .commit_to_purchase(&addr("consumer"), commitment_hash(SECRET))
            .unwrap();

        for payment in [UNIT - 1, UNIT + 1, 0] {
            let err = h.market.purchase_offer(&addr("consumer"), id, SECRET, payment).unwrap_err();
            assert_eq!(
                err,
                MarketError::PaymentMismatch {
                    expected: UNIT,
                    provided: payment
                }
            );
        }
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::Active);
        assert_eq!(h.market.escrowed_amount(id), 0);
        assert_eq!(h.value.balance_of(&addr("consumer")), 10 * UNIT);
        assert!(h.market.commitment_of(&addr("consumer")).is_some());
    }

    #[test]
    fn test_purchase_requires_matching_reveal() {
        let h = harness();
        let id = h.active_offer();

        assert_eq!(
            h.market.purchase_offer(&addr("consumer"), id, SECRET, UNIT),
            Err(MarketError::CommitmentMismatch(addr("consumer")))
        );

        h.market
            .commit_to_purchase(&addr("consumer"), commitment_hash(b"old secret"))
            .unwrap();
        h.market
            .commit_to_purchase(&addr("consumer"), commitment_hash(SECRET))
            .unwrap();
        assert!(matches!(
            h.market.purchase_offer(&addr("consumer"), id, b"old secret", UNIT),
            Err(MarketError::CommitmentMismatch(_))
        ));

        h.market.purchase_offer(&addr("consumer"), id, SECRET, UNIT).unwrap();
        let offer = h.market.offer(id).unwrap();
        assert_eq!(offer.state, OfferState::Reserved);
        assert_eq!(offer.buyer, Some(addr("consumer")));
        assert_eq!(offer.purchased_at, Some(h.clock.now()));
        assert_eq!(h.market.escrowed_amount(id), UNIT);
        assert_eq!(h.value.balance_of(&addr("escrow")), UNIT);
        assert_eq!(h.value.balance_of(&addr("consumer")), 9 * UNIT);
        assert!(h.market.commitment_of(&addr("consumer")).is_none());
        assert_eq!(h.rewards.balance_of(&addr("consumer")), 10);
    }

    #[test]
    fn test_commitment_is_single_use() {
        let h = harness();
        let first = h.reserved_offer();
        let second = h.active_offer();

        assert!(matches!(
            h.market.purchase_offer(&addr("consumer"), second, SECRET, UNIT),
            Err(MarketError::CommitmentMismatch(_))
        ));
        assert_eq!(h.market.offer(first).unwrap().state, OfferState::Reserved);
        assert_eq!(h.market.offer(second).unwrap().state, OfferState::Active);
    }

    #[test]
    fn test_distribution_splits_escrow_exactly() {
        let h = harness();
        let id = h.reserved_offer();

        let outcome = h.market.validate_and_distribute(&addr("oracle"), id, true).unwrap();
        let ValidationOutcome::Distributed { split, certificate_id } = outcome else {
            panic!("expected distribution, got {:?}", outcome);
        };
        assert_eq!(split.total(), UNIT);
        assert_eq!(h.value.balance_of(&addr("producer")), split.producer);
        assert_eq!(h.value.balance_of(&addr("oracle")), split.oracle);
        assert_eq!(h.value.balance_of(&addr("platform-pool")), split.pool);
        assert_eq!(h.value.balance_of(&addr("treasury")), split.remainder);
        assert_eq!(h.value.balance_of(&addr("escrow")), 0);
        assert_eq!(h.market.escrowed_amount(id), 0);

        let offer = h.market.offer(id).unwrap();
        assert_eq!(offer.state, OfferState::Completed);
        assert_eq!(offer.certificate_id, certificate_id);
        let certificate = h.certificates.certificate(certificate_id.unwrap()).unwrap();
        assert_eq!(certificate.owner, addr("producer"));
        assert_eq!(certificate.metadata_ref, "ipfs://offer-meta");
        assert_eq!(h.rewards.balance_of(&addr("producer")), 1000 + 10);
    }

    #[test]
    fn test_rejected_delivery_refunds_buyer() {
        let h = harness();
        let id = h.reserved_offer();

        assert_eq!(
            h.market.validate_and_distribute(&addr("oracle"), id, false).unwrap(),
            ValidationOutcome::Refunded { amount: UNIT }
        );
        assert_eq!(h.value.balance_of(&addr("consumer")), 10 * UNIT);
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::Refunded);
        assert!(h.certificates.certificates_of(&addr("producer")).is_empty());
    }

    #[test]
    fn test_validation_window_edges() {
        let h = harness();
        let id = h.reserved_offer();
        h.clock.advance(h.deadline() - Duration::seconds(1));
        assert!(h.market.validate_and_distribute(&addr("oracle"), id, true).is_ok());

        let late = h.reserved_offer_with_fresh_secret();
        h.clock.advance(h.deadline() + Duration::seconds(1));
        assert_eq!(
            h.market.validate_and_distribute(&addr("oracle"), late, true),
            Err(MarketError::DeadlineExceeded {
                offer_id: late,
                overdue_secs: 1
            })
        );
        assert_eq!(h.market.offer(late).unwrap().state, OfferState::Reserved);
    }

    impl Harness {
        fn reserved_offer_with_fresh_secret(&self) -> OfferId {
            let id = self.active_offer();
            self.market
                .commit_to_purchase(&addr("consumer"), commitment_hash(b"fresh"))
                .unwrap();
            self.market.purchase_offer(&addr("consumer"), id, b"fresh", UNIT).unwrap();
            id
        }
    }

    #[test]
    fn test_deadline_refund_is_permissionless_and_pull_based() {
        let h = harness();
        let id = h.reserved_offer();

        assert!(matches!(
            h.market.refund_expired(&addr("anyone"), id),
            Err(MarketError::DeadlineNotReached { .. })
        ));
        h.clock.advance(h.deadline());
        assert!(h.market.refund_expired(&addr("anyone"), id).is_err());

        h.clock.advance(Duration::seconds(1));
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::Reserved);
        assert_eq!(h.market.refund_expired(&addr("anyone"), id).unwrap(), UNIT);
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::Refunded);
        assert_eq!(h.value.balance_of(&addr("consumer")), 10 * UNIT);

        let events = h.market.events_since(0);
        assert!(matches!(
            events.last().map(|r| &r.event),
            Some(MarketEvent::Refunded { reason: RefundReason::DeadlineExpired, .. })
        ));
    }

    #[test]
    fn test_early_refund_with_unrepresentable_expiry_is_rejected() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let value = Arc::new(InMemoryValueLedger::new());
        value.deposit(&addr("consumer"), UNIT);
        let services = ExternalServices {
            value: value.clone(),
            rewards: Arc::new(InMemoryRewardLedger::new(clock.clone(), 10_000_000)),
            certificates: Arc::new(InMemoryCertificateRegistry::new(clock.clone())),
        };
        let settings = MarketSettings {
            deadline: DeadlineMonitor::from_secs(9_000_000_000_000),
            ..settings()
        };
        let market = Marketplace::new(settings, access(), services, clock.clone());

        let id = market.create_offer(&addr("producer"), 1000, PRICE, "solar").unwrap();
        market.validate_offer_creation(&addr("oracle"), id, true, "m").unwrap();
        market.commit_to_purchase(&addr("consumer"), commitment_hash(SECRET)).unwrap();
        market.purchase_offer(&addr("consumer"), id, SECRET, UNIT).unwrap();

        clock.advance(Duration::days(3650));
        assert_eq!(
            market.refund_expired(&addr("anyone"), id),
            Err(MarketError::DeadlineNotReached {
                offer_id: id,
                remaining_secs: i64::MAX
            })
        );
        assert_eq!(market.offer(id).unwrap().state, OfferState::Reserved);
        assert!(market.validate_and_distribute(&addr("oracle"), id, true).is_ok());
    }

    #[test]
    fn test_terminal_offers_reject_every_mutation() {
        let h = harness();
        let completed = h.reserved_offer();
        h.market.validate_and_distribute(&addr("oracle"), completed, true).unwrap();

        let refunded = h.reserved_offer();
        h.market.validate_and_distribute(&addr("oracle"), refunded, false).unwrap();

        let cancelled = h.market.create_offer(&addr("producer"), 5, PRICE, "hydro").unwrap();
        h.market.cancel_unvalidated_offer(&addr("producer"), cancelled).unwrap();

        h.market
            .commit_to_purchase(&addr("consumer"), commitment_hash(SECRET))
            .unwrap();
        h.clock.advance(h.deadline() * 2);

        for id in [completed, refunded, cancelled] {
            let results = [
                h.market.validate_offer_creation(&addr("oracle"), id, true, "m").map(|_| ()),
                h.market.cancel_unvalidated_offer(&addr("producer"), id),
                h.market.purchase_offer(&addr("consumer"), id, SECRET, UNIT),
                h.market.validate_and_distribute(&addr("oracle"), id, true).map(|_| ()),
                h.market.refund_expired(&addr("anyone"), id).map(|_| ()),
            ];
            for result in results {
                assert!(
                    matches!(result, Err(MarketError::StateMismatch { .. })),
                    "offer {} gave {:?}",
                    id,
                    result
                );
            }
        }
    }

    #[test]
    fn test_pause_blocks_mutations_but_not_reads() {
        let h = harness();
        let active = h.active_offer();
        let reserved = h.reserved_offer();
        let pending = h.market.create_offer(&addr("producer"), 5, PRICE, "hydro").unwrap();

        assert!(matches!(h.market.pause(&addr("consumer")), Err(MarketError::Unauthorized(_))));
        h.market.pause(&addr("pauser")).unwrap();
        assert_eq!(h.market.pause(&addr("pauser")), Err(MarketError::Paused));
        h.clock.advance(h.deadline() * 2);

        let results = [
            h.market.create_offer(&addr("producer"), 1, 1, "solar").map(|_| ()),
            h.market.validate_offer_creation(&addr("oracle"), pending, true, "m").map(|_| ()),
            h.market.cancel_unvalidated_offer(&addr("producer"), pending),
            h.market.commit_to_purchase(&addr("consumer"), commitment_hash(b"x")),
            h.market.purchase_offer(&addr("consumer"), active, b"x", UNIT),
            h.market.validate_and_distribute(&addr("oracle"), reserved, true).map(|_| ()),
            h.market.refund_expired(&addr("anyone"), reserved).map(|_| ()),
        ];
        for result in results {
            assert_eq!(result, Err(MarketError::Paused));
        }

        assert!(h.market.is_paused());
        assert_eq!(h.market.offer(reserved).unwrap().state, OfferState::Reserved);
        assert_eq!(h.market.escrowed_amount(reserved), UNIT);

        h.market.unpause(&addr("pauser")).unwrap();
        assert!(matches!(h.market.unpause(&addr("pauser")), Err(MarketError::InputValidation(_))));
        assert_eq!(h.market.refund_expired(&addr("anyone"), reserved).unwrap(), UNIT);
        h.market.cancel_unvalidated_offer(&addr("producer"), pending).unwrap();
    }

    #[test]
    fn test_admin_manages_roles() {
        let h = harness();
        let newcomer = addr("newcomer");

        assert!(matches!(
            h.market.grant_role(&addr("oracle"), Role::Oracle, &newcomer),
            Err(MarketError::Unauthorized(_))
        ));
        assert!(h.market.grant_role(&addr("admin"), Role::Oracle, &newcomer).unwrap());
        assert!(!h.market.grant_role(&addr("admin"), Role::Oracle, &newcomer).unwrap());
        assert!(h.market.has_role(Role::Oracle, &newcomer));

        h.market.pause(&addr("pauser")).unwrap();
        assert!(h.market.revoke_role(&addr("admin"), Role::Oracle, &addr("oracle")).unwrap());
        assert_eq!(h.market.role_members(Role::Oracle), vec![newcomer]);
    }

    #[test]
    fn test_reward_cap_rejection_leaves_offer_pending() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let rewards = Arc::new(InMemoryRewardLedger::new(clock.clone(), 1500));
        let services = ExternalServices {
            value: Arc::new(InMemoryValueLedger::new()),
            rewards: rewards.clone(),
            certificates: Arc::new(InMemoryCertificateRegistry::new(clock.clone())),
        };
        let market = Marketplace::new(settings(), access(), services, clock);

        let first = market.create_offer(&addr("producer"), 1000, PRICE, "solar").unwrap();
        let second = market.create_offer(&addr("producer"), 1000, PRICE, "solar").unwrap();
        market.validate_offer_creation(&addr("oracle"), first, true, "m").unwrap();

        let err = market.validate_offer_creation(&addr("oracle"), second, true, "m").unwrap_err();
        assert!(matches!(err, MarketError::ExternalDependencyFailure { service: "reward ledger", .. }));
        let offer = market.offer(second).unwrap();
        assert_eq!(offer.state, OfferState::PendingCreation);
        assert!(offer.metadata_ref.is_none());
        assert_eq!(rewards.balance_of(&addr("producer")), 1000);
        assert_eq!(rewards.pending_count(), 0);
    }

    #[test]
    fn test_certificate_rejection_rolls_back_distribution() {
        let h = harness();
        let id = h.reserved_offer();

        let mut registry = MockCertificateRegistry::new();
        registry
            .expect_reserve()
            .returning(|_| Err(ServiceError::Rejected("registry offline".to_string())));
        registry.expect_commit().never();
        let services = ExternalServices {
            value: h.value.clone(),
            rewards: h.rewards.clone(),
            certificates: Arc::new(registry),
        };
        let market = Marketplace {
            services,
            ..rebuild(&h)
        };

        let err = market.validate_and_distribute(&addr("oracle"), id, true).unwrap_err();
        assert!(matches!(err, MarketError::ExternalDependencyFailure { service: "certificate registry", .. }));
        assert_eq!(market.offer(id).unwrap().state, OfferState::Reserved);
        assert_eq!(market.escrowed_amount(id), UNIT);
        assert_eq!(h.value.balance_of(&addr("escrow")), UNIT);
        assert_eq!(h.value.balance_of(&addr("producer")), 0);
        assert_eq!(h.rewards.balance_of(&addr("producer")), 1000);
        assert_eq!(h.rewards.pending_count(), 0);
    }

    /// Moves the harness state into a marketplace with the same settings.
    fn rebuild(h: &Harness) -> Marketplace {
        let snapshot = h.market.state.lock();
        Marketplace {
            settings: h.market.settings.clone(),
            services: h.market.services.clone(),
            clock: h.clock.clone(),
            state: Mutex::new(MarketState {
                access: snapshot.access.clone(),
                registry: snapshot.registry.clone(),
                commitments: snapshot.commitments.clone(),
                escrow: snapshot.escrow.clone(),
                events: snapshot.events.clone(),
            }),
        }
    }

    #[test]
    fn test_payout_failure_releases_reservations() {
        let h = harness();
        let id = h.reserved_offer();

        let mut value = MockValueLedger::new();
        value
            .expect_transfer_batch()
            .returning(|_, _| Err(ServiceError::Rejected("ledger halted".to_string())));
        let mut rewards = MockRewardLedger::new();
        rewards.expect_reserve().returning(|kind, to, amount| {
            Ok(RewardReservation {
                id: uuid::Uuid::new_v4(),
                kind,
                to: to.clone(),
                amount,
            })
        });
        rewards.expect_release().times(1).return_const(());
        rewards.expect_commit().never();
        let mut certificates = MockCertificateRegistry::new();
        certificates.expect_reserve().returning(|request| {
            Ok(CertificateReservation {
                id: uuid::Uuid::new_v4(),
                request,
            })
        });
        certificates.expect_release().times(1).return_const(());
        certificates.expect_commit().never();

        let market = Marketplace {
            services: ExternalServices {
                value: Arc::new(value),
                rewards: Arc::new(rewards),
                certificates: Arc::new(certificates),
            },
            ..rebuild(&h)
        };

        let err = market.validate_and_distribute(&addr("oracle"), id, true).unwrap_err();
        assert!(matches!(err, MarketError::ExternalDependencyFailure { service: "value ledger", .. }));
        assert_eq!(market.offer(id).unwrap().state, OfferState::Reserved);
        assert_eq!(market.escrowed_amount(id), UNIT);
    }

    #[test]
    fn test_insufficient_funds_leave_purchase_untouched() {
        let h = harness();
        let id = h.market.create_offer(&addr("producer"), 1000, UNIT / 10, "solar").unwrap();
        h.market.validate_offer_creation(&addr("oracle"), id, true, "m").unwrap();
        h.market
            .commit_to_purchase(&addr("consumer"), commitment_hash(SECRET))
            .unwrap();

        let err = h.market.purchase_offer(&addr("consumer"), id, SECRET, 100 * UNIT).unwrap_err();
        assert!(matches!(err, MarketError::ExternalDependencyFailure { service: "value ledger", .. }));
        assert_eq!(h.market.offer(id).unwrap().state, OfferState::Active);
        assert_eq!(h.market.escrowed_amount(id), 0);
        assert!(h.market.commitment_of(&addr("consumer")).is_some());
        assert_eq!(h.rewards.balance_of(&addr("consumer")), 0);
        assert_eq!(h.rewards.pending_count(), 0);
        assert_eq!(h.value.balance_of(&addr("consumer")), 10 * UNIT);
    }

    #[test]
    fn test_events_track_every_transition() {
        let h = harness();
        let id = h.reserved_offer();
        h.market.validate_and_distribute(&addr("oracle"), id, true).unwrap();

        let kinds: Vec<&'static str> = h
            .market
            .events_since(0)
            .iter()
            .map(|record| match record.event {
                MarketEvent::Created { .. } => "created",
                MarketEvent::Validated { approved: true, .. } => "validated",
                MarketEvent::CommitmentPlaced { .. } => "committed",
                MarketEvent::Purchased { .. } => "purchased",
                MarketEvent::Distributed { .. } => "distributed",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["created", "validated", "committed", "purchased", "distributed"]);
        assert_eq!(h.market.events_since(4).len(), 1);
    }
}
