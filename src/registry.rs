use crate::{
    error::{MarketError, Result},
    model::{Offer, OfferId, OfferState},
    Address,
};

/// Arena of offers; an offer's id is its index.
#[derive(Debug, Clone, Default)]
pub struct OfferRegistry {
    offers: Vec<Offer>,
}

impl OfferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> OfferId {
        OfferId(self.offers.len() as u64)
    }

    pub fn insert(&mut self, offer: Offer) -> Result<OfferId> {
        let id = self.next_id();
        if offer.id != id {
            return Err(MarketError::InputValidation(format!(
                "Offer id {} does not match next id {}",
                offer.id, id
            )));
        }
        self.offers.push(offer);
        Ok(id)
    }

    pub fn get(&self, id: OfferId) -> Result<&Offer> {
        usize::try_from(id.0)
            .ok()
            .and_then(|index| self.offers.get(index))
            .ok_or(MarketError::OfferNotFound(id))
    }

    pub fn get_mut(&mut self, id: OfferId) -> Result<&mut Offer> {
        usize::try_from(id.0)
            .ok()
            .and_then(|index| self.offers.get_mut(index))
            .ok_or(MarketError::OfferNotFound(id))
    }

    pub fn all(&self) -> &[Offer] {
        &self.offers
    }

    pub fn by_producer<'a>(&'a self, producer: &'a Address) -> impl Iterator<Item = &'a Offer> + 'a {
        self.offers.iter().filter(move |offer| &offer.producer == producer)
    }

    pub fn in_state(&self, state: OfferState) -> impl Iterator<Item = &Offer> + '_ {
        self.offers.iter().filter(move |offer| offer.state == state)
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn offer(id: u64, producer: &str) -> Offer {
        Offer::new(OfferId(id), Address::new(producer), 5, 2, "hydro".to_string(), Utc::now())
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut registry = OfferRegistry::new();
        assert_eq!(registry.insert(offer(0, "a")).unwrap(), OfferId(0));
        assert_eq!(registry.insert(offer(1, "b")).unwrap(), OfferId(1));
        assert!(registry.insert(offer(5, "c")).is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lookup_and_update_in_place() {
        let mut registry = OfferRegistry::new();
        registry.insert(offer(0, "a")).unwrap();
        assert_eq!(registry.get(OfferId(9)), Err(MarketError::OfferNotFound(OfferId(9))));

        registry.get_mut(OfferId(0)).unwrap().state = OfferState::Active;
        assert_eq!(registry.get(OfferId(0)).unwrap().state, OfferState::Active);
        assert!(registry.get_mut(OfferId(3)).is_err());
    }

    #[test]
    fn test_filters() {
        let mut registry = OfferRegistry::new();
        registry.insert(offer(0, "a")).unwrap();
        registry.insert(offer(1, "b")).unwrap();
        registry.insert(offer(2, "a")).unwrap();

        let producer = Address::new("a");
        let ids: Vec<OfferId> = registry.by_producer(&producer).map(|o| o.id).collect();
        assert_eq!(ids, vec![OfferId(0), OfferId(2)]);
        assert_eq!(registry.in_state(OfferState::PendingCreation).count(), 3);
        assert_eq!(registry.in_state(OfferState::Active).count(), 0);
    }
}
