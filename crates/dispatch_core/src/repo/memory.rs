//! In-memory repositories backing tests and single-node deployments.
//!
//! Each repository serializes access through one mutex so the conditional
//! operations (`assign_if_requested`, `accept_exclusive`) are atomic with
//! respect to concurrent callers, matching what a relational store provides
//! via conditional UPDATE.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::geo::{self, GeoPoint};
use crate::ids::{CustomerId, DriverId, OfferId, TripId};
use crate::repo::{
    ConditionalAssign, DestinationPreference, DriverRecord, DriverRepository, OfferAccept,
    OfferRepository, OfferStatus, TripOffer, TripRecord, TripRepository, TripStatus,
};

fn guard<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("repository mutex poisoned".into()))
}

#[derive(Default)]
struct DriverTables {
    records: HashMap<DriverId, DriverRecord>,
    preferences: HashMap<DriverId, Vec<DestinationPreference>>,
    blocklists: HashMap<CustomerId, HashSet<DriverId>>,
    completed_pairs: HashSet<(DriverId, CustomerId)>,
}

/// Driver records plus the side tables eligibility consults.
#[derive(Default)]
pub struct MemoryDriverRepository {
    tables: Mutex<DriverTables>,
}

impl MemoryDriverRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: DriverRecord) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.records.insert(record.id, record);
        }
    }

    pub fn set_preferences(&self, driver: DriverId, prefs: Vec<DestinationPreference>) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.preferences.insert(driver, prefs);
        }
    }

    pub fn block(&self, customer: CustomerId, driver: DriverId) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.blocklists.entry(customer).or_default().insert(driver);
        }
    }

    pub fn record_completed_pair(&self, driver: DriverId, customer: CustomerId) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.completed_pairs.insert((driver, customer));
        }
    }
}

impl DriverRepository for MemoryDriverRepository {
    fn get(&self, id: DriverId) -> Result<Option<DriverRecord>, StoreError> {
        Ok(guard(&self.tables)?.records.get(&id).cloned())
    }

    fn find_nearby(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<(DriverRecord, f64)>, StoreError> {
        let tables = guard(&self.tables)?;
        let mut hits: Vec<(DriverRecord, f64)> = tables
            .records
            .values()
            .filter_map(|record| {
                let position = record.last_position?;
                let distance_m = geo::haversine_m(center, position);
                (distance_m <= radius_m).then(|| (record.clone(), distance_m))
            })
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    fn destination_preferences(
        &self,
        id: DriverId,
    ) -> Result<Vec<DestinationPreference>, StoreError> {
        Ok(guard(&self.tables)?
            .preferences
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    fn blocked_drivers(&self, customer: CustomerId) -> Result<HashSet<DriverId>, StoreError> {
        Ok(guard(&self.tables)?
            .blocklists
            .get(&customer)
            .cloned()
            .unwrap_or_default())
    }

    fn has_completed_trip_for(
        &self,
        driver: DriverId,
        customer: CustomerId,
    ) -> Result<bool, StoreError> {
        Ok(guard(&self.tables)?
            .completed_pairs
            .contains(&(driver, customer)))
    }
}

/// Trip rows with conditional-update semantics.
#[derive(Default)]
pub struct MemoryTripRepository {
    trips: Mutex<HashMap<TripId, TripRecord>>,
}

impl MemoryTripRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TripRepository for MemoryTripRepository {
    fn get(&self, id: TripId) -> Result<Option<TripRecord>, StoreError> {
        Ok(guard(&self.trips)?.get(&id).cloned())
    }

    fn insert(&self, trip: TripRecord) -> Result<(), StoreError> {
        guard(&self.trips)?.insert(trip.id, trip);
        Ok(())
    }

    fn assign_if_requested(
        &self,
        id: TripId,
        driver: DriverId,
    ) -> Result<ConditionalAssign, StoreError> {
        let mut trips = guard(&self.trips)?;
        let Some(trip) = trips.get_mut(&id) else {
            return Ok(ConditionalAssign::NotFound);
        };
        match trip.status {
            TripStatus::Requested if trip.driver_id.is_none() => {
                trip.status = TripStatus::Accepted;
                trip.driver_id = Some(driver);
                Ok(ConditionalAssign::Assigned)
            }
            TripStatus::Accepted | TripStatus::Requested => Ok(ConditionalAssign::AlreadyAssigned {
                driver: trip.driver_id,
            }),
            status => Ok(ConditionalAssign::NotAssignable { status }),
        }
    }

    fn set_status_if(
        &self,
        id: TripId,
        expected: TripStatus,
        new: TripStatus,
    ) -> Result<bool, StoreError> {
        let mut trips = guard(&self.trips)?;
        match trips.get_mut(&id) {
            Some(trip) if trip.status == expected => {
                trip.status = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Offer rows with exclusive-accept semantics.
#[derive(Default)]
pub struct MemoryOfferRepository {
    offers: Mutex<HashMap<OfferId, TripOffer>>,
}

impl MemoryOfferRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OfferRepository for MemoryOfferRepository {
    fn insert(&self, offer: TripOffer) -> Result<(), StoreError> {
        guard(&self.offers)?.insert(offer.id, offer);
        Ok(())
    }

    fn get(&self, id: OfferId) -> Result<Option<TripOffer>, StoreError> {
        Ok(guard(&self.offers)?.get(&id).cloned())
    }

    fn accept_exclusive(&self, id: OfferId) -> Result<OfferAccept, StoreError> {
        let mut offers = guard(&self.offers)?;
        let Some(offer) = offers.get(&id) else {
            return Ok(OfferAccept::NotFound);
        };
        if offer.status != OfferStatus::Pending {
            return Ok(OfferAccept::AlreadyResolved {
                status: offer.status,
            });
        }
        let trip_id = offer.trip_id;
        for sibling in offers.values_mut() {
            if sibling.trip_id == trip_id && sibling.status == OfferStatus::Pending {
                sibling.status = if sibling.id == id {
                    OfferStatus::Accepted
                } else {
                    OfferStatus::Rejected
                };
            }
        }
        Ok(OfferAccept::Accepted)
    }

    fn mark_rejected(&self, id: OfferId) -> Result<bool, StoreError> {
        let mut offers = guard(&self.offers)?;
        match offers.get_mut(&id) {
            Some(offer) if offer.status == OfferStatus::Pending => {
                offer.status = OfferStatus::Rejected;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_bid(&self, id: OfferId, price: f64) -> Result<bool, StoreError> {
        let mut offers = guard(&self.offers)?;
        match offers.get_mut(&id) {
            Some(offer) if offer.status == OfferStatus::Pending => {
                offer.offer_price = Some(price);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn pending_for_trip(&self, trip: TripId) -> Result<Vec<TripOffer>, StoreError> {
        Ok(guard(&self.offers)?
            .values()
            .filter(|o| o.trip_id == trip && o.status == OfferStatus::Pending)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{DriverStatus, VehicleClass};

    fn trip(status: TripStatus) -> TripRecord {
        TripRecord {
            id: TripId::new(),
            customer_id: CustomerId::new(),
            driver_id: None,
            status,
            pickup: GeoPoint::new(30.0444, 31.2357),
            dest: GeoPoint::new(30.0626, 31.2497),
            vehicle: VehicleClass::Comfort,
            price: 45.0,
        }
    }

    #[test]
    fn conditional_assign_wins_once() {
        let repo = MemoryTripRepository::new();
        let t = trip(TripStatus::Requested);
        let id = t.id;
        repo.insert(t).expect("insert");

        let winner = DriverId::new();
        let loser = DriverId::new();
        assert_eq!(
            repo.assign_if_requested(id, winner).expect("first"),
            ConditionalAssign::Assigned
        );
        assert_eq!(
            repo.assign_if_requested(id, loser).expect("second"),
            ConditionalAssign::AlreadyAssigned {
                driver: Some(winner)
            }
        );
        let stored = repo.get(id).expect("get").expect("exists");
        assert_eq!(stored.driver_id, Some(winner));
        assert_eq!(stored.status, TripStatus::Accepted);
    }

    #[test]
    fn assign_rejects_terminal_trip() {
        let repo = MemoryTripRepository::new();
        let t = trip(TripStatus::Cancelled);
        let id = t.id;
        repo.insert(t).expect("insert");
        assert_eq!(
            repo.assign_if_requested(id, DriverId::new()).expect("assign"),
            ConditionalAssign::NotAssignable {
                status: TripStatus::Cancelled
            }
        );
    }

    #[test]
    fn accept_exclusive_rejects_siblings() {
        let repo = MemoryOfferRepository::new();
        let trip_id = TripId::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let offer = TripOffer {
                id: OfferId::new(),
                trip_id,
                driver_id: DriverId::new(),
                offer_price: None,
                status: OfferStatus::Pending,
            };
            ids.push(offer.id);
            repo.insert(offer).expect("insert");
        }

        assert_eq!(
            repo.accept_exclusive(ids[1]).expect("accept"),
            OfferAccept::Accepted
        );
        assert_eq!(
            repo.get(ids[0]).expect("get").expect("exists").status,
            OfferStatus::Rejected
        );
        assert_eq!(
            repo.get(ids[1]).expect("get").expect("exists").status,
            OfferStatus::Accepted
        );
        assert_eq!(
            repo.get(ids[2]).expect("get").expect("exists").status,
            OfferStatus::Rejected
        );
        // A rejected offer can never be accepted afterwards.
        assert_eq!(
            repo.accept_exclusive(ids[2]).expect("re-accept"),
            OfferAccept::AlreadyResolved {
                status: OfferStatus::Rejected
            }
        );
    }

    #[test]
    fn find_nearby_ranks_by_distance() {
        let repo = MemoryDriverRepository::new();
        let center = GeoPoint::new(30.0444, 31.2357);
        let near = DriverId::new();
        let far = DriverId::new();
        for (id, position) in [
            (far, GeoPoint::new(30.0700, 31.2600)),
            (near, GeoPoint::new(30.0450, 31.2360)),
        ] {
            repo.upsert(DriverRecord {
                id,
                status: DriverStatus::Approved,
                vehicle: VehicleClass::Comfort,
                vehicle_model: "Model S".into(),
                rating: 4.8,
                last_position: Some(position),
                last_location_update_ms: Some(0),
                dest_preference_enabled: false,
            });
        }
        let hits = repo.find_nearby(center, 10_000.0, 10).expect("nearby");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.id, near);
        assert_eq!(hits[1].0.id, far);
    }
}
