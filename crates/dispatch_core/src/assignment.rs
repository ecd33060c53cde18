//! The commit path: the only writer of `requested → accepted`.
//!
//! An acceptance runs: combined trip+driver lock, eligibility re-check
//! (closing the gap between ranking and commit), the conditional trip
//! update, exclusive offer resolution, active-trip marker, pending-offer
//! cleanup, and the winner's move to `Busy`. The locks are a fast-path
//! guard released on every path; the conditional update is what actually
//! prevents a double assignment. A caller that loses the race gets a
//! distinct "already assigned" outcome so it stops retrying.
//!
//! Fast-store or durable-store failure anywhere in here aborts the
//! assignment; the commit path never fails open.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::driver_state::{DriverState, DriverStateMachine, TransitionOutcome};
use crate::error::StoreError;
use crate::filter::{DriverFilter, OfferContext};
use crate::ids::{DriverId, OfferId, TripId};
use crate::lock::TripLock;
use crate::push::{PushEvent, PushRegistry};
use crate::repo::{
    ConditionalAssign, OfferAccept, OfferRepository, OfferStatus, TripRepository, TripStatus,
};
use crate::store::{keys, FastStore};

/// Result of an acceptance attempt. Every variant is an expected business
/// condition; infrastructure failure is the `Err` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentOutcome {
    Assigned,
    /// Another driver's acceptance committed first.
    AlreadyAssigned { driver: Option<DriverId> },
    /// The driver went offline, busy, or otherwise stopped qualifying
    /// between ranking and commit.
    NoLongerEligible,
    /// The supplied offer was already resolved (declined, timed out, or
    /// rejected as a sibling).
    OfferNoLongerValid,
    /// The trip is missing or reached a terminal status.
    TripUnavailable { status: Option<TripStatus> },
    /// The lock retry budget ran out; another caller is mid-assignment.
    Contended,
}

impl AssignmentOutcome {
    pub fn success(&self) -> bool {
        matches!(self, AssignmentOutcome::Assigned)
    }

    pub fn message(&self) -> String {
        match self {
            AssignmentOutcome::Assigned => "trip assigned".into(),
            AssignmentOutcome::AlreadyAssigned { .. } => "trip already assigned".into(),
            AssignmentOutcome::NoLongerEligible => "driver no longer eligible".into(),
            AssignmentOutcome::OfferNoLongerValid => "offer no longer valid".into(),
            AssignmentOutcome::TripUnavailable { .. } => "trip no longer available".into(),
            AssignmentOutcome::Contended => "trip is being processed by another driver".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineOutcome {
    Declined,
    /// Nothing was pending for this trip/driver pair.
    NothingPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    TimedOut,
    /// The trip had already left `Requested`; nothing to do.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal { status: TripStatus },
    NotFound,
}

pub struct TripAssignmentService {
    locks: Arc<TripLock>,
    filter: Arc<DriverFilter>,
    trips: Arc<dyn TripRepository>,
    offers: Arc<dyn OfferRepository>,
    store: Arc<dyn FastStore>,
    state: Arc<DriverStateMachine>,
    registry: Arc<PushRegistry>,
    config: EngineConfig,
}

impl TripAssignmentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locks: Arc<TripLock>,
        filter: Arc<DriverFilter>,
        trips: Arc<dyn TripRepository>,
        offers: Arc<dyn OfferRepository>,
        store: Arc<dyn FastStore>,
        state: Arc<DriverStateMachine>,
        registry: Arc<PushRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            locks,
            filter,
            trips,
            offers,
            store,
            state,
            registry,
            config,
        }
    }

    /// Commits a driver to a trip. Exactly one call per trip can return
    /// [`AssignmentOutcome::Assigned`].
    pub fn assign_trip_to_driver(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        offer_id: Option<OfferId>,
    ) -> Result<AssignmentOutcome, StoreError> {
        let Some(guard) = self.locks.lock_trip_and_driver(trip_id, driver_id)? else {
            info!(trip_id = %trip_id, driver_id = %driver_id, "assignment lock contended");
            return Ok(AssignmentOutcome::Contended);
        };
        // The guard releases on drop, whatever path the commit takes.
        let outcome = self.assign_locked(trip_id, driver_id, offer_id);
        guard.release();
        outcome
    }

    fn assign_locked(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        offer_id: Option<OfferId>,
    ) -> Result<AssignmentOutcome, StoreError> {
        let Some(trip) = self.trips.get(trip_id)? else {
            return Ok(AssignmentOutcome::TripUnavailable { status: None });
        };
        match trip.status {
            TripStatus::Requested if trip.driver_id.is_none() => {}
            TripStatus::Requested | TripStatus::Accepted => {
                return Ok(AssignmentOutcome::AlreadyAssigned {
                    driver: trip.driver_id,
                });
            }
            status => {
                return Ok(AssignmentOutcome::TripUnavailable {
                    status: Some(status),
                });
            }
        }

        if let Some(offer_id) = offer_id {
            match self.offers.get(offer_id)? {
                Some(offer)
                    if offer.trip_id == trip_id
                        && offer.driver_id == driver_id
                        && offer.status == OfferStatus::Pending => {}
                Some(_) | None => return Ok(AssignmentOutcome::OfferNoLongerValid),
            }
        }

        if !self
            .filter
            .is_eligible(driver_id, &OfferContext::commit(&trip))?
        {
            info!(trip_id = %trip_id, driver_id = %driver_id, "driver failed the commit re-check");
            return Ok(AssignmentOutcome::NoLongerEligible);
        }

        // The definitive race arbiter: conditional update on the still-
        // requested trip.
        match self.trips.assign_if_requested(trip_id, driver_id)? {
            ConditionalAssign::Assigned => {}
            ConditionalAssign::AlreadyAssigned { driver } => {
                return Ok(AssignmentOutcome::AlreadyAssigned { driver });
            }
            ConditionalAssign::NotAssignable { status } => {
                return Ok(AssignmentOutcome::TripUnavailable {
                    status: Some(status),
                });
            }
            ConditionalAssign::NotFound => {
                return Ok(AssignmentOutcome::TripUnavailable { status: None });
            }
        }

        if let Some(offer_id) = offer_id {
            match self.offers.accept_exclusive(offer_id)? {
                OfferAccept::Accepted => {}
                other => {
                    warn!(offer_id = %offer_id, ?other, "offer resolution raced the assignment");
                }
            }
        }

        self.store.kv_put(
            &keys::active_trip(driver_id),
            &trip_id.to_string(),
            Some(self.config.state_ttl_ms),
        )?;
        for loser in self
            .clear_offered_drivers(trip_id)?
            .into_iter()
            .filter(|d| *d != driver_id)
        {
            self.registry
                .notify(loser, &PushEvent::OfferRevoked { trip_id });
            self.return_to_available(loser, trip_id)?;
        }

        match self
            .state
            .transition(driver_id, DriverState::Busy, Some(trip_id))?
        {
            TransitionOutcome::Applied | TransitionOutcome::NoOp => {}
            TransitionOutcome::Rejected { from } => {
                warn!(driver_id = %driver_id, ?from, "winner's state would not move to busy");
            }
        }
        self.registry.notify(
            driver_id,
            &PushEvent::TripAccepted { trip_id, driver_id },
        );
        info!(trip_id = %trip_id, driver_id = %driver_id, "trip assigned");
        Ok(AssignmentOutcome::Assigned)
    }

    /// A driver turns an offer down. Trip status is untouched; for a
    /// sequential dispatch the caller advances the round separately.
    pub fn decline_trip_offer(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        offer_id: Option<OfferId>,
    ) -> Result<DeclineOutcome, StoreError> {
        let was_pending = self.store.offer_pending(trip_id, driver_id)?;
        self.store.offers_remove(trip_id, driver_id)?;
        match offer_id {
            Some(offer_id) => {
                self.offers.mark_rejected(offer_id)?;
            }
            None => {
                for offer in self.offers.pending_for_trip(trip_id)? {
                    if offer.driver_id == driver_id {
                        self.offers.mark_rejected(offer.id)?;
                    }
                }
            }
        }
        self.return_to_available(driver_id, trip_id)?;
        if was_pending {
            info!(trip_id = %trip_id, driver_id = %driver_id, "offer declined");
            Ok(DeclineOutcome::Declined)
        } else {
            debug!(trip_id = %trip_id, driver_id = %driver_id, "decline with nothing pending");
            Ok(DeclineOutcome::NothingPending)
        }
    }

    /// A notification round expired with no acceptance: clear the pending
    /// set, reject the leftover offers, and time the trip out if it is
    /// still waiting.
    pub fn handle_trip_timeout(&self, trip_id: TripId) -> Result<TimeoutOutcome, StoreError> {
        for driver in self.clear_offered_drivers(trip_id)? {
            self.registry
                .notify(driver, &PushEvent::OfferRevoked { trip_id });
            self.return_to_available(driver, trip_id)?;
        }
        for offer in self.offers.pending_for_trip(trip_id)? {
            self.offers.mark_rejected(offer.id)?;
        }
        self.store.kv_delete(&keys::sequential_round(trip_id))?;
        if self
            .trips
            .set_status_if(trip_id, TripStatus::Requested, TripStatus::TimedOut)?
        {
            info!(trip_id = %trip_id, "trip timed out with no acceptance");
            Ok(TimeoutOutcome::TimedOut)
        } else {
            debug!(trip_id = %trip_id, "timeout skipped, trip already moved on");
            Ok(TimeoutOutcome::Skipped)
        }
    }

    /// Frees a driver at the end of a trip: active-trip marker cleared,
    /// cooldown started. Zero cooldown returns them straight to available.
    pub fn release_driver(&self, driver_id: DriverId, cooldown_ms: u64) -> Result<(), StoreError> {
        self.store.kv_delete(&keys::active_trip(driver_id))?;
        self.state
            .complete_trip_cooldown(driver_id, cooldown_ms, None)?;
        info!(driver_id = %driver_id, cooldown_ms, "driver released");
        Ok(())
    }

    /// Cancels a trip before or after assignment. The driver, if any, is
    /// released with zero cooldown since no fault attaches to them.
    pub fn cancel_trip_assignment(&self, trip_id: TripId) -> Result<CancelOutcome, StoreError> {
        let Some(trip) = self.trips.get(trip_id)? else {
            return Ok(CancelOutcome::NotFound);
        };
        let cancelled = match trip.status {
            TripStatus::Requested => {
                self.trips
                    .set_status_if(trip_id, TripStatus::Requested, TripStatus::Cancelled)?
            }
            TripStatus::Accepted => {
                self.trips
                    .set_status_if(trip_id, TripStatus::Accepted, TripStatus::Cancelled)?
            }
            status => return Ok(CancelOutcome::AlreadyTerminal { status }),
        };
        if !cancelled {
            let status = self
                .trips
                .get(trip_id)?
                .map(|t| t.status)
                .unwrap_or(trip.status);
            return Ok(CancelOutcome::AlreadyTerminal { status });
        }

        for driver in self.clear_offered_drivers(trip_id)? {
            self.registry
                .notify(driver, &PushEvent::OfferRevoked { trip_id });
            self.return_to_available(driver, trip_id)?;
        }
        for offer in self.offers.pending_for_trip(trip_id)? {
            self.offers.mark_rejected(offer.id)?;
        }
        self.store.kv_delete(&keys::sequential_round(trip_id))?;
        if let Some(driver) = trip.driver_id {
            self.registry
                .notify(driver, &PushEvent::TripCancelled { trip_id });
            self.release_driver(driver, 0)?;
        }
        info!(trip_id = %trip_id, "trip cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Clears the trip's pending set and returns every driver who may be
    /// parked in `Offered` for it. The notified set is the union source:
    /// it outlives the pending set's TTL, so a cleanup that fires exactly
    /// at (or after) the round's expiry still reverts everyone.
    fn clear_offered_drivers(&self, trip_id: TripId) -> Result<Vec<DriverId>, StoreError> {
        let mut drivers: HashSet<DriverId> =
            self.store.offers_clear_trip(trip_id)?.into_iter().collect();
        for raw in self.store.set_members(&keys::notified(trip_id))? {
            match Uuid::parse_str(&raw) {
                Ok(id) => {
                    drivers.insert(DriverId::from(id));
                }
                Err(_) => warn!(member = %raw, "skipping unparseable notified-set member"),
            }
        }
        Ok(drivers.into_iter().collect())
    }

    /// Returns a driver to `Available` once nothing is pending for them
    /// and they are still parked in `Offered`.
    fn return_to_available(&self, driver: DriverId, trip_id: TripId) -> Result<(), StoreError> {
        if self.store.offers_for_driver(driver)?.is_empty()
            && self.state.current(driver)? == DriverState::Offered
        {
            self.state
                .transition(driver, DriverState::Available, Some(trip_id))?;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::geo::GeoPoint;
    use crate::ids::CustomerId;
    use crate::repo::{
        DriverRecord, DriverStatus, MemoryDriverRepository, MemoryOfferRepository,
        MemoryTripRepository, TripOffer, TripRecord, VehicleClass,
    };
    use crate::scheduler::TaskQueue;
    use crate::store::MemoryStore;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        drivers: Arc<MemoryDriverRepository>,
        trips: Arc<MemoryTripRepository>,
        offers: Arc<MemoryOfferRepository>,
        state: Arc<DriverStateMachine>,
        assignment: TripAssignmentService,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let drivers = Arc::new(MemoryDriverRepository::new());
        let trips = Arc::new(MemoryTripRepository::new());
        let offers = Arc::new(MemoryOfferRepository::new());
        let tasks = Arc::new(TaskQueue::new());
        let registry = Arc::new(PushRegistry::new());
        let config = EngineConfig::default().with_lock_retry_attempts(0);
        let state = Arc::new(DriverStateMachine::new(
            store.clone(),
            clock.clone(),
            tasks.clone(),
            config.clone(),
        ));
        let filter = Arc::new(DriverFilter::new(
            store.clone(),
            drivers.clone(),
            state.clone(),
            clock.clone(),
            config.clone(),
        ));
        let locks = Arc::new(TripLock::new(store.clone(), config.clone()));
        let assignment = TripAssignmentService::new(
            locks,
            filter,
            trips.clone(),
            offers.clone(),
            store.clone(),
            state.clone(),
            registry,
            config,
        );
        Fixture {
            clock,
            store,
            drivers,
            trips,
            offers,
            state,
            assignment,
        }
    }

    const PICKUP: GeoPoint = GeoPoint {
        lat: 30.0444,
        lng: 31.2357,
    };
    const DEST: GeoPoint = GeoPoint {
        lat: 30.0626,
        lng: 31.2497,
    };

    fn seed_trip(fx: &Fixture) -> TripId {
        let trip = TripRecord {
            id: TripId::new(),
            customer_id: CustomerId::new(),
            driver_id: None,
            status: TripStatus::Requested,
            pickup: PICKUP,
            dest: DEST,
            vehicle: VehicleClass::Comfort,
            price: 45.0,
        };
        let id = trip.id;
        fx.trips.insert(trip).expect("insert trip");
        id
    }

    fn seed_eligible_driver(fx: &Fixture) -> DriverId {
        let driver = DriverId::new();
        fx.drivers.upsert(DriverRecord {
            id: driver,
            status: DriverStatus::Approved,
            vehicle: VehicleClass::Comfort,
            vehicle_model: "Toyota Corolla".into(),
            rating: 4.8,
            last_position: Some(GeoPoint::new(30.0450, 31.2360)),
            last_location_update_ms: Some(fx.clock.now_ms()),
            dest_preference_enabled: false,
        });
        fx.store
            .kv_put(&keys::presence(driver), "1", Some(30_000))
            .expect("presence");
        fx.store
            .kv_put(
                &keys::location_touch(driver),
                &fx.clock.now_ms().to_string(),
                Some(30_000),
            )
            .expect("touch");
        fx.state
            .transition(driver, DriverState::Available, None)
            .expect("available");
        driver
    }

    fn seed_pending_offer(fx: &Fixture, trip: TripId, driver: DriverId) -> OfferId {
        let offer = TripOffer {
            id: OfferId::new(),
            trip_id: trip,
            driver_id: driver,
            offer_price: None,
            status: OfferStatus::Pending,
        };
        let id = offer.id;
        fx.offers.insert(offer).expect("insert offer");
        fx.store.offers_add(trip, &[driver], 15_000).expect("pending");
        fx.state
            .transition(driver, DriverState::Offered, Some(trip))
            .expect("offered");
        id
    }

    #[test]
    fn first_acceptance_wins_and_the_second_is_already_assigned() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let winner = seed_eligible_driver(&fx);
        let loser = seed_eligible_driver(&fx);

        let first = fx
            .assignment
            .assign_trip_to_driver(trip, winner, None)
            .expect("assign");
        assert_eq!(first, AssignmentOutcome::Assigned);

        let second = fx
            .assignment
            .assign_trip_to_driver(trip, loser, None)
            .expect("assign");
        assert_eq!(
            second,
            AssignmentOutcome::AlreadyAssigned {
                driver: Some(winner)
            }
        );
        let stored = fx.trips.get(trip).expect("get").expect("exists");
        assert_eq!(stored.status, TripStatus::Accepted);
        assert_eq!(stored.driver_id, Some(winner));
        // The winner is busy with an active-trip marker; the loser is
        // untouched.
        assert_eq!(
            fx.state.current(winner).expect("state"),
            DriverState::Busy
        );
        assert_eq!(
            fx.store
                .kv_get(&keys::active_trip(winner))
                .expect("marker")
                .as_deref(),
            Some(trip.to_string().as_str())
        );
        assert_eq!(
            fx.state.current(loser).expect("state"),
            DriverState::Available
        );
    }

    #[test]
    fn acceptance_resolves_the_offer_and_rejects_siblings() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let winner = seed_eligible_driver(&fx);
        let rival = seed_eligible_driver(&fx);
        let winning_offer = seed_pending_offer(&fx, trip, winner);
        let rival_offer = seed_pending_offer(&fx, trip, rival);

        let outcome = fx
            .assignment
            .assign_trip_to_driver(trip, winner, Some(winning_offer))
            .expect("assign");
        assert_eq!(outcome, AssignmentOutcome::Assigned);
        assert_eq!(
            fx.offers
                .get(winning_offer)
                .expect("get")
                .expect("exists")
                .status,
            OfferStatus::Accepted
        );
        assert_eq!(
            fx.offers
                .get(rival_offer)
                .expect("get")
                .expect("exists")
                .status,
            OfferStatus::Rejected
        );
        // Pending bookkeeping is gone on both sides and the rival is back
        // in the pool.
        assert!(fx.store.offers_for_trip(trip).expect("trip side").is_empty());
        assert!(fx
            .store
            .offers_for_driver(rival)
            .expect("driver side")
            .is_empty());
        assert_eq!(
            fx.state.current(rival).expect("state"),
            DriverState::Available
        );
        // The rejected offer can never be accepted.
        let late = fx
            .assignment
            .assign_trip_to_driver(trip, rival, Some(rival_offer))
            .expect("assign");
        assert_eq!(
            late,
            AssignmentOutcome::AlreadyAssigned {
                driver: Some(winner)
            }
        );
    }

    #[test]
    fn commit_recheck_rejects_a_driver_who_went_dark() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        // The driver's client stopped heartbeating after ranking.
        fx.store.kv_delete(&keys::presence(driver)).expect("delete");

        let outcome = fx
            .assignment
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");
        assert_eq!(outcome, AssignmentOutcome::NoLongerEligible);
        let stored = fx.trips.get(trip).expect("get").expect("exists");
        assert_eq!(stored.status, TripStatus::Requested);
        assert_eq!(stored.driver_id, None);
    }

    #[test]
    fn resolved_offer_is_rejected_before_the_commit() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        let offer = seed_pending_offer(&fx, trip, driver);
        fx.offers.mark_rejected(offer).expect("reject");

        let outcome = fx
            .assignment
            .assign_trip_to_driver(trip, driver, Some(offer))
            .expect("assign");
        assert_eq!(outcome, AssignmentOutcome::OfferNoLongerValid);
        assert_eq!(
            fx.trips.get(trip).expect("get").expect("exists").status,
            TripStatus::Requested
        );
    }

    #[test]
    fn contended_driver_lock_surfaces_as_processing() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        // Another assignment attempt holds the driver lock.
        let locks = TripLock::new(
            fx.store.clone(),
            EngineConfig::default().with_lock_retry_attempts(0),
        );
        let held = locks.lock_driver(driver).expect("acquire").expect("free");

        let outcome = fx
            .assignment
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");
        assert_eq!(outcome, AssignmentOutcome::Contended);
        held.release();
    }

    #[test]
    fn decline_clears_bookkeeping_and_frees_the_driver() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        let offer = seed_pending_offer(&fx, trip, driver);

        let outcome = fx
            .assignment
            .decline_trip_offer(trip, driver, Some(offer))
            .expect("decline");
        assert_eq!(outcome, DeclineOutcome::Declined);
        assert!(!fx.store.offer_pending(trip, driver).expect("pending"));
        assert_eq!(
            fx.offers.get(offer).expect("get").expect("exists").status,
            OfferStatus::Rejected
        );
        assert_eq!(
            fx.state.current(driver).expect("state"),
            DriverState::Available
        );
        // Trip untouched.
        assert_eq!(
            fx.trips.get(trip).expect("get").expect("exists").status,
            TripStatus::Requested
        );

        let again = fx
            .assignment
            .decline_trip_offer(trip, driver, Some(offer))
            .expect("decline");
        assert_eq!(again, DeclineOutcome::NothingPending);
    }

    #[test]
    fn timeout_flips_only_a_still_requested_trip() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        let offer = seed_pending_offer(&fx, trip, driver);

        assert_eq!(
            fx.assignment.handle_trip_timeout(trip).expect("timeout"),
            TimeoutOutcome::TimedOut
        );
        assert_eq!(
            fx.trips.get(trip).expect("get").expect("exists").status,
            TripStatus::TimedOut
        );
        assert_eq!(
            fx.offers.get(offer).expect("get").expect("exists").status,
            OfferStatus::Rejected
        );
        assert_eq!(
            fx.state.current(driver).expect("state"),
            DriverState::Available
        );

        // A second firing is a no-op.
        assert_eq!(
            fx.assignment.handle_trip_timeout(trip).expect("timeout"),
            TimeoutOutcome::Skipped
        );
    }

    #[test]
    fn timeout_after_acceptance_leaves_the_trip_accepted() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        fx.assignment
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");

        assert_eq!(
            fx.assignment.handle_trip_timeout(trip).expect("timeout"),
            TimeoutOutcome::Skipped
        );
        assert_eq!(
            fx.trips.get(trip).expect("get").expect("exists").status,
            TripStatus::Accepted
        );
    }

    #[test]
    fn release_driver_starts_cooldown_and_clears_the_marker() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        fx.assignment
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");

        fx.assignment
            .release_driver(driver, 120_000)
            .expect("release");
        assert_eq!(
            fx.store.kv_get(&keys::active_trip(driver)).expect("marker"),
            None
        );
        assert_eq!(
            fx.state.current(driver).expect("state"),
            DriverState::Cooldown
        );
    }

    #[test]
    fn cancel_releases_the_assigned_driver_with_zero_cooldown() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        fx.assignment
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");

        let outcome = fx
            .assignment
            .cancel_trip_assignment(trip)
            .expect("cancel");
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert_eq!(
            fx.trips.get(trip).expect("get").expect("exists").status,
            TripStatus::Cancelled
        );
        // Zero cooldown: straight back to available.
        assert_eq!(
            fx.state.current(driver).expect("state"),
            DriverState::Available
        );
        assert_eq!(
            fx.store.kv_get(&keys::active_trip(driver)).expect("marker"),
            None
        );

        assert_eq!(
            fx.assignment.cancel_trip_assignment(trip).expect("cancel"),
            CancelOutcome::AlreadyTerminal {
                status: TripStatus::Cancelled
            }
        );
    }

    #[test]
    fn cancel_before_assignment_revokes_pending_offers() {
        let fx = fixture();
        let trip = seed_trip(&fx);
        let driver = seed_eligible_driver(&fx);
        let offer = seed_pending_offer(&fx, trip, driver);

        assert_eq!(
            fx.assignment.cancel_trip_assignment(trip).expect("cancel"),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            fx.offers.get(offer).expect("get").expect("exists").status,
            OfferStatus::Rejected
        );
        assert_eq!(
            fx.state.current(driver).expect("state"),
            DriverState::Available
        );
    }
}
