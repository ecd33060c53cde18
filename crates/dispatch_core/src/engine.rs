//! The engine facade: wires the stores, services, push registry, task
//! queue, and configuration into the surface the request-handling layer
//! calls.
//!
//! Every method returns expected business conditions as outcome values
//! with human-readable messages; `Err` is reserved for infrastructure
//! failure. The host owns the timer: it calls [`DispatchEngine::run_due`]
//! whenever tasks come due (see [`DispatchEngine::next_fire_at_ms`]).

use std::sync::Arc;

use tracing::info;

use crate::assignment::{
    AssignmentOutcome, CancelOutcome, DeclineOutcome, TimeoutOutcome, TripAssignmentService,
};
use crate::clock::Clock;
use crate::config::{EngineConfig, DEFAULT_MIN_RATING};
use crate::dispatch::{DispatchOutcome, DispatchStrategyService, SequentialAdvance};
use crate::driver_state::{DriverState, DriverStateMachine, TransitionRecord};
use crate::error::EngineError;
use crate::filter::{DriverFilter, EligibilityReport, OfferContext};
use crate::geo::GeoPoint;
use crate::ids::{DriverId, OfferId, TripId};
use crate::location::{DriverLocation, LocationCache, LocationMetadata};
use crate::lock::TripLock;
use crate::matching::{MatchRequest, MatchingService, PlaceholderStats, ScoredDriver};
use crate::presence::DriverPresence;
use crate::push::{PushRegistry, PushSender};
use crate::repo::{
    DriverRepository, MemoryDriverRepository, MemoryOfferRepository, MemoryTripRepository,
    OfferRepository, TripRepository,
};
use crate::scheduler::{EngineTask, TaskQueue};
use crate::store::{FastStore, MemoryStore};
use crate::tracker::{RouteArchive, RoutePoint, TripTracker};

pub struct DispatchEngine {
    clock: Arc<dyn Clock>,
    trips: Arc<dyn TripRepository>,
    tasks: Arc<TaskQueue>,
    registry: Arc<PushRegistry>,
    presence: DriverPresence,
    location: Arc<LocationCache>,
    state: Arc<DriverStateMachine>,
    filter: Arc<DriverFilter>,
    matching: Arc<MatchingService>,
    dispatch: DispatchStrategyService,
    assignment: TripAssignmentService,
    tracker: TripTracker,
    config: EngineConfig,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn FastStore>,
        drivers: Arc<dyn DriverRepository>,
        trips: Arc<dyn TripRepository>,
        offers: Arc<dyn OfferRepository>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let tasks = Arc::new(TaskQueue::new());
        let registry = Arc::new(PushRegistry::new());
        let presence = DriverPresence::new(store.clone(), clock.clone(), config.clone());
        let location = Arc::new(LocationCache::new(
            store.clone(),
            clock.clone(),
            config.clone(),
        ));
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
        let matching = Arc::new(MatchingService::new(
            location.clone(),
            drivers.clone(),
            filter.clone(),
            Arc::new(PlaceholderStats),
            config.clone(),
        ));
        let dispatch = DispatchStrategyService::new(
            store.clone(),
            trips.clone(),
            offers.clone(),
            matching.clone(),
            state.clone(),
            registry.clone(),
            tasks.clone(),
            clock.clone(),
            config.clone(),
        );
        let locks = Arc::new(TripLock::new(store.clone(), config.clone()));
        let assignment = TripAssignmentService::new(
            locks,
            filter.clone(),
            trips.clone(),
            offers,
            store.clone(),
            state.clone(),
            registry.clone(),
            config.clone(),
        );
        let tracker = TripTracker::new(store, clock.clone(), config.clone());
        Self {
            clock,
            trips,
            tasks,
            registry,
            presence,
            location,
            state,
            filter,
            matching,
            dispatch,
            assignment,
            tracker,
            config,
        }
    }

    /// An engine over the in-process store and repositories, with handles
    /// to seed them. Backs tests, benchmarks, and single-node deployments.
    pub fn in_memory(clock: Arc<dyn Clock>, config: EngineConfig) -> InMemoryEngine {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let drivers = Arc::new(MemoryDriverRepository::new());
        let trips = Arc::new(MemoryTripRepository::new());
        let offers = Arc::new(MemoryOfferRepository::new());
        let engine = DispatchEngine::new(
            store.clone(),
            drivers.clone(),
            trips.clone(),
            offers.clone(),
            clock,
            config,
        );
        InMemoryEngine {
            engine,
            store,
            drivers,
            trips,
            offers,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Driver-side surface: sessions, presence, positions.

    pub fn connect_driver(&self, driver: DriverId, sender: Arc<dyn PushSender>) {
        self.registry.connect(driver, sender);
    }

    pub fn disconnect_driver(&self, driver: DriverId) {
        self.registry.disconnect(driver);
    }

    pub fn set_online(&self, driver: DriverId) -> Result<(), EngineError> {
        self.presence.set_online(driver)?;
        self.state.transition(driver, DriverState::Available, None)?;
        Ok(())
    }

    pub fn set_offline(&self, driver: DriverId) -> Result<(), EngineError> {
        self.state.transition(driver, DriverState::Offline, None)?;
        self.presence.set_offline(driver)?;
        Ok(())
    }

    pub fn is_online(&self, driver: DriverId) -> Result<bool, EngineError> {
        Ok(self.presence.is_online(driver)?)
    }

    pub fn presence_time_remaining_secs(&self, driver: DriverId) -> Result<i64, EngineError> {
        Ok(self.presence.time_remaining_secs(driver)?)
    }

    pub fn update_location(
        &self,
        driver: DriverId,
        position: GeoPoint,
        metadata: Option<LocationMetadata>,
    ) -> Result<(), EngineError> {
        Ok(self.location.update_location(driver, position, metadata)?)
    }

    pub fn get_location(&self, driver: DriverId) -> Result<Option<DriverLocation>, EngineError> {
        Ok(self.location.get_location(driver)?)
    }

    pub fn driver_state(&self, driver: DriverId) -> Result<DriverState, EngineError> {
        Ok(self.state.current(driver)?)
    }

    pub fn driver_state_history(
        &self,
        driver: DriverId,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        Ok(self.state.history(driver)?)
    }

    // Matching and dispatch surface.

    pub fn find_optimal_drivers(
        &self,
        request: &MatchRequest,
        limit: usize,
    ) -> Result<Vec<ScoredDriver>, EngineError> {
        Ok(self.matching.find_optimal_drivers(request, limit)?)
    }

    /// Diagnostic eligibility breakdown for a driver against a trip; `None`
    /// when the trip does not exist.
    pub fn eligibility_report(
        &self,
        driver: DriverId,
        trip_id: TripId,
    ) -> Result<Option<EligibilityReport>, EngineError> {
        let Some(trip) = self.trips.get(trip_id)? else {
            return Ok(None);
        };
        let ctx = OfferContext::ranking(&trip, DEFAULT_MIN_RATING);
        Ok(Some(self.filter.eligibility_report(driver, &ctx)?))
    }

    pub fn dispatch_first_accept(&self, trip_id: TripId) -> Result<DispatchOutcome, EngineError> {
        Ok(self.dispatch.dispatch_first_accept(trip_id)?)
    }

    pub fn dispatch_broadcast_bid(&self, trip_id: TripId) -> Result<DispatchOutcome, EngineError> {
        Ok(self.dispatch.dispatch_broadcast_bid(trip_id)?)
    }

    pub fn dispatch_sequential(&self, trip_id: TripId) -> Result<DispatchOutcome, EngineError> {
        Ok(self.dispatch.dispatch_sequential(trip_id)?)
    }

    pub fn dispatch_scheduled(
        &self,
        trip_id: TripId,
        pickup_at_ms: u64,
    ) -> Result<DispatchOutcome, EngineError> {
        Ok(self.dispatch.dispatch_scheduled(trip_id, pickup_at_ms)?)
    }

    pub fn retry_dispatch(&self, trip_id: TripId) -> Result<DispatchOutcome, EngineError> {
        Ok(self.dispatch.retry_dispatch(trip_id)?)
    }

    pub fn next_sequential_driver(
        &self,
        trip_id: TripId,
    ) -> Result<Option<DriverId>, EngineError> {
        Ok(self.dispatch.next_sequential_driver(trip_id)?)
    }

    pub fn record_bid(&self, offer_id: OfferId, price: f64) -> Result<bool, EngineError> {
        Ok(self.dispatch.record_bid(offer_id, price)?)
    }

    // Assignment surface.

    pub fn assign_trip_to_driver(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        offer_id: Option<OfferId>,
    ) -> Result<AssignmentOutcome, EngineError> {
        Ok(self
            .assignment
            .assign_trip_to_driver(trip_id, driver_id, offer_id)?)
    }

    /// Decline an offer; for a sequential dispatch this also advances to
    /// the next candidate in the precomputed list.
    pub fn decline_trip_offer(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        offer_id: Option<OfferId>,
    ) -> Result<DeclineOutcome, EngineError> {
        let outcome = self
            .assignment
            .decline_trip_offer(trip_id, driver_id, offer_id)?;
        if outcome == DeclineOutcome::Declined {
            self.dispatch.advance_after_decline(trip_id, driver_id)?;
        }
        Ok(outcome)
    }

    pub fn handle_trip_timeout(&self, trip_id: TripId) -> Result<TimeoutOutcome, EngineError> {
        Ok(self.assignment.handle_trip_timeout(trip_id)?)
    }

    pub fn cancel_trip_assignment(&self, trip_id: TripId) -> Result<CancelOutcome, EngineError> {
        Ok(self.assignment.cancel_trip_assignment(trip_id)?)
    }

    pub fn release_driver(
        &self,
        driver_id: DriverId,
        cooldown_ms: u64,
    ) -> Result<(), EngineError> {
        Ok(self.assignment.release_driver(driver_id, cooldown_ms)?)
    }

    // Tracking surface.

    pub fn start_tracking(&self, trip: TripId, driver: DriverId) -> Result<(), EngineError> {
        Ok(self.tracker.start_tracking(trip, driver)?)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_route_point(
        &self,
        trip: TripId,
        lat: f64,
        lng: f64,
        timestamp_ms: Option<u64>,
        speed_mps: Option<f64>,
        heading_deg: Option<f64>,
    ) -> Result<(), EngineError> {
        Ok(self
            .tracker
            .add_route_point(trip, lat, lng, timestamp_ms, speed_mps, heading_deg)?)
    }

    pub fn get_route_points(&self, trip: TripId) -> Result<Vec<RoutePoint>, EngineError> {
        Ok(self.tracker.get_route_points(trip)?)
    }

    pub fn calculate_trip_distance(&self, trip: TripId) -> Result<f64, EngineError> {
        Ok(self.tracker.calculate_trip_distance(trip)?)
    }

    pub fn stop_tracking(
        &self,
        trip: TripId,
        archive: Option<RouteArchive<'_>>,
    ) -> Result<Vec<RoutePoint>, EngineError> {
        self.tracker.stop_tracking(trip, archive)
    }

    // Timer surface.

    /// Fire time of the next deferred task, for the host's timer.
    pub fn next_fire_at_ms(&self) -> Option<u64> {
        self.tasks.next_fire_at_ms()
    }

    /// Drains every task due at the current time. Each task re-checks its
    /// guard, so one that raced a state change is a no-op.
    pub fn run_due(&self) -> Result<usize, EngineError> {
        let mut processed = 0;
        while let Some(task) = self.tasks.pop_due(self.clock.now_ms()) {
            processed += 1;
            match task {
                EngineTask::DispatchTimeout { trip_id } => {
                    self.assignment.handle_trip_timeout(trip_id)?;
                }
                EngineTask::SequentialAdvance { trip_id, round } => {
                    let advanced = self.dispatch.advance_sequential(trip_id, Some(round))?;
                    if advanced == SequentialAdvance::Exhausted {
                        self.assignment.handle_trip_timeout(trip_id)?;
                    }
                }
                EngineTask::CooldownExpiry { driver_id } => {
                    self.state.apply_cooldown_expiry(driver_id)?;
                }
                EngineTask::ScheduledDispatch { trip_id } => {
                    let outcome = self.dispatch.dispatch_first_accept(trip_id)?;
                    info!(trip_id = %trip_id, outcome = %outcome.message(), "scheduled dispatch fired");
                }
            }
        }
        Ok(processed)
    }
}

/// A [`DispatchEngine`] over the in-process store, with seeding handles.
pub struct InMemoryEngine {
    pub engine: DispatchEngine,
    pub store: Arc<MemoryStore>,
    pub drivers: Arc<MemoryDriverRepository>,
    pub trips: Arc<MemoryTripRepository>,
    pub offers: Arc<MemoryOfferRepository>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::push::PushEvent;
    use crate::repo::{OfferStatus, TripStatus};
    use crate::test_helpers::{approved_driver, requested_trip, RecordingSender};
    use crate::ids::CustomerId;

    fn engine() -> (Arc<ManualClock>, InMemoryEngine) {
        let clock = ManualClock::new(1_000_000);
        let env = DispatchEngine::in_memory(clock.clone(), EngineConfig::default());
        (clock, env)
    }

    /// Seeds an approved driver, brings them online, and reports their
    /// position, leaving them fully eligible.
    fn bring_online(env: &InMemoryEngine, clock: &ManualClock, position: GeoPoint) -> DriverId {
        let driver = DriverId::new();
        env.drivers
            .upsert(approved_driver(driver, position, clock.now_ms()));
        env.engine.set_online(driver).expect("online");
        env.engine
            .update_location(driver, position, None)
            .expect("location");
        driver
    }

    fn seed_trip(env: &InMemoryEngine) -> TripId {
        let trip = requested_trip(CustomerId::new());
        let id = trip.id;
        env.trips.insert(trip).expect("insert trip");
        id
    }

    #[test]
    fn simple_assignment_scenario() {
        let (clock, env) = engine();
        // One eligible comfort driver roughly 300 m from the pickup.
        let driver = bring_online(&env, &clock, GeoPoint::new(30.0471, 31.2357));
        let trip = seed_trip(&env);

        let trip_record = env.trips.get(trip).expect("get").expect("exists");
        let ranked = env
            .engine
            .find_optimal_drivers(&MatchRequest::from_trip(&trip_record), 5)
            .expect("ranked");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].driver_id, driver);
        // ~300 m of a 10 km radius: the distance component sits near its
        // maximum.
        assert!(ranked[0].breakdown.distance > 0.96);
        assert_eq!(ranked[0].breakdown.vehicle_match, 1.0);

        let outcome = env
            .engine
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");
        assert_eq!(outcome, AssignmentOutcome::Assigned);
        assert!(outcome.success());

        let rival = bring_online(&env, &clock, GeoPoint::new(30.0480, 31.2360));
        let second = env
            .engine
            .assign_trip_to_driver(trip, rival, None)
            .expect("assign");
        assert_eq!(
            second,
            AssignmentOutcome::AlreadyAssigned {
                driver: Some(driver)
            }
        );
        assert_eq!(second.message(), "trip already assigned");
    }

    #[test]
    fn concurrent_acceptances_commit_exactly_once() {
        let (clock, env) = engine();
        let trip = seed_trip(&env);
        let drivers: Vec<DriverId> = (0..4)
            .map(|i| {
                bring_online(
                    &env,
                    &clock,
                    GeoPoint::new(30.0450 + f64::from(i) * 0.002, 31.2360),
                )
            })
            .collect();

        let outcomes: Vec<AssignmentOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = drivers
                .iter()
                .map(|driver| {
                    let engine = &env.engine;
                    let driver = *driver;
                    scope.spawn(move || {
                        engine
                            .assign_trip_to_driver(trip, driver, None)
                            .expect("assign")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });

        let winners = outcomes.iter().filter(|o| o.success()).count();
        assert_eq!(winners, 1);
        for outcome in &outcomes {
            if !outcome.success() {
                assert!(matches!(
                    outcome,
                    AssignmentOutcome::AlreadyAssigned { .. } | AssignmentOutcome::Contended
                ));
            }
        }
        let stored = env.trips.get(trip).expect("get").expect("exists");
        assert_eq!(stored.status, TripStatus::Accepted);
        assert!(stored.driver_id.is_some());
    }

    #[test]
    fn cooldown_auto_recovery_scenario() {
        let (clock, env) = engine();
        let driver = bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));
        let trip = seed_trip(&env);
        env.engine
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");
        assert_eq!(
            env.engine.driver_state(driver).expect("state"),
            DriverState::Busy
        );

        env.engine.release_driver(driver, 2_000).expect("release");
        assert_eq!(
            env.engine.driver_state(driver).expect("state"),
            DriverState::Cooldown
        );

        clock.advance_ms(2_000);
        env.engine.run_due().expect("run due");
        assert_eq!(
            env.engine.driver_state(driver).expect("state"),
            DriverState::Available
        );
    }

    #[test]
    fn sequential_exhaustion_scenario() {
        let (clock, env) = engine();
        let trip = seed_trip(&env);
        let drivers: Vec<DriverId> = (0..3)
            .map(|i| {
                bring_online(
                    &env,
                    &clock,
                    GeoPoint::new(30.0450 + f64::from(i) * 0.002, 31.2360),
                )
            })
            .collect();

        let outcome = env.engine.dispatch_sequential(trip).expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Notified { .. }));

        // Each candidate declines in turn.
        for _ in 0..3 {
            let current = env
                .engine
                .next_sequential_driver(trip)
                .expect("next")
                .expect("candidate on offer");
            assert!(drivers.contains(&current));
            env.engine
                .decline_trip_offer(trip, current, None)
                .expect("decline");
        }

        assert_eq!(env.engine.next_sequential_driver(trip).expect("next"), None);
        // The trip is still requested and now eligible for timeout
        // handling.
        assert_eq!(
            env.engine.handle_trip_timeout(trip).expect("timeout"),
            TimeoutOutcome::TimedOut
        );
        assert_eq!(
            env.trips.get(trip).expect("get").expect("exists").status,
            TripStatus::TimedOut
        );
    }

    #[test]
    fn fallback_on_empty_cache_scenario() {
        let (clock, env) = engine();
        let driver = DriverId::new();
        env.drivers.upsert(approved_driver(
            driver,
            GeoPoint::new(30.0450, 31.2360),
            clock.now_ms(),
        ));
        // Online and heartbeating, but the geospatial cache never saw a
        // position (cold start).
        env.engine.set_online(driver).expect("online");

        let trip = seed_trip(&env);
        let trip_record = env.trips.get(trip).expect("get").expect("exists");
        let ranked = env
            .engine
            .find_optimal_drivers(&MatchRequest::from_trip(&trip_record), 5)
            .expect("ranked");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].driver_id, driver);
        assert!(ranked[0].distance_m > 0.0);
    }

    #[test]
    fn first_accept_round_times_out_through_the_task_queue() {
        let (clock, env) = engine();
        let trip = seed_trip(&env);
        let driver = bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));

        let outcome = env.engine.dispatch_first_accept(trip).expect("dispatch");
        let DispatchOutcome::Notified { expires_at_ms, .. } = outcome else {
            panic!("expected a notified outcome");
        };
        assert_eq!(env.engine.next_fire_at_ms(), Some(expires_at_ms));

        clock.set_ms(expires_at_ms);
        env.engine.run_due().expect("run due");
        assert_eq!(
            env.trips.get(trip).expect("get").expect("exists").status,
            TripStatus::TimedOut
        );
        assert_eq!(
            env.engine.driver_state(driver).expect("state"),
            DriverState::Available
        );
        assert!(env.store.offers_for_trip(trip).expect("pending").is_empty());
    }

    #[test]
    fn scheduled_dispatch_fires_at_the_lead_time() {
        let (clock, env) = engine();
        let trip = seed_trip(&env);
        let driver = bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));

        let pickup_at = clock.now_ms() + 60 * 60 * 1_000;
        let outcome = env
            .engine
            .dispatch_scheduled(trip, pickup_at)
            .expect("dispatch");
        let DispatchOutcome::Scheduled { dispatch_at_ms } = outcome else {
            panic!("expected a scheduled outcome");
        };
        // Nothing happens before the dispatch time.
        env.engine.run_due().expect("run due");
        assert_eq!(
            env.engine.driver_state(driver).expect("state"),
            DriverState::Available
        );

        clock.set_ms(dispatch_at_ms);
        // The driver's heartbeat keeps them fresh across the jump.
        env.engine
            .update_location(driver, GeoPoint::new(30.0450, 31.2360), None)
            .expect("heartbeat");
        env.engine.run_due().expect("run due");
        assert_eq!(
            env.engine.driver_state(driver).expect("state"),
            DriverState::Offered
        );
        assert!(env.store.offer_pending(trip, driver).expect("pending"));
    }

    #[test]
    fn push_events_flow_to_winners_and_losers() {
        let (clock, env) = engine();
        let trip = seed_trip(&env);
        let winner = bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));
        let loser = bring_online(&env, &clock, GeoPoint::new(30.0460, 31.2370));
        let winner_client = RecordingSender::reachable();
        let loser_client = RecordingSender::reachable();
        env.engine.connect_driver(winner, winner_client.clone());
        env.engine.connect_driver(loser, loser_client.clone());

        env.engine.dispatch_first_accept(trip).expect("dispatch");
        assert!(winner_client
            .events()
            .iter()
            .any(|e| matches!(e, PushEvent::NewTripOffer { .. })));
        assert!(loser_client
            .events()
            .iter()
            .any(|e| matches!(e, PushEvent::NewTripOffer { .. })));

        let winning_offer = env
            .offers
            .pending_for_trip(trip)
            .expect("rows")
            .into_iter()
            .find(|o| o.driver_id == winner)
            .expect("winner offer");
        let outcome = env
            .engine
            .assign_trip_to_driver(trip, winner, Some(winning_offer.id))
            .expect("assign");
        assert_eq!(outcome, AssignmentOutcome::Assigned);

        assert!(winner_client
            .events()
            .iter()
            .any(|e| matches!(e, PushEvent::TripAccepted { .. })));
        assert!(loser_client
            .events()
            .iter()
            .any(|e| matches!(e, PushEvent::OfferRevoked { .. })));
        // The loser's offer row was rejected with the sibling sweep.
        let loser_offer = env
            .offers
            .pending_for_trip(trip)
            .expect("rows")
            .iter()
            .find(|o| o.driver_id == loser)
            .cloned();
        assert!(loser_offer.is_none());
        assert_eq!(
            env.engine.driver_state(loser).expect("state"),
            DriverState::Available
        );
    }

    #[test]
    fn offline_driver_disappears_from_matching_after_presence_lapse() {
        let (clock, env) = engine();
        let driver = bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));
        let trip = seed_trip(&env);
        let trip_record = env.trips.get(trip).expect("get").expect("exists");

        assert_eq!(
            env.engine
                .find_optimal_drivers(&MatchRequest::from_trip(&trip_record), 5)
                .expect("ranked")
                .len(),
            1
        );

        // No heartbeat for longer than the presence TTL and the freshness
        // window: silently invisible, no explicit go-offline call.
        clock.advance_ms(EngineConfig::default().presence_ttl_ms + 1);
        // The durable record is also stale by now.
        let mut record = env.drivers.get(driver).expect("get").expect("record");
        record.last_location_update_ms =
            Some(clock.now_ms() - EngineConfig::default().location_freshness_ms - 1);
        env.drivers.upsert(record);
        assert!(env
            .engine
            .find_optimal_drivers(&MatchRequest::from_trip(&trip_record), 5)
            .expect("ranked")
            .is_empty());
    }

    #[test]
    fn eligibility_report_surfaces_the_failing_checks() {
        let (clock, env) = engine();
        let driver = bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));
        let trip = seed_trip(&env);

        let report = env
            .engine
            .eligibility_report(driver, trip)
            .expect("report")
            .expect("trip exists");
        assert!(report.eligible);

        env.engine.set_offline(driver).expect("offline");
        let report = env
            .engine
            .eligibility_report(driver, trip)
            .expect("report")
            .expect("trip exists");
        assert!(!report.eligible);
        assert!(report.checks.iter().any(|c| !c.passed));

        assert!(env
            .engine
            .eligibility_report(driver, TripId::new())
            .expect("report")
            .is_none());
    }

    #[test]
    fn tracking_runs_once_a_trip_is_under_way() {
        let (clock, env) = engine();
        let driver = bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));
        let trip = seed_trip(&env);
        env.engine
            .assign_trip_to_driver(trip, driver, None)
            .expect("assign");

        env.engine.start_tracking(trip, driver).expect("start");
        for i in 0..3 {
            env.engine
                .add_route_point(
                    trip,
                    30.0450 + f64::from(i) * 0.001,
                    31.2360,
                    None,
                    Some(8.0),
                    None,
                )
                .expect("point");
        }
        assert!(env.engine.calculate_trip_distance(trip).expect("distance") > 0.0);
        let points = env.engine.stop_tracking(trip, None).expect("stop");
        assert_eq!(points.len(), 3);
        assert!(env.engine.get_route_points(trip).expect("points").is_empty());
    }

    #[test]
    fn broadcast_bids_reach_the_offer_rows() {
        let (clock, env) = engine();
        let trip = seed_trip(&env);
        bring_online(&env, &clock, GeoPoint::new(30.0450, 31.2360));
        bring_online(&env, &clock, GeoPoint::new(30.0460, 31.2370));

        let outcome = env.engine.dispatch_broadcast_bid(trip).expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Notified { .. }));
        let offer = env.offers.pending_for_trip(trip).expect("rows")[0].clone();
        assert!(env.engine.record_bid(offer.id, 57.0).expect("bid"));
        assert_eq!(
            env.offers
                .get(offer.id)
                .expect("get")
                .expect("exists")
                .offer_price,
            Some(57.0)
        );
        // The customer's pick commits through the same atomic path.
        let outcome = env
            .engine
            .assign_trip_to_driver(trip, offer.driver_id, Some(offer.id))
            .expect("assign");
        assert_eq!(outcome, AssignmentOutcome::Assigned);
        assert_eq!(
            env.offers
                .get(offer.id)
                .expect("get")
                .expect("exists")
                .status,
            OfferStatus::Accepted
        );
    }
}
