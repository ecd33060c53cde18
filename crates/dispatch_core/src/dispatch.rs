//! Dispatch policies: turning a ranked list into notified drivers.
//!
//! Each policy records pending-offer bookkeeping (the mutual trip↔driver
//! sets) with a shared expiry, moves the notified drivers into the
//! `Offered` lifecycle state, pushes the offer to their clients, and
//! schedules the round's expiry task. Who wins is never decided here; the
//! assignment path owns the commit.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::driver_state::{DriverState, DriverStateMachine, TransitionOutcome};
use crate::error::StoreError;
use crate::ids::{DriverId, OfferId, TripId};
use crate::matching::{MatchRequest, MatchingService};
use crate::push::{PushEvent, PushRegistry};
use crate::repo::{OfferRepository, OfferStatus, TripOffer, TripRecord, TripRepository, TripStatus};
use crate::scheduler::{EngineTask, TaskQueue};
use crate::store::{keys, FastStore};

/// The notification policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    FirstAccept,
    BroadcastBid,
    Sequential,
    Scheduled,
}

/// Result of a dispatch call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Notified {
        strategy: DispatchStrategy,
        drivers: Vec<DriverId>,
        expires_at_ms: u64,
    },
    Scheduled {
        dispatch_at_ms: u64,
    },
    NoCandidates,
    TripUnavailable,
}

impl DispatchOutcome {
    pub fn success(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Notified { .. } | DispatchOutcome::Scheduled { .. }
        )
    }

    pub fn message(&self) -> String {
        match self {
            DispatchOutcome::Notified { drivers, .. } => {
                format!("notified {} driver(s)", drivers.len())
            }
            DispatchOutcome::Scheduled { .. } => "dispatch scheduled".into(),
            DispatchOutcome::NoCandidates => "no drivers nearby".into(),
            DispatchOutcome::TripUnavailable => "trip is not open for dispatch".into(),
        }
    }
}

/// Result of advancing a sequential dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum SequentialAdvance {
    Advanced {
        driver: DriverId,
        round: u32,
        expires_at_ms: u64,
    },
    /// The ranked list is spent; the trip is ready for timeout handling.
    Exhausted,
    /// A response for a round that already moved on; ignored.
    Stale,
    NotActive,
}

/// The precomputed ranked list and the current round, kept in the fast
/// store so a late response can be checked against the round it belongs to.
#[derive(Debug, Serialize, Deserialize)]
struct SequentialState {
    ranked: Vec<DriverId>,
    round: u32,
}

pub struct DispatchStrategyService {
    store: Arc<dyn FastStore>,
    trips: Arc<dyn TripRepository>,
    offers: Arc<dyn OfferRepository>,
    matching: Arc<MatchingService>,
    state: Arc<DriverStateMachine>,
    registry: Arc<PushRegistry>,
    tasks: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl DispatchStrategyService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn FastStore>,
        trips: Arc<dyn TripRepository>,
        offers: Arc<dyn OfferRepository>,
        matching: Arc<MatchingService>,
        state: Arc<DriverStateMachine>,
        registry: Arc<PushRegistry>,
        tasks: Arc<TaskQueue>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            trips,
            offers,
            matching,
            state,
            registry,
            tasks,
            clock,
            config,
        }
    }

    /// Notify the top candidates at once; the first committed acceptance
    /// wins and clearing the pending set invalidates the rest.
    pub fn dispatch_first_accept(&self, trip_id: TripId) -> Result<DispatchOutcome, StoreError> {
        self.dispatch_simultaneous(
            trip_id,
            DispatchStrategy::FirstAccept,
            self.config.first_accept_fanout,
            self.config.first_accept_ttl_ms,
            &HashSet::new(),
        )
    }

    /// Wider fan-out with a longer window; drivers respond with a bid and
    /// the customer picks, so nobody wins here either.
    pub fn dispatch_broadcast_bid(&self, trip_id: TripId) -> Result<DispatchOutcome, StoreError> {
        self.dispatch_simultaneous(
            trip_id,
            DispatchStrategy::BroadcastBid,
            self.config.broadcast_fanout,
            self.config.broadcast_ttl_ms,
            &HashSet::new(),
        )
    }

    /// One candidate at a time, walking a precomputed ranked list.
    pub fn dispatch_sequential(&self, trip_id: TripId) -> Result<DispatchOutcome, StoreError> {
        let Some(trip) = self.open_trip(trip_id)? else {
            return Ok(DispatchOutcome::TripUnavailable);
        };
        let ranked = self.matching.find_ranked(
            &MatchRequest::from_trip(&trip),
            self.config.sequential_depth,
            &HashSet::new(),
        )?;
        if ranked.is_empty() {
            info!(trip_id = %trip_id, "sequential dispatch found no candidates");
            return Ok(DispatchOutcome::NoCandidates);
        }
        let state = SequentialState {
            ranked: ranked.iter().map(|s| s.driver_id).collect(),
            round: 0,
        };
        match self.run_sequential_round(&trip, state)? {
            SequentialAdvance::Advanced {
                driver,
                expires_at_ms,
                ..
            } => Ok(DispatchOutcome::Notified {
                strategy: DispatchStrategy::Sequential,
                drivers: vec![driver],
                expires_at_ms,
            }),
            _ => Ok(DispatchOutcome::NoCandidates),
        }
    }

    /// Ahead-of-time trips: defer matching until pickup minus the lead
    /// window. Nobody is notified now.
    pub fn dispatch_scheduled(
        &self,
        trip_id: TripId,
        pickup_at_ms: u64,
    ) -> Result<DispatchOutcome, StoreError> {
        if self.open_trip(trip_id)?.is_none() {
            return Ok(DispatchOutcome::TripUnavailable);
        }
        let now = self.clock.now_ms();
        let dispatch_at_ms = pickup_at_ms
            .saturating_sub(self.config.scheduled_lead_ms)
            .max(now);
        self.tasks
            .schedule(dispatch_at_ms, EngineTask::ScheduledDispatch { trip_id });
        info!(trip_id = %trip_id, dispatch_at_ms, "dispatch deferred to scheduled time");
        Ok(DispatchOutcome::Scheduled { dispatch_at_ms })
    }

    /// Re-rank excluding every previously-notified driver; used when a
    /// round expired with no acceptance.
    pub fn retry_dispatch(&self, trip_id: TripId) -> Result<DispatchOutcome, StoreError> {
        let exclude = self.notified_drivers(trip_id)?;
        self.dispatch_simultaneous(
            trip_id,
            DispatchStrategy::FirstAccept,
            self.config.first_accept_fanout,
            self.config.first_accept_ttl_ms,
            &exclude,
        )
    }

    /// Record a driver's bid on a pending broadcast offer; false when the
    /// offer has already been resolved.
    pub fn record_bid(&self, offer_id: OfferId, price: f64) -> Result<bool, StoreError> {
        let recorded = self.offers.set_bid(offer_id, price)?;
        if recorded {
            info!(offer_id = %offer_id, price, "bid recorded");
        } else {
            debug!(offer_id = %offer_id, "bid on a resolved offer ignored");
        }
        Ok(recorded)
    }

    /// The candidate a sequential dispatch currently has on offer.
    pub fn next_sequential_driver(&self, trip_id: TripId) -> Result<Option<DriverId>, StoreError> {
        Ok(self
            .sequential_state(trip_id)?
            .and_then(|state| state.ranked.get(state.round as usize).copied()))
    }

    /// Advances a sequential dispatch past its current candidate.
    /// `expected_round` guards timer-driven advances: a task that raced a
    /// newer round is stale and ignored.
    pub fn advance_sequential(
        &self,
        trip_id: TripId,
        expected_round: Option<u32>,
    ) -> Result<SequentialAdvance, StoreError> {
        let Some(mut state) = self.sequential_state(trip_id)? else {
            return Ok(SequentialAdvance::NotActive);
        };
        if expected_round.is_some_and(|round| round != state.round) {
            debug!(trip_id = %trip_id, ?expected_round, current = state.round, "stale sequential advance ignored");
            return Ok(SequentialAdvance::Stale);
        }
        if let Some(current) = state.ranked.get(state.round as usize).copied() {
            self.retire_candidate(trip_id, current)?;
        }
        let Some(trip) = self.open_trip(trip_id)? else {
            self.store.kv_delete(&keys::sequential_round(trip_id))?;
            return Ok(SequentialAdvance::NotActive);
        };
        state.round += 1;
        self.run_sequential_round(&trip, state)
    }

    /// A driver's decline arrived: advance only if they are the current
    /// sequential candidate.
    pub fn advance_after_decline(
        &self,
        trip_id: TripId,
        driver: DriverId,
    ) -> Result<SequentialAdvance, StoreError> {
        let Some(state) = self.sequential_state(trip_id)? else {
            return Ok(SequentialAdvance::NotActive);
        };
        if state.ranked.get(state.round as usize) != Some(&driver) {
            return Ok(SequentialAdvance::Stale);
        }
        self.advance_sequential(trip_id, Some(state.round))
    }

    /// Driver IDs already notified for this trip, as recorded for retry
    /// exclusion.
    pub fn notified_drivers(&self, trip_id: TripId) -> Result<HashSet<DriverId>, StoreError> {
        let members = self.store.set_members(&keys::notified(trip_id))?;
        Ok(members
            .iter()
            .filter_map(|raw| match Uuid::parse_str(raw) {
                Ok(id) => Some(DriverId::from(id)),
                Err(_) => {
                    warn!(member = %raw, "skipping unparseable notified-set member");
                    None
                }
            })
            .collect())
    }

    fn dispatch_simultaneous(
        &self,
        trip_id: TripId,
        strategy: DispatchStrategy,
        fanout: usize,
        ttl_ms: u64,
        exclude: &HashSet<DriverId>,
    ) -> Result<DispatchOutcome, StoreError> {
        let Some(trip) = self.open_trip(trip_id)? else {
            return Ok(DispatchOutcome::TripUnavailable);
        };
        let ranked = self
            .matching
            .find_ranked(&MatchRequest::from_trip(&trip), fanout, exclude)?;
        if ranked.is_empty() {
            info!(trip_id = %trip_id, ?strategy, "dispatch found no candidates");
            return Ok(DispatchOutcome::NoCandidates);
        }
        let candidates: Vec<DriverId> = ranked.iter().map(|s| s.driver_id).collect();
        let (drivers, expires_at_ms) = self.notify_round(&trip, &candidates, ttl_ms)?;
        if drivers.is_empty() {
            return Ok(DispatchOutcome::NoCandidates);
        }
        self.tasks
            .schedule(expires_at_ms, EngineTask::DispatchTimeout { trip_id });
        info!(
            trip_id = %trip_id,
            ?strategy,
            notified = drivers.len(),
            expires_at_ms,
            "dispatch round notified"
        );
        Ok(DispatchOutcome::Notified {
            strategy,
            drivers,
            expires_at_ms,
        })
    }

    /// Moves each candidate into `Offered`, records the mutual pending
    /// sets in one atomic call, creates the offer rows, and pushes to the
    /// drivers' clients. Candidates whose state left the available pool
    /// between ranking and now are skipped.
    fn notify_round(
        &self,
        trip: &TripRecord,
        candidates: &[DriverId],
        ttl_ms: u64,
    ) -> Result<(Vec<DriverId>, u64), StoreError> {
        let expires_at_ms = self.clock.now_ms() + ttl_ms;
        let mut drivers = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self
                .state
                .transition(*candidate, DriverState::Offered, Some(trip.id))?
            {
                TransitionOutcome::Applied => drivers.push(*candidate),
                outcome => {
                    debug!(
                        driver_id = %candidate,
                        ?outcome,
                        "candidate left the available pool before notification"
                    );
                }
            }
        }
        if drivers.is_empty() {
            return Ok((drivers, expires_at_ms));
        }
        self.store.offers_add(trip.id, &drivers, ttl_ms)?;
        let members: Vec<String> = drivers.iter().map(ToString::to_string).collect();
        self.store.set_add(
            &keys::notified(trip.id),
            &members,
            Some(self.config.notified_retention_ms),
        )?;
        for driver in &drivers {
            let offer = TripOffer {
                id: OfferId::new(),
                trip_id: trip.id,
                driver_id: *driver,
                offer_price: None,
                status: OfferStatus::Pending,
            };
            let offer_id = offer.id;
            self.offers.insert(offer)?;
            let reachable = self.registry.notify(
                *driver,
                &PushEvent::NewTripOffer {
                    trip_id: trip.id,
                    offer_id,
                    pickup: trip.pickup,
                    dest: trip.dest,
                    vehicle: trip.vehicle,
                    price: trip.price,
                    expires_at_ms,
                },
            );
            if !reachable {
                debug!(driver_id = %driver, "offer push undelivered, offer stays pending");
            }
        }
        Ok((drivers, expires_at_ms))
    }

    /// Notifies the current candidate of `state`, skipping past candidates
    /// that are no longer available, and persists the round.
    fn run_sequential_round(
        &self,
        trip: &TripRecord,
        mut state: SequentialState,
    ) -> Result<SequentialAdvance, StoreError> {
        while let Some(driver) = state.ranked.get(state.round as usize).copied() {
            let (notified, expires_at_ms) =
                self.notify_round(trip, &[driver], self.config.sequential_round_ttl_ms)?;
            if notified.is_empty() {
                state.round += 1;
                continue;
            }
            self.store.kv_put(
                &keys::sequential_round(trip.id),
                &serde_json::to_string(&state)?,
                Some(self.config.notified_retention_ms),
            )?;
            self.tasks.schedule(
                expires_at_ms,
                EngineTask::SequentialAdvance {
                    trip_id: trip.id,
                    round: state.round,
                },
            );
            info!(
                trip_id = %trip.id,
                driver_id = %driver,
                round = state.round,
                "sequential round notified"
            );
            return Ok(SequentialAdvance::Advanced {
                driver,
                round: state.round,
                expires_at_ms,
            });
        }
        self.store.kv_delete(&keys::sequential_round(trip.id))?;
        info!(trip_id = %trip.id, "sequential dispatch exhausted its ranked list");
        Ok(SequentialAdvance::Exhausted)
    }

    /// Clears the retiring candidate's pending bookkeeping, rejects their
    /// offer row, and returns them to the available pool.
    fn retire_candidate(&self, trip_id: TripId, driver: DriverId) -> Result<(), StoreError> {
        self.store.offers_remove(trip_id, driver)?;
        for offer in self.offers.pending_for_trip(trip_id)? {
            if offer.driver_id == driver {
                self.offers.mark_rejected(offer.id)?;
            }
        }
        if self.store.offers_for_driver(driver)?.is_empty()
            && self.state.current(driver)? == DriverState::Offered
        {
            self.state
                .transition(driver, DriverState::Available, Some(trip_id))?;
        }
        Ok(())
    }

    fn open_trip(&self, trip_id: TripId) -> Result<Option<TripRecord>, StoreError> {
        Ok(self
            .trips
            .get(trip_id)?
            .filter(|trip| trip.status == TripStatus::Requested && trip.driver_id.is_none()))
    }

    fn sequential_state(&self, trip_id: TripId) -> Result<Option<SequentialState>, StoreError> {
        match self.store.kv_get(&keys::sequential_round(trip_id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
