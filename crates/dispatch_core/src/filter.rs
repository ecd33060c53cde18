//! Driver eligibility.
//!
//! A driver qualifies for a trip only when every sub-check holds: presence,
//! approval, location freshness, vehicle class, rating, no active trip, no
//! cooldown, a lifecycle state that admits offers, not blocked by the
//! customer, not fraud-flagged, and a destination-preference corridor
//! match. The first failed check short-circuits; a missing driver record is
//! ineligible, not an error.
//!
//! Advisory fast-store signals (presence, cooldown, fraud flag) fail open
//! when the store is unreachable, so a transient cache outage does not
//! blank out legitimate drivers. Everything on the commit path fails
//! closed.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use tracing::warn;

use crate::clock::Clock;
use crate::config::{EngineConfig, DEFAULT_MIN_RATING};
use crate::driver_state::{DriverState, DriverStateMachine};
use crate::error::StoreError;
use crate::geo::{self, GeoPoint};
use crate::ids::{CustomerId, DriverId};
use crate::repo::{DriverRecord, DriverRepository, DriverStatus, TripRecord, VehicleClass};
use crate::store::{keys, FastStore};

/// A driver may list at most this many preferred destinations.
const MAX_DESTINATION_PREFERENCES: usize = 3;

/// Whether the consultation ranks candidates or gates the commit. A driver
/// already holding this trip's offer sits in `Offered`, which only the
/// commit stage accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Ranking,
    Commit,
}

/// The trip-side inputs of an eligibility decision.
#[derive(Debug, Clone)]
pub struct OfferContext {
    pub customer: CustomerId,
    pub vehicle: VehicleClass,
    pub min_rating: f64,
    pub pickup: GeoPoint,
    pub dest: GeoPoint,
    pub stage: FilterStage,
}

impl OfferContext {
    pub fn ranking(trip: &TripRecord, min_rating: f64) -> Self {
        Self {
            customer: trip.customer_id,
            vehicle: trip.vehicle,
            min_rating,
            pickup: trip.pickup,
            dest: trip.dest,
            stage: FilterStage::Ranking,
        }
    }

    pub fn commit(trip: &TripRecord) -> Self {
        Self {
            customer: trip.customer_id,
            vehicle: trip.vehicle,
            min_rating: DEFAULT_MIN_RATING,
            pickup: trip.pickup,
            dest: trip.dest,
            stage: FilterStage::Commit,
        }
    }
}

/// Per-pass lookup state: driver records behind an LRU, the customer's
/// blocklist fetched once. A pass lives for one matching call (or one
/// commit re-check) so it can never serve stale data across requests.
pub struct FilterPass {
    records: LruCache<DriverId, Option<DriverRecord>>,
    blocked: Option<HashSet<DriverId>>,
}

impl FilterPass {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(capacity),
            blocked: None,
        }
    }

    pub(crate) fn record(
        &mut self,
        repo: &dyn DriverRepository,
        driver: DriverId,
    ) -> Result<Option<DriverRecord>, StoreError> {
        if let Some(cached) = self.records.get(&driver) {
            return Ok(cached.clone());
        }
        let record = repo.get(driver)?;
        self.records.put(driver, record.clone());
        Ok(record)
    }

    fn is_blocked(
        &mut self,
        repo: &dyn DriverRepository,
        customer: CustomerId,
        driver: DriverId,
    ) -> Result<bool, StoreError> {
        if self.blocked.is_none() {
            self.blocked = Some(repo.blocked_drivers(customer)?);
        }
        Ok(self.blocked.as_ref().is_some_and(|set| set.contains(&driver)))
    }
}

/// Every sub-check, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityCheck {
    Presence,
    Approval,
    LocationFreshness,
    VehicleClass,
    MinimumRating,
    ActiveTrip,
    Cooldown,
    LifecycleState,
    Blocklist,
    FraudFlag,
    DestinationPreference,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub check: EligibilityCheck,
    pub passed: bool,
}

/// Diagnostic view with every sub-check evaluated, short-circuiting off.
#[derive(Debug, Clone, Serialize)]
pub struct EligibilityReport {
    pub driver_id: DriverId,
    pub eligible: bool,
    pub checks: Vec<CheckResult>,
}

pub struct DriverFilter {
    store: Arc<dyn FastStore>,
    drivers: Arc<dyn DriverRepository>,
    state: Arc<DriverStateMachine>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl DriverFilter {
    pub fn new(
        store: Arc<dyn FastStore>,
        drivers: Arc<dyn DriverRepository>,
        state: Arc<DriverStateMachine>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            drivers,
            state,
            clock,
            config,
        }
    }

    /// Single-driver convenience over [`DriverFilter::is_eligible_in`].
    pub fn is_eligible(&self, driver: DriverId, ctx: &OfferContext) -> Result<bool, StoreError> {
        let mut pass = FilterPass::new(1);
        self.is_eligible_in(&mut pass, driver, ctx)
    }

    /// Batch form sharing one [`FilterPass`] across all candidates.
    pub fn filter_eligible(
        &self,
        candidates: &[DriverId],
        ctx: &OfferContext,
    ) -> Result<Vec<DriverId>, StoreError> {
        let mut pass = FilterPass::new(candidates.len());
        let mut eligible = Vec::new();
        for driver in candidates {
            if self.is_eligible_in(&mut pass, *driver, ctx)? {
                eligible.push(*driver);
            }
        }
        Ok(eligible)
    }

    pub fn is_eligible_in(
        &self,
        pass: &mut FilterPass,
        driver: DriverId,
        ctx: &OfferContext,
    ) -> Result<bool, StoreError> {
        if !self.is_present(driver) {
            return Ok(false);
        }
        let Some(record) = pass.record(self.drivers.as_ref(), driver)? else {
            return Ok(false);
        };
        if record.status != DriverStatus::Approved {
            return Ok(false);
        }
        if !self.location_fresh(driver, &record)? {
            return Ok(false);
        }
        if !record.vehicle.serves(ctx.vehicle) {
            return Ok(false);
        }
        if record.rating < ctx.min_rating {
            return Ok(false);
        }
        if self.has_active_trip(driver)? {
            return Ok(false);
        }
        if self.in_cooldown(driver) {
            return Ok(false);
        }
        if !self.state_admits_offers(driver, ctx.stage)? {
            return Ok(false);
        }
        if pass.is_blocked(self.drivers.as_ref(), ctx.customer, driver)? {
            return Ok(false);
        }
        if self.fraud_flagged(driver) {
            return Ok(false);
        }
        self.matches_destination(&record, ctx)
    }

    /// Evaluates every sub-check without short-circuiting. Diagnostic only;
    /// production matching goes through [`DriverFilter::is_eligible_in`].
    pub fn eligibility_report(
        &self,
        driver: DriverId,
        ctx: &OfferContext,
    ) -> Result<EligibilityReport, StoreError> {
        let mut pass = FilterPass::new(1);
        let record = pass.record(self.drivers.as_ref(), driver)?;
        let mut checks = Vec::new();
        let mut push = |check, passed| checks.push(CheckResult { check, passed });

        push(EligibilityCheck::Presence, self.is_present(driver));
        push(
            EligibilityCheck::Approval,
            record
                .as_ref()
                .is_some_and(|r| r.status == DriverStatus::Approved),
        );
        push(
            EligibilityCheck::LocationFreshness,
            match &record {
                Some(record) => self.location_fresh(driver, record)?,
                None => false,
            },
        );
        push(
            EligibilityCheck::VehicleClass,
            record.as_ref().is_some_and(|r| r.vehicle.serves(ctx.vehicle)),
        );
        push(
            EligibilityCheck::MinimumRating,
            record.as_ref().is_some_and(|r| r.rating >= ctx.min_rating),
        );
        push(EligibilityCheck::ActiveTrip, !self.has_active_trip(driver)?);
        push(EligibilityCheck::Cooldown, !self.in_cooldown(driver));
        push(
            EligibilityCheck::LifecycleState,
            self.state_admits_offers(driver, ctx.stage)?,
        );
        push(
            EligibilityCheck::Blocklist,
            !pass.is_blocked(self.drivers.as_ref(), ctx.customer, driver)?,
        );
        push(EligibilityCheck::FraudFlag, !self.fraud_flagged(driver));
        push(
            EligibilityCheck::DestinationPreference,
            match &record {
                Some(record) => self.matches_destination(record, ctx)?,
                None => false,
            },
        );

        let eligible = checks.iter().all(|c| c.passed);
        Ok(EligibilityReport {
            driver_id: driver,
            eligible,
            checks,
        })
    }

    // Advisory reads fail open: a store error reads as "no obstacle".

    fn is_present(&self, driver: DriverId) -> bool {
        match self.store.kv_get(&keys::presence(driver)) {
            Ok(marker) => marker.is_some(),
            Err(err) => {
                warn!(driver_id = %driver, error = %err, "presence read failed, failing open");
                true
            }
        }
    }

    fn in_cooldown(&self, driver: DriverId) -> bool {
        match self.store.kv_get(&keys::cooldown(driver)) {
            Ok(marker) => marker.is_some(),
            Err(err) => {
                warn!(driver_id = %driver, error = %err, "cooldown read failed, failing open");
                false
            }
        }
    }

    fn fraud_flagged(&self, driver: DriverId) -> bool {
        match self.store.kv_get(&keys::fraud_flag(driver)) {
            Ok(flag) => flag.is_some(),
            Err(err) => {
                warn!(driver_id = %driver, error = %err, "fraud flag read failed, failing open");
                false
            }
        }
    }

    /// Fresh when the fast-store touch is inside the window; the durable
    /// record's last update is the fallback when the cache has no entry.
    fn location_fresh(&self, driver: DriverId, record: &DriverRecord) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let window = self.config.location_freshness_ms;
        match self.store.kv_get(&keys::location_touch(driver)) {
            Ok(Some(raw)) => {
                return Ok(raw
                    .parse::<u64>()
                    .is_ok_and(|at| now.saturating_sub(at) <= window));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(driver_id = %driver, error = %err, "location touch read failed, using durable record");
            }
        }
        Ok(record
            .last_location_update_ms
            .is_some_and(|at| now.saturating_sub(at) <= window))
    }

    fn has_active_trip(&self, driver: DriverId) -> Result<bool, StoreError> {
        Ok(self.store.kv_get(&keys::active_trip(driver))?.is_some())
    }

    fn state_admits_offers(
        &self,
        driver: DriverId,
        stage: FilterStage,
    ) -> Result<bool, StoreError> {
        let state = self.state.current(driver)?;
        Ok(match stage {
            FilterStage::Ranking => state == DriverState::Available,
            FilterStage::Commit => {
                matches!(state, DriverState::Available | DriverState::Offered)
            }
        })
    }

    /// Corridor rule: disabled mode or an empty list matches everything;
    /// otherwise any one preferred destination within its radius of the
    /// trip's destination, or reachable with bounded extra distance via the
    /// trip's destination, is enough.
    fn matches_destination(
        &self,
        record: &DriverRecord,
        ctx: &OfferContext,
    ) -> Result<bool, StoreError> {
        if !record.dest_preference_enabled {
            return Ok(true);
        }
        let prefs = self.drivers.destination_preferences(record.id)?;
        if prefs.is_empty() {
            return Ok(true);
        }
        let max_extra_m = self.config.max_deviation_km * 1_000.0;
        let pickup_to_dest = geo::haversine_m(ctx.pickup, ctx.dest);
        for pref in prefs.iter().take(MAX_DESTINATION_PREFERENCES) {
            if geo::haversine_m(ctx.dest, pref.point) <= pref.radius_km * 1_000.0 {
                return Ok(true);
            }
            let via_dest = pickup_to_dest + geo::haversine_m(ctx.dest, pref.point);
            let direct = geo::haversine_m(ctx.pickup, pref.point);
            if via_dest - direct <= max_extra_m {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
