//! Candidate retrieval and multi-factor ranking.
//!
//! Candidates come from the location cache's radius query; when the cache
//! is cold or unreachable the durable store's spatial index answers
//! instead, identical in shape and only slower. Survivors of the
//! eligibility filter get a weighted score in [0, 1] with the per-factor
//! breakdown retained on the result, and the ranked list is truncated to
//! the caller's limit.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ScoreWeights, DEFAULT_MIN_RATING};
use crate::error::StoreError;
use crate::filter::{DriverFilter, FilterPass, FilterStage, OfferContext};
use crate::geo::GeoPoint;
use crate::ids::{CustomerId, DriverId};
use crate::location::LocationCache;
use crate::repo::{DriverRepository, TripRecord, VehicleClass};

/// Fleet-wide stand-in until per-driver acceptance history is aggregated.
pub const PLACEHOLDER_ACCEPTANCE_RATE: f64 = 0.8;
/// Fleet-wide stand-in until per-driver completion history is aggregated.
pub const PLACEHOLDER_COMPLETION_RATE: f64 = 0.9;

/// Source of the behavioral scoring factors.
pub trait DriverStats: Send + Sync {
    fn acceptance_rate(&self, driver: DriverId) -> Result<f64, StoreError>;
    fn completion_rate(&self, driver: DriverId) -> Result<f64, StoreError>;
}

/// Returns the fixed placeholder rates for every driver. These are not
/// computed from trip history; swapping in a real aggregation only means
/// replacing this implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderStats;

impl DriverStats for PlaceholderStats {
    fn acceptance_rate(&self, _driver: DriverId) -> Result<f64, StoreError> {
        Ok(PLACEHOLDER_ACCEPTANCE_RATE)
    }

    fn completion_rate(&self, _driver: DriverId) -> Result<f64, StoreError> {
        Ok(PLACEHOLDER_COMPLETION_RATE)
    }
}

/// The trip-side inputs of one matching call.
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub customer: CustomerId,
    pub pickup: GeoPoint,
    pub dest: GeoPoint,
    pub vehicle: VehicleClass,
    pub min_rating: f64,
}

impl MatchRequest {
    pub fn from_trip(trip: &TripRecord) -> Self {
        Self {
            customer: trip.customer_id,
            pickup: trip.pickup,
            dest: trip.dest,
            vehicle: trip.vehicle,
            min_rating: DEFAULT_MIN_RATING,
        }
    }

    pub fn with_min_rating(mut self, min_rating: f64) -> Self {
        self.min_rating = min_rating;
        self
    }
}

/// Raw per-factor scores, each in [0, 1], before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub distance: f64,
    pub rating: f64,
    pub acceptance_rate: f64,
    pub completion_rate: f64,
    pub vehicle_match: f64,
    pub repeat_customer: f64,
}

impl ScoreBreakdown {
    pub fn weighted_total(&self, weights: &ScoreWeights) -> f64 {
        self.distance * weights.distance
            + self.rating * weights.rating
            + self.acceptance_rate * weights.acceptance_rate
            + self.completion_rate * weights.completion_rate
            + self.vehicle_match * weights.vehicle_match
            + self.repeat_customer * weights.repeat_customer
    }
}

/// One ranked candidate. Ephemeral: recomputed on every matching call,
/// never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredDriver {
    pub driver_id: DriverId,
    pub score: f64,
    pub distance_m: f64,
    pub rating: f64,
    pub vehicle: VehicleClass,
    pub breakdown: ScoreBreakdown,
}

struct Candidate {
    driver: DriverId,
    distance_m: f64,
}

pub struct MatchingService {
    cache: Arc<LocationCache>,
    drivers: Arc<dyn DriverRepository>,
    filter: Arc<DriverFilter>,
    stats: Arc<dyn DriverStats>,
    config: EngineConfig,
}

impl MatchingService {
    pub fn new(
        cache: Arc<LocationCache>,
        drivers: Arc<dyn DriverRepository>,
        filter: Arc<DriverFilter>,
        stats: Arc<dyn DriverStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            drivers,
            filter,
            stats,
            config,
        }
    }

    /// Ranked eligible candidates, best first, at most `limit`.
    pub fn find_optimal_drivers(
        &self,
        request: &MatchRequest,
        limit: usize,
    ) -> Result<Vec<ScoredDriver>, StoreError> {
        self.find_ranked(request, limit, &HashSet::new())
    }

    /// Ranking with an explicit exclusion set, for retry rounds that must
    /// skip already-notified drivers.
    pub fn find_ranked(
        &self,
        request: &MatchRequest,
        limit: usize,
        exclude: &HashSet<DriverId>,
    ) -> Result<Vec<ScoredDriver>, StoreError> {
        let radius_m = self.config.max_radius_km * 1_000.0;
        let candidates = self.candidates(request.pickup, radius_m)?;
        let ctx = OfferContext {
            customer: request.customer,
            vehicle: request.vehicle,
            min_rating: request.min_rating,
            pickup: request.pickup,
            dest: request.dest,
            stage: FilterStage::Ranking,
        };

        let mut pass = FilterPass::new(self.config.candidate_cap);
        let mut scored = Vec::new();
        for candidate in candidates {
            if exclude.contains(&candidate.driver) {
                continue;
            }
            if !self.filter.is_eligible_in(&mut pass, candidate.driver, &ctx)? {
                continue;
            }
            // Eligibility just passed, so the record exists; a concurrent
            // delete reads as the candidate dropping out.
            let Some(record) = pass.record(self.drivers.as_ref(), candidate.driver)? else {
                continue;
            };
            let breakdown = ScoreBreakdown {
                distance: (1.0 - candidate.distance_m / radius_m).max(0.0),
                rating: ((record.rating - 1.0) / 4.0).clamp(0.0, 1.0),
                acceptance_rate: self.stats.acceptance_rate(candidate.driver)?.clamp(0.0, 1.0),
                completion_rate: self.stats.completion_rate(candidate.driver)?.clamp(0.0, 1.0),
                vehicle_match: if record.vehicle == request.vehicle {
                    1.0
                } else {
                    0.5
                },
                repeat_customer: if self
                    .drivers
                    .has_completed_trip_for(candidate.driver, request.customer)?
                {
                    1.0
                } else {
                    0.0
                },
            };
            scored.push(ScoredDriver {
                driver_id: candidate.driver,
                score: breakdown.weighted_total(&self.config.score_weights),
                distance_m: candidate.distance_m,
                rating: record.rating,
                vehicle: record.vehicle,
                breakdown,
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.distance_m
                        .partial_cmp(&b.distance_m)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Cache radius query with durable-store spatial fallback. The fallback
    /// fires on an empty cache and on cache unavailability; the caller sees
    /// the same shape either way.
    fn candidates(&self, pickup: GeoPoint, radius_m: f64) -> Result<Vec<Candidate>, StoreError> {
        match self
            .cache
            .get_nearby(pickup, radius_m, self.config.candidate_cap)
        {
            Ok(hits) if !hits.is_empty() => {
                return Ok(hits
                    .into_iter()
                    .map(|hit| Candidate {
                        driver: hit.driver_id,
                        distance_m: hit.distance_m.unwrap_or(f64::MAX),
                    })
                    .collect());
            }
            Ok(_) => debug!("location cache empty, falling back to durable spatial index"),
            Err(err) => {
                warn!(error = %err, "location cache unavailable, falling back to durable spatial index");
            }
        }
        let rows = self
            .drivers
            .find_nearby(pickup, radius_m, self.config.candidate_cap)?;
        Ok(rows
            .into_iter()
            .map(|(record, distance_m)| Candidate {
                driver: record.id,
                distance_m,
            })
            .collect())
    }
}
