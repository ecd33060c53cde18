//! Engine configuration.
//!
//! Every tunable the engine reads lives here as a named field with a named
//! default, pending a product decision on per-city configurability. Nothing
//! in the engine reaches for a scattered literal.

use crate::clock::{ONE_HOUR_MS, ONE_MIN_MS, ONE_SEC_MS};

/// Maximum candidate search radius around a pickup point.
const DEFAULT_MAX_RADIUS_KM: f64 = 10.0;
/// Cap on raw candidates pulled from a radius query before filtering.
const DEFAULT_CANDIDATE_CAP: usize = 50;
/// A position older than this is invisible to matching.
const DEFAULT_LOCATION_FRESHNESS_MS: u64 = 30 * ONE_SEC_MS;
/// Location metadata is less safety-critical than position and lives longer.
const DEFAULT_METADATA_TTL_MS: u64 = 5 * ONE_MIN_MS;
/// Presence marker TTL; a client that stops heartbeating goes dark after this.
const DEFAULT_PRESENCE_TTL_MS: u64 = 30 * ONE_SEC_MS;
/// Driver state record TTL in the fast store.
const DEFAULT_STATE_TTL_MS: u64 = 24 * ONE_HOUR_MS;
/// State transition audit retention.
const DEFAULT_AUDIT_TTL_MS: u64 = 7 * 24 * ONE_HOUR_MS;
/// Audit ring capacity per driver.
const DEFAULT_AUDIT_CAPACITY: usize = 100;
/// Route points retained per active trip.
const DEFAULT_ROUTE_CAPACITY: usize = 1_000;

const DEFAULT_FIRST_ACCEPT_FANOUT: usize = 5;
const DEFAULT_FIRST_ACCEPT_TTL_MS: u64 = 15 * ONE_SEC_MS;
const DEFAULT_BROADCAST_FANOUT: usize = 10;
const DEFAULT_BROADCAST_TTL_MS: u64 = 30 * ONE_SEC_MS;
/// Length of the precomputed ranked list a sequential dispatch walks.
const DEFAULT_SEQUENTIAL_DEPTH: usize = 5;
/// Per-round response window for sequential dispatch.
const DEFAULT_SEQUENTIAL_ROUND_TTL_MS: u64 = 15 * ONE_SEC_MS;
/// How far ahead of pickup a scheduled trip starts dispatching.
const DEFAULT_SCHEDULED_LEAD_MS: u64 = 15 * ONE_MIN_MS;

/// How long a trip's already-notified set is remembered for retry exclusion.
const DEFAULT_NOTIFIED_RETENTION_MS: u64 = 30 * ONE_MIN_MS;

const DEFAULT_LOCK_TTL_MS: u64 = 5 * ONE_SEC_MS;
const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_LOCK_RETRY_BASE_MS: u64 = 40;
const DEFAULT_LOCK_RETRY_JITTER_MS: u64 = 40;

/// Post-trip rest period applied on normal completion.
const DEFAULT_COOLDOWN_MS: u64 = 2 * ONE_MIN_MS;
/// Corridor rule: maximum extra distance a trip may add on the way to a
/// preferred destination.
const DEFAULT_MAX_DEVIATION_KM: f64 = 2.0;

/// Lowest value on the 1–5 rating scale; a request with this minimum
/// accepts every rated driver.
pub const DEFAULT_MIN_RATING: f64 = 1.0;

/// Relative weights of the matching score factors. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub distance: f64,
    pub rating: f64,
    pub acceptance_rate: f64,
    pub completion_rate: f64,
    pub vehicle_match: f64,
    pub repeat_customer: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            distance: 0.40,
            rating: 0.20,
            acceptance_rate: 0.15,
            completion_rate: 0.10,
            vehicle_match: 0.10,
            repeat_customer: 0.05,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.distance
            + self.rating
            + self.acceptance_rate
            + self.completion_rate
            + self.vehicle_match
            + self.repeat_customer
    }
}

/// All engine tunables in one place.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_radius_km: f64,
    pub candidate_cap: usize,
    pub location_freshness_ms: u64,
    pub metadata_ttl_ms: u64,
    pub presence_ttl_ms: u64,
    pub state_ttl_ms: u64,
    pub audit_ttl_ms: u64,
    pub audit_capacity: usize,
    pub route_capacity: usize,
    pub score_weights: ScoreWeights,
    pub first_accept_fanout: usize,
    pub first_accept_ttl_ms: u64,
    pub broadcast_fanout: usize,
    pub broadcast_ttl_ms: u64,
    pub sequential_depth: usize,
    pub sequential_round_ttl_ms: u64,
    pub scheduled_lead_ms: u64,
    pub notified_retention_ms: u64,
    pub lock_ttl_ms: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_base_ms: u64,
    pub lock_retry_jitter_ms: u64,
    pub cooldown_ms: u64,
    pub max_deviation_km: f64,
    /// Seed for retry jitter; fixed for reproducible tests.
    pub jitter_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_radius_km: DEFAULT_MAX_RADIUS_KM,
            candidate_cap: DEFAULT_CANDIDATE_CAP,
            location_freshness_ms: DEFAULT_LOCATION_FRESHNESS_MS,
            metadata_ttl_ms: DEFAULT_METADATA_TTL_MS,
            presence_ttl_ms: DEFAULT_PRESENCE_TTL_MS,
            state_ttl_ms: DEFAULT_STATE_TTL_MS,
            audit_ttl_ms: DEFAULT_AUDIT_TTL_MS,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            route_capacity: DEFAULT_ROUTE_CAPACITY,
            score_weights: ScoreWeights::default(),
            first_accept_fanout: DEFAULT_FIRST_ACCEPT_FANOUT,
            first_accept_ttl_ms: DEFAULT_FIRST_ACCEPT_TTL_MS,
            broadcast_fanout: DEFAULT_BROADCAST_FANOUT,
            broadcast_ttl_ms: DEFAULT_BROADCAST_TTL_MS,
            sequential_depth: DEFAULT_SEQUENTIAL_DEPTH,
            sequential_round_ttl_ms: DEFAULT_SEQUENTIAL_ROUND_TTL_MS,
            scheduled_lead_ms: DEFAULT_SCHEDULED_LEAD_MS,
            notified_retention_ms: DEFAULT_NOTIFIED_RETENTION_MS,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            lock_retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            lock_retry_base_ms: DEFAULT_LOCK_RETRY_BASE_MS,
            lock_retry_jitter_ms: DEFAULT_LOCK_RETRY_JITTER_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            max_deviation_km: DEFAULT_MAX_DEVIATION_KM,
            jitter_seed: 0,
        }
    }
}

impl EngineConfig {
    pub fn with_max_radius_km(mut self, km: f64) -> Self {
        self.max_radius_km = km;
        self
    }

    pub fn with_location_freshness_ms(mut self, ms: u64) -> Self {
        self.location_freshness_ms = ms;
        self
    }

    pub fn with_presence_ttl_ms(mut self, ms: u64) -> Self {
        self.presence_ttl_ms = ms;
        self
    }

    pub fn with_first_accept_fanout(mut self, fanout: usize) -> Self {
        self.first_accept_fanout = fanout;
        self
    }

    pub fn with_sequential_depth(mut self, depth: usize) -> Self {
        self.sequential_depth = depth;
        self
    }

    pub fn with_lock_retry_attempts(mut self, attempts: u32) -> Self {
        self.lock_retry_attempts = attempts;
        self
    }

    pub fn with_cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = ms;
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = seed;
        self
    }
}
