//! Distributed mutual exclusion for the assignment window.
//!
//! Locks are advisory fast-path guards: they keep most races away from the
//! database, while the conditional trip update remains the definitive
//! arbiter. Every lock carries a TTL so a crashed holder is reclaimed, and
//! the combined trip+driver acquisition is ordered (trip first, driver
//! second, trip given back if the driver is contended) so two overlapping
//! assignment attempts cannot deadlock.
//!
//! Release failures are logged, never escalated; the TTL is the real
//! safety net.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::ids::{DriverId, TripId};
use crate::store::{keys, FastStore};

/// A held lock. Dropping it releases; releasing twice is a no-op.
pub struct LockHandle {
    store: Arc<dyn FastStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockHandle {
    /// Extends the TTL for a long critical section; false when the lock is
    /// no longer held by this token.
    pub fn extend(&self, ttl_ms: u64) -> Result<bool, StoreError> {
        self.store.lock_extend(&self.key, &self.token, ttl_ms)
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.store.lock_release(&self.key, &self.token) {
            Ok(true) => {}
            Ok(false) => debug!(key = %self.key, "lock already lapsed at release"),
            Err(err) => {
                warn!(key = %self.key, error = %err, "lock release failed, ttl will reclaim it");
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// The trip and driver locks held together through an assignment attempt.
pub struct PairLock {
    trip: LockHandle,
    driver: LockHandle,
}

impl PairLock {
    /// Extends both TTLs; false when either side is no longer held.
    pub fn extend(&self, ttl_ms: u64) -> Result<bool, StoreError> {
        Ok(self.trip.extend(ttl_ms)? && self.driver.extend(ttl_ms)?)
    }

    pub fn release(self) {
        let PairLock { trip, driver } = self;
        driver.release();
        trip.release();
    }
}

pub struct TripLock {
    store: Arc<dyn FastStore>,
    config: EngineConfig,
    jitter: Mutex<StdRng>,
}

impl TripLock {
    pub fn new(store: Arc<dyn FastStore>, config: EngineConfig) -> Self {
        let jitter = Mutex::new(StdRng::seed_from_u64(config.jitter_seed));
        Self {
            store,
            config,
            jitter,
        }
    }

    pub fn lock_trip(&self, trip: TripId) -> Result<Option<LockHandle>, StoreError> {
        self.acquire(keys::trip_lock(trip))
    }

    pub fn lock_driver(&self, driver: DriverId) -> Result<Option<LockHandle>, StoreError> {
        self.acquire(keys::driver_lock(driver))
    }

    /// Ordered combined acquisition: trip first, then driver, releasing the
    /// trip lock when the driver lock cannot be had.
    pub fn lock_trip_and_driver(
        &self,
        trip: TripId,
        driver: DriverId,
    ) -> Result<Option<PairLock>, StoreError> {
        let Some(trip_lock) = self.lock_trip(trip)? else {
            return Ok(None);
        };
        match self.lock_driver(driver)? {
            Some(driver_lock) => Ok(Some(PairLock {
                trip: trip_lock,
                driver: driver_lock,
            })),
            None => {
                trip_lock.release();
                Ok(None)
            }
        }
    }

    /// Bounded retry with jitter; `None` once the budget is exhausted, for
    /// the caller to surface as "being processed".
    fn acquire(&self, key: String) -> Result<Option<LockHandle>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let attempts = self.config.lock_retry_attempts;
        for attempt in 0..=attempts {
            if self
                .store
                .lock_acquire(&key, &token, self.config.lock_ttl_ms)?
            {
                return Ok(Some(LockHandle {
                    store: self.store.clone(),
                    key,
                    token,
                    released: false,
                }));
            }
            if attempt == attempts {
                break;
            }
            thread::sleep(Duration::from_millis(
                self.config.lock_retry_base_ms + self.jitter_ms(),
            ));
        }
        debug!(key = %key, "lock retry budget exhausted");
        Ok(None)
    }

    fn jitter_ms(&self) -> u64 {
        match self.jitter.lock() {
            Ok(mut rng) => rng.gen_range(0..=self.config.lock_retry_jitter_ms),
            Err(_) => 0,
        }
    }
}
