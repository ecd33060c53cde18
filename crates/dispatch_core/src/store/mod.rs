//! Fast-store seam.
//!
//! The engine keeps its hot state (positions, presence, driver state,
//! pending offers, locks) in a shared low-latency store. [`FastStore`] is
//! the contract for that store; [`MemoryStore`] is the in-process
//! implementation that backs tests and single-node deployments.
//!
//! Compound mutations (mutual pending-offer sets, compare-and-swap) are
//! single trait methods so an implementation can execute each as one
//! pipelined batch or multi-key transaction. Callers never sequence reads
//! then writes around these invariants themselves.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::geo::GeoPoint;
use crate::ids::{DriverId, TripId};

/// One member returned from a radius query, distance-sorted ascending.
#[derive(Debug, Clone)]
pub struct GeoEntry {
    pub member: DriverId,
    pub point: GeoPoint,
    pub distance_m: f64,
}

/// Shared low-latency store: TTL'd key-value, bounded lists, a geospatial
/// index, mutual pending-offer sets, plain sets, and a lock primitive.
pub trait FastStore: Send + Sync {
    // Key-value with per-key TTL.
    fn kv_put(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError>;
    fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn kv_delete(&self, key: &str) -> Result<(), StoreError>;
    /// Remaining TTL, `None` when the key is absent or has no expiry.
    fn kv_ttl_remaining_ms(&self, key: &str) -> Result<Option<u64>, StoreError>;
    /// Write `new` only if the current value equals `expected` (`None` =
    /// key absent). Returns whether the swap applied.
    fn kv_compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_ms: Option<u64>,
    ) -> Result<bool, StoreError>;

    // Bounded list, newest first.
    fn list_push_trim(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl_ms: Option<u64>,
    ) -> Result<(), StoreError>;
    fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;
    fn list_delete(&self, key: &str) -> Result<(), StoreError>;

    // Plain sets with a shared per-key TTL.
    fn set_add(&self, key: &str, members: &[String], ttl_ms: Option<u64>) -> Result<(), StoreError>;
    fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
    fn set_delete(&self, key: &str) -> Result<(), StoreError>;

    // Geospatial index over driver positions.
    fn geo_put(&self, member: DriverId, point: GeoPoint) -> Result<(), StoreError>;
    fn geo_get(&self, member: DriverId) -> Result<Option<GeoPoint>, StoreError>;
    fn geo_remove(&self, member: DriverId) -> Result<(), StoreError>;
    /// Members within `radius_m` of `center`, ascending by distance,
    /// truncated to `limit`.
    fn geo_radius(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<GeoEntry>, StoreError>;

    // Mutual pending-offer sets. A driver appears in a trip's set iff the
    // trip appears in the driver's set; each method maintains both sides
    // atomically.
    fn offers_add(
        &self,
        trip: TripId,
        drivers: &[DriverId],
        ttl_ms: u64,
    ) -> Result<(), StoreError>;
    fn offers_remove(&self, trip: TripId, driver: DriverId) -> Result<(), StoreError>;
    /// Clears the trip's whole set; returns the drivers that were pending.
    fn offers_clear_trip(&self, trip: TripId) -> Result<Vec<DriverId>, StoreError>;
    fn offers_for_trip(&self, trip: TripId) -> Result<Vec<DriverId>, StoreError>;
    fn offers_for_driver(&self, driver: DriverId) -> Result<Vec<TripId>, StoreError>;
    fn offer_pending(&self, trip: TripId, driver: DriverId) -> Result<bool, StoreError>;

    // Lock primitive with TTL, owner token, and extension.
    fn lock_acquire(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StoreError>;
    /// Returns whether the lock was still held by `token`.
    fn lock_release(&self, key: &str, token: &str) -> Result<bool, StoreError>;
    fn lock_extend(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StoreError>;
}

/// Key schema shared by every component that touches the fast store.
pub mod keys {
    use crate::ids::{DriverId, TripId};

    pub fn presence(driver: DriverId) -> String {
        format!("presence:{driver}")
    }

    pub fn location_touch(driver: DriverId) -> String {
        format!("loc_ts:{driver}")
    }

    pub fn location_metadata(driver: DriverId) -> String {
        format!("loc_meta:{driver}")
    }

    pub fn driver_state(driver: DriverId) -> String {
        format!("state:{driver}")
    }

    pub fn driver_state_history(driver: DriverId) -> String {
        format!("state_history:{driver}")
    }

    pub fn active_trip(driver: DriverId) -> String {
        format!("active_trip:{driver}")
    }

    pub fn cooldown(driver: DriverId) -> String {
        format!("cooldown:{driver}")
    }

    pub fn fraud_flag(driver: DriverId) -> String {
        format!("fraud:{driver}")
    }

    pub fn sequential_round(trip: TripId) -> String {
        format!("seq_round:{trip}")
    }

    pub fn notified(trip: TripId) -> String {
        format!("notified:{trip}")
    }

    pub fn trip_lock(trip: TripId) -> String {
        format!("lock:trip:{trip}")
    }

    pub fn driver_lock(driver: DriverId) -> String {
        format!("lock:driver:{driver}")
    }

    pub fn route(trip: TripId) -> String {
        format!("route:{trip}")
    }

    pub fn route_owner(trip: TripId) -> String {
        format!("route_owner:{trip}")
    }
}
