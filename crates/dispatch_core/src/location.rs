//! Driver position cache with freshness semantics.
//!
//! Positions live in the fast store's geospatial index; metadata (heading,
//! speed, vehicle, rating) sits alongside under its own, longer expiry.
//! Every update refreshes the driver's presence marker as a side effect.
//! Radius queries filter out entries whose presence or freshness window has
//! lapsed even if the geospatial structure still holds them, evicting the
//! stale entry on read.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::geo::GeoPoint;
use crate::ids::DriverId;
use crate::repo::VehicleClass;
use crate::store::{keys, FastStore};

/// Optional observations attached to a position update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationMetadata {
    pub heading_deg: Option<f64>,
    pub speed_mps: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub timestamp_ms: u64,
    pub vehicle: Option<VehicleClass>,
    pub rating: Option<f64>,
}

/// A driver's current position, with distance populated on radius queries.
#[derive(Debug, Clone)]
pub struct DriverLocation {
    pub driver_id: DriverId,
    pub position: GeoPoint,
    pub distance_m: Option<f64>,
    pub metadata: Option<LocationMetadata>,
}

pub struct LocationCache {
    store: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl LocationCache {
    pub fn new(store: Arc<dyn FastStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Overwrite the driver's position and refresh presence.
    pub fn update_location(
        &self,
        driver: DriverId,
        position: GeoPoint,
        metadata: Option<LocationMetadata>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.store.geo_put(driver, position)?;
        self.store.kv_put(
            &keys::location_touch(driver),
            &now.to_string(),
            Some(self.config.location_freshness_ms),
        )?;
        if let Some(metadata) = metadata {
            self.store.kv_put(
                &keys::location_metadata(driver),
                &serde_json::to_string(&metadata)?,
                Some(self.config.metadata_ttl_ms),
            )?;
        }
        // Position updates are heartbeats: keep the driver visible.
        self.store.kv_put(
            &keys::presence(driver),
            &now.to_string(),
            Some(self.config.presence_ttl_ms),
        )?;
        Ok(())
    }

    /// Drivers within `radius_m` of `center`, ascending by distance, stale
    /// entries excluded and evicted.
    pub fn get_nearby(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<DriverLocation>, StoreError> {
        let raw = self.store.geo_radius(center, radius_m, self.config.candidate_cap)?;
        let mut fresh = Vec::with_capacity(raw.len());
        for entry in raw {
            if !self.is_fresh(entry.member)? {
                debug!(driver_id = %entry.member, "evicting stale location entry");
                self.remove(entry.member)?;
                continue;
            }
            fresh.push(DriverLocation {
                driver_id: entry.member,
                position: entry.point,
                distance_m: Some(entry.distance_m),
                metadata: self.metadata(entry.member)?,
            });
            if fresh.len() == limit {
                break;
            }
        }
        Ok(fresh)
    }

    pub fn get_location(&self, driver: DriverId) -> Result<Option<DriverLocation>, StoreError> {
        let Some(position) = self.store.geo_get(driver)? else {
            return Ok(None);
        };
        if !self.is_fresh(driver)? {
            self.remove(driver)?;
            return Ok(None);
        }
        Ok(Some(DriverLocation {
            driver_id: driver,
            position,
            distance_m: None,
            metadata: self.metadata(driver)?,
        }))
    }

    /// Idempotent; unknown drivers are not an error.
    pub fn remove(&self, driver: DriverId) -> Result<(), StoreError> {
        self.store.geo_remove(driver)?;
        self.store.kv_delete(&keys::location_touch(driver))?;
        self.store.kv_delete(&keys::location_metadata(driver))?;
        Ok(())
    }

    /// Milliseconds since the last update, when known and fresh.
    pub fn last_update_age_ms(&self, driver: DriverId) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .kv_get(&keys::location_touch(driver))?
            .and_then(|v| v.parse::<u64>().ok())
            .map(|at| now.saturating_sub(at)))
    }

    fn is_fresh(&self, driver: DriverId) -> Result<bool, StoreError> {
        // Both the presence marker and the location touch must be live.
        let present = self.store.kv_get(&keys::presence(driver))?.is_some();
        let touched = self.store.kv_get(&keys::location_touch(driver))?.is_some();
        Ok(present && touched)
    }

    fn metadata(&self, driver: DriverId) -> Result<Option<LocationMetadata>, StoreError> {
        match self.store.kv_get(&keys::location_metadata(driver))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn cache() -> (Arc<ManualClock>, LocationCache) {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (
            clock.clone(),
            LocationCache::new(store, clock, EngineConfig::default()),
        )
    }

    const CENTER: GeoPoint = GeoPoint {
        lat: 30.0444,
        lng: 31.2357,
    };

    #[test]
    fn nearby_returns_fresh_entries_sorted() {
        let (_clock, cache) = cache();
        let near = DriverId::new();
        let far = DriverId::new();
        cache
            .update_location(far, GeoPoint::new(30.0600, 31.2500), None)
            .expect("update far");
        cache
            .update_location(near, GeoPoint::new(30.0450, 31.2360), None)
            .expect("update near");

        let hits = cache.get_nearby(CENTER, 10_000.0, 10).expect("nearby");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].driver_id, near);
        assert!(hits[0].distance_m.expect("distance") < hits[1].distance_m.expect("distance"));
    }

    #[test]
    fn stale_entries_are_excluded_and_evicted() {
        let (clock, cache) = cache();
        let driver = DriverId::new();
        cache
            .update_location(driver, GeoPoint::new(30.0450, 31.2360), None)
            .expect("update");

        clock.advance_ms(EngineConfig::default().location_freshness_ms + 1);
        assert!(cache.get_nearby(CENTER, 10_000.0, 10).expect("nearby").is_empty());
        // Evicted on read: a direct lookup now misses too.
        assert!(cache.get_location(driver).expect("get").is_none());
    }

    #[test]
    fn update_refreshes_staleness_window() {
        let (clock, cache) = cache();
        let driver = DriverId::new();
        let config = EngineConfig::default();
        cache
            .update_location(driver, GeoPoint::new(30.0450, 31.2360), None)
            .expect("update");
        clock.advance_ms(config.location_freshness_ms - 1_000);
        cache
            .update_location(driver, GeoPoint::new(30.0451, 31.2361), None)
            .expect("refresh");
        clock.advance_ms(config.location_freshness_ms - 1_000);
        assert_eq!(cache.get_nearby(CENTER, 10_000.0, 10).expect("nearby").len(), 1);
    }

    #[test]
    fn metadata_round_trips_and_outlives_position_freshness() {
        let (clock, cache) = cache();
        let driver = DriverId::new();
        let metadata = LocationMetadata {
            heading_deg: Some(90.0),
            speed_mps: Some(8.3),
            accuracy_m: Some(5.0),
            timestamp_ms: 0,
            vehicle: Some(VehicleClass::Comfort),
            rating: Some(4.8),
        };
        cache
            .update_location(driver, GeoPoint::new(30.0450, 31.2360), Some(metadata))
            .expect("update");

        let loc = cache.get_location(driver).expect("get").expect("fresh");
        let meta = loc.metadata.expect("metadata");
        assert_eq!(meta.vehicle, Some(VehicleClass::Comfort));

        // Metadata has a longer expiry than position freshness.
        clock.advance_ms(EngineConfig::default().location_freshness_ms + 1);
        assert!(cache.get_location(driver).expect("get").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_clock, cache) = cache();
        let driver = DriverId::new();
        cache.remove(driver).expect("remove unknown");
        cache.remove(driver).expect("remove again");
    }
}
