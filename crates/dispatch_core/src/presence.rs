//! Online/offline presence, independent of position.
//!
//! Presence is the TTL-backed "is this driver's client actively connected"
//! signal. It is advisory and self-healing: a client that stops sending
//! heartbeats silently becomes invisible to matching when the marker
//! expires, with no explicit go-offline call. Absence of the marker is the
//! authoritative definition of offline, whatever the relational driver
//! record says.

use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::ids::DriverId;
use crate::store::{keys, FastStore};

pub struct DriverPresence {
    store: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl DriverPresence {
    pub fn new(store: Arc<dyn FastStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn set_online(&self, driver: DriverId) -> Result<(), StoreError> {
        info!(driver_id = %driver, "driver online");
        self.refresh(driver)
    }

    /// Marks the driver offline and clears their cached location.
    pub fn set_offline(&self, driver: DriverId) -> Result<(), StoreError> {
        info!(driver_id = %driver, "driver offline");
        self.store.kv_delete(&keys::presence(driver))?;
        self.store.geo_remove(driver)?;
        self.store.kv_delete(&keys::location_touch(driver))?;
        self.store.kv_delete(&keys::location_metadata(driver))?;
        Ok(())
    }

    pub fn is_online(&self, driver: DriverId) -> Result<bool, StoreError> {
        Ok(self.store.kv_get(&keys::presence(driver))?.is_some())
    }

    /// Extends the TTL, creating the marker if absent.
    pub fn refresh(&self, driver: DriverId) -> Result<(), StoreError> {
        self.store.kv_put(
            &keys::presence(driver),
            &self.clock.now_ms().to_string(),
            Some(self.config.presence_ttl_ms),
        )
    }

    /// Seconds until the marker lapses, or -1 when absent.
    pub fn time_remaining_secs(&self, driver: DriverId) -> Result<i64, StoreError> {
        Ok(self
            .store
            .kv_ttl_remaining_ms(&keys::presence(driver))?
            .map(|ms| (ms / 1_000) as i64)
            .unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo::GeoPoint;
    use crate::store::MemoryStore;

    fn presence() -> (Arc<ManualClock>, Arc<MemoryStore>, DriverPresence) {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (
            clock.clone(),
            store.clone(),
            DriverPresence::new(store, clock, EngineConfig::default()),
        )
    }

    #[test]
    fn marker_expires_without_heartbeat() {
        let (clock, _store, presence) = presence();
        let driver = DriverId::new();
        presence.set_online(driver).expect("online");
        assert!(presence.is_online(driver).expect("check"));

        clock.advance_ms(EngineConfig::default().presence_ttl_ms + 1);
        assert!(!presence.is_online(driver).expect("check"));
        assert_eq!(presence.time_remaining_secs(driver).expect("ttl"), -1);
    }

    #[test]
    fn refresh_extends_the_window() {
        let (clock, _store, presence) = presence();
        let driver = DriverId::new();
        let ttl = EngineConfig::default().presence_ttl_ms;
        presence.set_online(driver).expect("online");
        clock.advance_ms(ttl - 1_000);
        presence.refresh(driver).expect("refresh");
        clock.advance_ms(ttl - 1_000);
        assert!(presence.is_online(driver).expect("check"));
    }

    #[test]
    fn set_offline_clears_location() {
        let (_clock, store, presence) = presence();
        let driver = DriverId::new();
        presence.set_online(driver).expect("online");
        store
            .geo_put(driver, GeoPoint::new(30.0444, 31.2357))
            .expect("position");

        presence.set_offline(driver).expect("offline");
        assert!(!presence.is_online(driver).expect("check"));
        assert!(store.geo_get(driver).expect("geo").is_none());
    }

    #[test]
    fn time_remaining_reports_seconds() {
        let (clock, _store, presence) = presence();
        let driver = DriverId::new();
        presence.set_online(driver).expect("online");
        clock.advance_ms(10_000);
        let remaining = presence.time_remaining_secs(driver).expect("ttl");
        assert_eq!(
            remaining,
            ((EngineConfig::default().presence_ttl_ms - 10_000) / 1_000) as i64
        );
    }
}
