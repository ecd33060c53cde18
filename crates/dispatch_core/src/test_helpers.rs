//! Shared fixtures for tests and benchmarks.

use std::sync::{Arc, Mutex};

use crate::geo::GeoPoint;
use crate::ids::{CustomerId, DriverId, TripId};
use crate::push::{PushEvent, PushSender};
use crate::repo::{DriverRecord, DriverStatus, TripRecord, TripStatus, VehicleClass};

/// Downtown Cairo; the standard pickup point across test files.
pub const TEST_PICKUP: GeoPoint = GeoPoint {
    lat: 30.0444,
    lng: 31.2357,
};

/// A destination a few kilometers northeast of [`TEST_PICKUP`].
pub const TEST_DEST: GeoPoint = GeoPoint {
    lat: 30.0626,
    lng: 31.2497,
};

/// An approved comfort-class driver record at `position`, rated 4.8, last
/// seen at `last_update_ms`.
pub fn approved_driver(id: DriverId, position: GeoPoint, last_update_ms: u64) -> DriverRecord {
    DriverRecord {
        id,
        status: DriverStatus::Approved,
        vehicle: VehicleClass::Comfort,
        vehicle_model: "Toyota Corolla".into(),
        rating: 4.8,
        last_position: Some(position),
        last_location_update_ms: Some(last_update_ms),
        dest_preference_enabled: false,
    }
}

/// A freshly requested comfort trip from [`TEST_PICKUP`] to [`TEST_DEST`].
pub fn requested_trip(customer: CustomerId) -> TripRecord {
    TripRecord {
        id: TripId::new(),
        customer_id: customer,
        driver_id: None,
        status: TripStatus::Requested,
        pickup: TEST_PICKUP,
        dest: TEST_DEST,
        vehicle: VehicleClass::Comfort,
        price: 45.0,
    }
}

/// A [`PushSender`] that records everything it is handed. Construct with
/// [`RecordingSender::reachable`] or [`RecordingSender::unreachable`] to
/// model a live or dead client.
pub struct RecordingSender {
    reachable: bool,
    events: Mutex<Vec<PushEvent>>,
}

impl RecordingSender {
    pub fn reachable() -> Arc<Self> {
        Arc::new(Self {
            reachable: true,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            reachable: false,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<PushEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl PushSender for RecordingSender {
    fn send(&self, event: &PushEvent) -> bool {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        self.reachable
    }
}
