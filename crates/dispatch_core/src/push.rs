//! Realtime push to connected driver clients.
//!
//! The registry tracks live driver sessions with explicit connect and
//! disconnect; components that push to a driver take it as an injected
//! dependency. Delivery is best effort: the dispatch and assignment paths
//! carry on when a driver is unreachable, they only lose the push.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geo::GeoPoint;
use crate::ids::{DriverId, OfferId, TripId};
use crate::repo::VehicleClass;

/// Events pushed to a driver's client, one fixed payload shape per tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    NewTripOffer {
        trip_id: TripId,
        offer_id: OfferId,
        pickup: GeoPoint,
        dest: GeoPoint,
        vehicle: VehicleClass,
        price: f64,
        expires_at_ms: u64,
    },
    TripAccepted {
        trip_id: TripId,
        driver_id: DriverId,
    },
    OfferRevoked {
        trip_id: TripId,
    },
    TripCancelled {
        trip_id: TripId,
    },
    /// Catch-all for tags this build does not know.
    #[serde(other)]
    Unknown,
}

/// Decode a wire payload. Unknown tags and undecodable payloads are logged
/// and dropped rather than silently ignored.
pub fn decode_event(raw: &str) -> Option<PushEvent> {
    match serde_json::from_str::<PushEvent>(raw) {
        Ok(PushEvent::Unknown) => {
            warn!("dropping push event with unknown tag");
            None
        }
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "dropping undecodable push event");
            None
        }
    }
}

/// One connected driver session. The transport (WebSocket, FCM, ...) lives
/// behind this seam.
pub trait PushSender: Send + Sync {
    /// Delivers the event; returns whether the client appeared reachable.
    fn send(&self, event: &PushEvent) -> bool;
}

/// Process-wide registry of connected driver sessions.
#[derive(Default)]
pub struct PushRegistry {
    sessions: Mutex<HashMap<DriverId, Arc<dyn PushSender>>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, driver: DriverId, sender: Arc<dyn PushSender>) {
        debug!(driver_id = %driver, "driver session connected");
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(driver, sender);
        }
    }

    pub fn disconnect(&self, driver: DriverId) {
        debug!(driver_id = %driver, "driver session disconnected");
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&driver);
        }
    }

    pub fn is_connected(&self, driver: DriverId) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.contains_key(&driver))
            .unwrap_or(false)
    }

    /// Best-effort direct notify; false when the driver has no live session
    /// or the send fell over.
    pub fn notify(&self, driver: DriverId, event: &PushEvent) -> bool {
        let sender = self
            .sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(&driver).cloned());
        match sender {
            Some(sender) => {
                let reachable = sender.send(event);
                if !reachable {
                    debug!(driver_id = %driver, "push send failed, driver unreachable");
                }
                reachable
            }
            None => {
                debug!(driver_id = %driver, "no live session for push");
                false
            }
        }
    }
}
