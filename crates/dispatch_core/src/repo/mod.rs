//! Durable-store seam: the driver, trip, and offer records the engine reads
//! and writes, and the repository traits it reaches them through.
//!
//! The schema is owned elsewhere; these traits name only the fields and
//! operations the engine requires. The critical operation is
//! [`TripRepository::assign_if_requested`]: a conditional update with
//! compare-and-swap semantics, the definitive guard against double
//! assignment.

mod memory;

pub use memory::{MemoryDriverRepository, MemoryOfferRepository, MemoryTripRepository};

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::geo::GeoPoint;
use crate::ids::{CustomerId, DriverId, OfferId, TripId};

/// Vehicle tiers, ordered. A higher tier may serve a lower-tier request,
/// never the reverse.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Economy,
    Comfort,
    Premium,
    Xl,
}

impl VehicleClass {
    /// Whether a vehicle of this class can serve a request for `requested`.
    pub fn serves(self, requested: VehicleClass) -> bool {
        self >= requested
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VehicleClass::Economy => "economy",
            VehicleClass::Comfort => "comfort",
            VehicleClass::Premium => "premium",
            VehicleClass::Xl => "xl",
        };
        f.write_str(s)
    }
}

/// Approval status of a driver account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Approved,
    Pending,
    Suspended,
}

/// The driver fields the engine reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    pub id: DriverId,
    pub status: DriverStatus,
    pub vehicle: VehicleClass,
    pub vehicle_model: String,
    pub rating: f64,
    pub last_position: Option<GeoPoint>,
    pub last_location_update_ms: Option<u64>,
    pub dest_preference_enabled: bool,
}

/// Trip lifecycle states. `Requested` is the only state a driver can be
/// assigned from; `Cancelled`, `TimedOut`, and `Completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Requested,
    Accepted,
    Cancelled,
    TimedOut,
    Completed,
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripStatus::Requested => "requested",
            TripStatus::Accepted => "accepted",
            TripStatus::Cancelled => "cancelled",
            TripStatus::TimedOut => "timed_out",
            TripStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// The trip fields the engine reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRecord {
    pub id: TripId,
    pub customer_id: CustomerId,
    pub driver_id: Option<DriverId>,
    pub status: TripStatus,
    pub pickup: GeoPoint,
    pub dest: GeoPoint,
    pub vehicle: VehicleClass,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
}

/// One notification of a trip to one driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripOffer {
    pub id: OfferId,
    pub trip_id: TripId,
    pub driver_id: DriverId,
    pub offer_price: Option<f64>,
    pub status: OfferStatus,
}

/// A driver-configured preferred destination with its match radius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationPreference {
    pub point: GeoPoint,
    pub radius_km: f64,
}

/// Result of the conditional trip assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalAssign {
    /// The trip was still `Requested` with no driver; it is now `Accepted`.
    Assigned,
    /// Another caller won the race.
    AlreadyAssigned { driver: Option<DriverId> },
    /// The trip reached a non-assignable status before this call.
    NotAssignable { status: TripStatus },
    NotFound,
}

/// Result of the exclusive offer acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferAccept {
    /// The offer was pending; it is now accepted and every pending sibling
    /// on the same trip is rejected.
    Accepted,
    /// The offer had already been resolved.
    AlreadyResolved { status: OfferStatus },
    NotFound,
}

pub trait DriverRepository: Send + Sync {
    fn get(&self, id: DriverId) -> Result<Option<DriverRecord>, StoreError>;
    /// Spatial-index fallback query against the durable store; same shape
    /// as the fast-store radius query, only slower. Distances in meters,
    /// ascending.
    fn find_nearby(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<(DriverRecord, f64)>, StoreError>;
    fn destination_preferences(
        &self,
        id: DriverId,
    ) -> Result<Vec<DestinationPreference>, StoreError>;
    fn blocked_drivers(&self, customer: CustomerId) -> Result<HashSet<DriverId>, StoreError>;
    /// Whether this driver has previously completed a trip for this
    /// customer (repeat-customer scoring factor).
    fn has_completed_trip_for(
        &self,
        driver: DriverId,
        customer: CustomerId,
    ) -> Result<bool, StoreError>;
}

pub trait TripRepository: Send + Sync {
    fn get(&self, id: TripId) -> Result<Option<TripRecord>, StoreError>;
    fn insert(&self, trip: TripRecord) -> Result<(), StoreError>;
    /// Atomically move the trip from `Requested` with no driver to
    /// `Accepted` with `driver`. Any other current state loses.
    fn assign_if_requested(
        &self,
        id: TripId,
        driver: DriverId,
    ) -> Result<ConditionalAssign, StoreError>;
    /// Conditionally set the status; returns whether the update applied.
    fn set_status_if(
        &self,
        id: TripId,
        expected: TripStatus,
        new: TripStatus,
    ) -> Result<bool, StoreError>;
}

pub trait OfferRepository: Send + Sync {
    fn insert(&self, offer: TripOffer) -> Result<(), StoreError>;
    fn get(&self, id: OfferId) -> Result<Option<TripOffer>, StoreError>;
    /// Atomically accept this offer and reject all pending siblings on the
    /// same trip.
    fn accept_exclusive(&self, id: OfferId) -> Result<OfferAccept, StoreError>;
    /// Mark a single offer rejected; returns whether it was still pending.
    fn mark_rejected(&self, id: OfferId) -> Result<bool, StoreError>;
    /// Record a driver's bid price on a pending offer; returns whether the
    /// offer was still pending.
    fn set_bid(&self, id: OfferId, price: f64) -> Result<bool, StoreError>;
    fn pending_for_trip(&self, trip: TripId) -> Result<Vec<TripOffer>, StoreError>;
}
