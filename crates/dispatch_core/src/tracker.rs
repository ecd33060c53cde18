//! Route recording for active trips.
//!
//! Points accumulate in a bounded, order-preserving fast-store buffer
//! while the trip runs; stopping the tracker drains the buffer into a
//! columnar (parquet) or plain-text (csv) archive file and clears the
//! fast-store keys. Not part of the assignment critical path.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{ArchiveError, EngineError, StoreError};
use crate::geo::{self, GeoPoint};
use crate::ids::{DriverId, TripId};
use crate::store::{keys, FastStore};

/// One recorded position sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub lat: f64,
    pub lng: f64,
    pub timestamp_ms: u64,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
}

/// Where a stopped trip's points go.
#[derive(Debug, Clone, Copy)]
pub enum RouteArchive<'a> {
    Parquet(&'a Path),
    Csv(&'a Path),
}

pub struct TripTracker {
    store: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl TripTracker {
    pub fn new(store: Arc<dyn FastStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Begins a fresh recording, discarding any leftover buffer for the
    /// trip.
    pub fn start_tracking(&self, trip: TripId, driver: DriverId) -> Result<(), StoreError> {
        self.store.list_delete(&keys::route(trip))?;
        self.store
            .kv_put(&keys::route_owner(trip), &driver.to_string(), None)?;
        info!(trip_id = %trip, driver_id = %driver, "route tracking started");
        Ok(())
    }

    /// Appends a sample; the buffer keeps the most recent points up to the
    /// configured capacity.
    pub fn add_route_point(
        &self,
        trip: TripId,
        lat: f64,
        lng: f64,
        timestamp_ms: Option<u64>,
        speed_mps: Option<f64>,
        heading_deg: Option<f64>,
    ) -> Result<(), StoreError> {
        let point = RoutePoint {
            lat,
            lng,
            timestamp_ms: timestamp_ms.unwrap_or_else(|| self.clock.now_ms()),
            speed_mps,
            heading_deg,
        };
        self.store.list_push_trim(
            &keys::route(trip),
            &serde_json::to_string(&point)?,
            self.config.route_capacity,
            None,
        )
    }

    /// Recorded points in chronological order.
    pub fn get_route_points(&self, trip: TripId) -> Result<Vec<RoutePoint>, StoreError> {
        let raw = self.store.list_range(&keys::route(trip))?;
        // The buffer is newest-first.
        raw.iter()
            .rev()
            .map(|entry| serde_json::from_str(entry).map_err(StoreError::from))
            .collect()
    }

    /// Sum of consecutive great-circle hops over the recorded points, in
    /// meters.
    pub fn calculate_trip_distance(&self, trip: TripId) -> Result<f64, StoreError> {
        let points = self.get_route_points(trip)?;
        Ok(points
            .windows(2)
            .map(|pair| {
                geo::haversine_m(
                    GeoPoint::new(pair[0].lat, pair[0].lng),
                    GeoPoint::new(pair[1].lat, pair[1].lng),
                )
            })
            .sum())
    }

    /// Drains the buffer, optionally archiving it, and clears the
    /// fast-store keys. Returns the recorded points.
    pub fn stop_tracking(
        &self,
        trip: TripId,
        archive: Option<RouteArchive<'_>>,
    ) -> Result<Vec<RoutePoint>, EngineError> {
        let points = self.get_route_points(trip)?;
        match archive {
            Some(RouteArchive::Parquet(path)) => write_route_parquet(path, &points)?,
            Some(RouteArchive::Csv(path)) => write_route_csv(path, &points)?,
            None => {}
        }
        self.store.list_delete(&keys::route(trip))?;
        self.store.kv_delete(&keys::route_owner(trip))?;
        info!(trip_id = %trip, samples = points.len(), "route tracking stopped");
        Ok(points)
    }
}

/// Columnar archive of a trip's route.
pub fn write_route_parquet(path: &Path, points: &[RoutePoint]) -> Result<(), ArchiveError> {
    let mut lat = Vec::with_capacity(points.len());
    let mut lng = Vec::with_capacity(points.len());
    let mut timestamp_ms = Vec::with_capacity(points.len());
    let mut speed_mps = Vec::with_capacity(points.len());
    let mut heading_deg = Vec::with_capacity(points.len());
    for point in points {
        lat.push(point.lat);
        lng.push(point.lng);
        timestamp_ms.push(point.timestamp_ms);
        speed_mps.push(point.speed_mps);
        heading_deg.push(point.heading_deg);
    }

    let schema = Schema::new(vec![
        Field::new("lat", DataType::Float64, false),
        Field::new("lng", DataType::Float64, false),
        Field::new("timestamp_ms", DataType::UInt64, false),
        Field::new("speed_mps", DataType::Float64, true),
        Field::new("heading_deg", DataType::Float64, true),
    ]);
    let arrays: Vec<ArrayRef> = vec![
        Arc::new(Float64Array::from(lat)),
        Arc::new(Float64Array::from(lng)),
        Arc::new(UInt64Array::from(timestamp_ms)),
        Arc::new(Float64Array::from(speed_mps)),
        Arc::new(Float64Array::from(heading_deg)),
    ];

    let schema = Arc::new(schema);
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Plain-text archive of a trip's route.
pub fn write_route_csv(path: &Path, points: &[RoutePoint]) -> Result<(), ArchiveError> {
    let mut writer = csv::Writer::from_path(path)?;
    for point in points {
        writer.serialize(point)?;
    }
    writer.flush().map_err(ArchiveError::Io)?;
    Ok(())
}
