//! Geographic primitives: H3-based indexing helpers and distance calculations.
//!
//! Positions are indexed at H3 resolution 9 (~240m cell size), which keeps
//! grid-disk radius queries cheap at city scale. Cell-to-cell distances are
//! memoized in an LRU cache since the same cell pairs recur heavily during
//! matching.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Indexing resolution for driver positions.
pub const INDEX_RESOLUTION: Resolution = Resolution::Nine;

/// Approximate center-to-center spacing of adjacent resolution-9 cells, in
/// meters. Used to size grid disks that cover a metric radius.
const RES9_CELL_SPACING_M: f64 = 302.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle (haversine) distance between two points, in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Index a point at [`INDEX_RESOLUTION`]. Returns `None` for coordinates
/// outside the valid WGS84 range.
pub fn to_cell(point: GeoPoint) -> Option<CellIndex> {
    LatLng::new(point.lat, point.lng)
        .ok()
        .map(|ll| ll.to_cell(INDEX_RESOLUTION))
}

/// Center coordinates of a cell.
pub fn cell_center(cell: CellIndex) -> GeoPoint {
    let ll: LatLng = cell.into();
    GeoPoint::new(ll.lat(), ll.lng())
}

/// All cells whose members could lie within `radius_m` of `origin`.
///
/// Overshoots by one ring so boundary entries are not missed; callers filter
/// by exact haversine distance afterwards.
pub fn cells_within_radius(origin: CellIndex, radius_m: f64) -> Vec<CellIndex> {
    let k = (radius_m / RES9_CELL_SPACING_M).ceil() as u32 + 1;
    origin.grid_disk::<Vec<_>>(k)
}

fn distance_cache() -> &'static Mutex<LruCache<(CellIndex, CellIndex), f64>> {
    static CACHE: OnceLock<Mutex<LruCache<(CellIndex, CellIndex), f64>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(
            NonZeroUsize::new(50_000).expect("cache size must be non-zero"),
        ))
    })
}

/// Haversine distance between two cell centers with LRU caching.
pub fn cell_distance_m(a: CellIndex, b: CellIndex) -> f64 {
    // Symmetric key (smaller cell first) to maximize cache hits.
    let key = if a < b { (a, b) } else { (b, a) };

    let mut cache = match distance_cache().lock() {
        Ok(guard) => guard,
        // Fallback: compute without cache if mutex poisoned.
        Err(_) => return haversine_m(cell_center(key.0), cell_center(key.1)),
    };
    *cache.get_or_insert(key, || haversine_m(cell_center(key.0), cell_center(key.1)))
}
