//! In-process implementation of [`FastStore`].
//!
//! All state sits behind one mutex, which makes every compound operation
//! trivially atomic with respect to concurrent callers. Expiry is lazy:
//! reads treat an expired entry as absent and evict it.
//!
//! The geospatial index follows the H3 cell-bucket layout: members bucketed
//! by resolution-9 cell with a reverse member→cell map, radius queries
//! expanding a grid disk around the origin cell and ranking the bucket
//! members by exact haversine distance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use h3o::CellIndex;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::geo::{self, GeoPoint};
use crate::ids::{DriverId, TripId};
use crate::store::{FastStore, GeoEntry};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at_ms: Option<u64>,
}

impl<T> Expiring<T> {
    fn live(&self, now: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct State {
    kv: HashMap<String, Expiring<String>>,
    lists: HashMap<String, Expiring<VecDeque<String>>>,
    sets: HashMap<String, Expiring<HashSet<String>>>,
    drivers_by_cell: HashMap<CellIndex, Vec<DriverId>>,
    member_to_cell: HashMap<DriverId, (CellIndex, GeoPoint)>,
    pending_by_trip: HashMap<TripId, Expiring<HashSet<DriverId>>>,
    pending_by_driver: HashMap<DriverId, HashMap<TripId, u64>>,
    locks: HashMap<String, (String, u64)>,
}

impl State {
    fn kv_live(&mut self, key: &str, now: u64) -> Option<&Expiring<String>> {
        if self.kv.get(key).is_some_and(|e| !e.live(now)) {
            self.kv.remove(key);
        }
        self.kv.get(key)
    }

    fn remove_from_cell(&mut self, member: DriverId, cell: CellIndex) {
        if let Some(members) = self.drivers_by_cell.get_mut(&cell) {
            members.retain(|m| *m != member);
            if members.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
    }

    fn drop_pending_pair(&mut self, trip: TripId, driver: DriverId) {
        if let Some(entry) = self.pending_by_trip.get_mut(&trip) {
            entry.value.remove(&driver);
            if entry.value.is_empty() {
                self.pending_by_trip.remove(&trip);
            }
        }
        if let Some(trips) = self.pending_by_driver.get_mut(&driver) {
            trips.remove(&trip);
            if trips.is_empty() {
                self.pending_by_driver.remove(&driver);
            }
        }
    }
}

/// Single-process fast store.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
    }

    fn expiry(&self, ttl_ms: Option<u64>) -> Option<u64> {
        ttl_ms.map(|ttl| self.clock.now_ms() + ttl)
    }
}

impl FastStore for MemoryStore {
    fn kv_put(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let expires_at_ms = self.expiry(ttl_ms);
        let mut state = self.lock_state()?;
        state.kv.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        Ok(state.kv_live(key, now).map(|e| e.value.clone()))
    }

    fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock_state()?.kv.remove(key);
        Ok(())
    }

    fn kv_ttl_remaining_ms(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        Ok(state
            .kv_live(key, now)
            .and_then(|e| e.expires_at_ms)
            .map(|at| at.saturating_sub(now)))
    }

    fn kv_compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl_ms: Option<u64>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl_ms);
        let mut state = self.lock_state()?;
        let current = state.kv_live(key, now).map(|e| e.value.clone());
        if current.as_deref() != expected {
            return Ok(false);
        }
        state.kv.insert(
            key.to_string(),
            Expiring {
                value: new.to_string(),
                expires_at_ms,
            },
        );
        Ok(true)
    }

    fn list_push_trim(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl_ms);
        let mut state = self.lock_state()?;
        if state.lists.get(key).is_some_and(|e| !e.live(now)) {
            state.lists.remove(key);
        }
        let entry = state.lists.entry(key.to_string()).or_insert_with(|| Expiring {
            value: VecDeque::new(),
            expires_at_ms,
        });
        entry.expires_at_ms = expires_at_ms;
        entry.value.push_front(value.to_string());
        while entry.value.len() > max_len {
            entry.value.pop_back();
        }
        Ok(())
    }

    fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        if state.lists.get(key).is_some_and(|e| !e.live(now)) {
            state.lists.remove(key);
        }
        Ok(state
            .lists
            .get(key)
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn list_delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock_state()?.lists.remove(key);
        Ok(())
    }

    fn set_add(
        &self,
        key: &str,
        members: &[String],
        ttl_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl_ms);
        let mut state = self.lock_state()?;
        if state.sets.get(key).is_some_and(|e| !e.live(now)) {
            state.sets.remove(key);
        }
        let entry = state.sets.entry(key.to_string()).or_insert_with(|| Expiring {
            value: HashSet::new(),
            expires_at_ms,
        });
        entry.expires_at_ms = expires_at_ms;
        entry.value.extend(members.iter().cloned());
        Ok(())
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        if state.sets.get(key).is_some_and(|e| !e.live(now)) {
            state.sets.remove(key);
        }
        Ok(state
            .sets
            .get(key)
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn set_delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock_state()?.sets.remove(key);
        Ok(())
    }

    fn geo_put(&self, member: DriverId, point: GeoPoint) -> Result<(), StoreError> {
        let Some(cell) = geo::to_cell(point) else {
            return Err(StoreError::Unavailable(format!(
                "coordinates out of range: {point:?}"
            )));
        };
        let mut state = self.lock_state()?;
        if let Some((old_cell, _)) = state.member_to_cell.get(&member).copied() {
            if old_cell != cell {
                state.remove_from_cell(member, old_cell);
            }
        }
        let bucket = state.drivers_by_cell.entry(cell).or_default();
        if !bucket.contains(&member) {
            bucket.push(member);
        }
        state.member_to_cell.insert(member, (cell, point));
        Ok(())
    }

    fn geo_get(&self, member: DriverId) -> Result<Option<GeoPoint>, StoreError> {
        let state = self.lock_state()?;
        Ok(state.member_to_cell.get(&member).map(|(_, p)| *p))
    }

    fn geo_remove(&self, member: DriverId) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        if let Some((cell, _)) = state.member_to_cell.remove(&member) {
            state.remove_from_cell(member, cell);
        }
        Ok(())
    }

    fn geo_radius(
        &self,
        center: GeoPoint,
        radius_m: f64,
        limit: usize,
    ) -> Result<Vec<GeoEntry>, StoreError> {
        let Some(origin) = geo::to_cell(center) else {
            return Ok(Vec::new());
        };
        let state = self.lock_state()?;
        let mut hits = Vec::new();
        for cell in geo::cells_within_radius(origin, radius_m) {
            let Some(members) = state.drivers_by_cell.get(&cell) else {
                continue;
            };
            for member in members {
                let Some((_, point)) = state.member_to_cell.get(member) else {
                    continue;
                };
                let distance_m = geo::haversine_m(center, *point);
                if distance_m <= radius_m {
                    hits.push(GeoEntry {
                        member: *member,
                        point: *point,
                        distance_m,
                    });
                }
            }
        }
        hits.sort_by(|a, b| {
            a.distance_m
                .partial_cmp(&b.distance_m)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn offers_add(
        &self,
        trip: TripId,
        drivers: &[DriverId],
        ttl_ms: u64,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let expires_at_ms = now + ttl_ms;
        let mut state = self.lock_state()?;
        if state.pending_by_trip.get(&trip).is_some_and(|e| !e.live(now)) {
            let stale: Vec<_> = state
                .pending_by_trip
                .remove(&trip)
                .map(|e| e.value.into_iter().collect())
                .unwrap_or_default();
            for driver in stale {
                state.drop_pending_pair(trip, driver);
            }
        }
        let entry = state.pending_by_trip.entry(trip).or_insert_with(|| Expiring {
            value: HashSet::new(),
            expires_at_ms: Some(expires_at_ms),
        });
        entry.expires_at_ms = Some(expires_at_ms);
        entry.value.extend(drivers.iter().copied());
        for driver in drivers {
            state
                .pending_by_driver
                .entry(*driver)
                .or_default()
                .insert(trip, expires_at_ms);
        }
        Ok(())
    }

    fn offers_remove(&self, trip: TripId, driver: DriverId) -> Result<(), StoreError> {
        let mut state = self.lock_state()?;
        state.drop_pending_pair(trip, driver);
        Ok(())
    }

    fn offers_clear_trip(&self, trip: TripId) -> Result<Vec<DriverId>, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        let Some(entry) = state.pending_by_trip.remove(&trip) else {
            return Ok(Vec::new());
        };
        let was_live = entry.live(now);
        let drivers: Vec<DriverId> = entry.value.into_iter().collect();
        for driver in &drivers {
            if let Some(trips) = state.pending_by_driver.get_mut(driver) {
                trips.remove(&trip);
                if trips.is_empty() {
                    state.pending_by_driver.remove(driver);
                }
            }
        }
        Ok(if was_live { drivers } else { Vec::new() })
    }

    fn offers_for_trip(&self, trip: TripId) -> Result<Vec<DriverId>, StoreError> {
        let now = self.clock.now_ms();
        let state = self.lock_state()?;
        Ok(state
            .pending_by_trip
            .get(&trip)
            .filter(|e| e.live(now))
            .map(|e| e.value.iter().copied().collect())
            .unwrap_or_default())
    }

    fn offers_for_driver(&self, driver: DriverId) -> Result<Vec<TripId>, StoreError> {
        let now = self.clock.now_ms();
        let state = self.lock_state()?;
        Ok(state
            .pending_by_driver
            .get(&driver)
            .map(|trips| {
                trips
                    .iter()
                    .filter(|(_, expires)| **expires > now)
                    .map(|(trip, _)| *trip)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn offer_pending(&self, trip: TripId, driver: DriverId) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let state = self.lock_state()?;
        Ok(state
            .pending_by_trip
            .get(&trip)
            .filter(|e| e.live(now))
            .is_some_and(|e| e.value.contains(&driver)))
    }

    fn lock_acquire(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        match state.locks.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                state
                    .locks
                    .insert(key.to_string(), (token.to_string(), now + ttl_ms));
                Ok(true)
            }
        }
    }

    fn lock_release(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        match state.locks.get(key) {
            Some((owner, expires_at)) if owner == token && *expires_at > now => {
                state.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn lock_extend(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock_state()?;
        match state.locks.get_mut(key) {
            Some((owner, expires_at)) if owner == token && *expires_at > now => {
                *expires_at = now + ttl_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
