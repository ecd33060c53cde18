//! Driver lifecycle state machine.
//!
//! The state machine is the single source of truth for whether a driver may
//! receive or accept offers right now. State lives in the fast store under
//! a 24h TTL; transitions are single-key compare-and-swap operations, so
//! concurrent attempts for the same driver interleave safely (the last
//! valid transition wins, invalid ones are rejected without touching
//! state). Every applied transition lands in a bounded per-driver audit
//! ring.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::ids::{DriverId, TripId};
use crate::scheduler::{EngineTask, TaskQueue};
use crate::store::{keys, FastStore};

/// Driver lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Offline,
    Available,
    Offered,
    Busy,
    Cooldown,
}

impl DriverState {
    /// The legal transition table. Same-state transitions are handled as
    /// no-op successes before this is consulted.
    pub fn can_transition_to(self, to: DriverState) -> bool {
        use DriverState::*;
        matches!(
            (self, to),
            (Offline, Available)
                | (Available, Offline)
                | (Available, Offered)
                | (Available, Busy)
                | (Offered, Available)
                | (Offered, Busy)
                | (Offered, Offline)
                | (Busy, Cooldown)
                | (Busy, Offline)
                | (Cooldown, Available)
                | (Cooldown, Offline)
        )
    }
}

/// Outcome of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Transition to the current state; nothing to do.
    NoOp,
    /// The edge is not in the transition table. State untouched; the caller
    /// should treat this as "precondition not met".
    Rejected { from: DriverState },
}

/// One applied transition, as recorded in the audit ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: DriverState,
    pub to: DriverState,
    pub at_ms: u64,
    pub trip_id: Option<TripId>,
}

pub struct DriverStateMachine {
    store: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
    tasks: Arc<TaskQueue>,
    config: EngineConfig,
}

impl DriverStateMachine {
    pub fn new(
        store: Arc<dyn FastStore>,
        clock: Arc<dyn Clock>,
        tasks: Arc<TaskQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            tasks,
            config,
        }
    }

    /// Current state; an absent or expired record reads as offline.
    pub fn current(&self, driver: DriverId) -> Result<DriverState, StoreError> {
        match self.store.kv_get(&keys::driver_state(driver))? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(DriverState::Offline),
        }
    }

    pub fn transition(
        &self,
        driver: DriverId,
        to: DriverState,
        trip_id: Option<TripId>,
    ) -> Result<TransitionOutcome, StoreError> {
        let key = keys::driver_state(driver);
        let new = serde_json::to_string(&to)?;
        // CAS loop: re-read on contention so concurrent transitions for the
        // same driver serialize on the store.
        loop {
            let raw = self.store.kv_get(&key)?;
            let from = match &raw {
                Some(raw) => serde_json::from_str(raw)?,
                None => DriverState::Offline,
            };
            if from == to {
                return Ok(TransitionOutcome::NoOp);
            }
            if !from.can_transition_to(to) {
                warn!(
                    driver_id = %driver,
                    ?from,
                    ?to,
                    "rejected illegal driver state transition"
                );
                return Ok(TransitionOutcome::Rejected { from });
            }
            let swapped = self.store.kv_compare_and_swap(
                &key,
                raw.as_deref(),
                &new,
                Some(self.config.state_ttl_ms),
            )?;
            if !swapped {
                debug!(driver_id = %driver, "driver state changed concurrently, retrying");
                continue;
            }
            let at_ms = self.clock.now_ms();
            info!(driver_id = %driver, ?from, ?to, "driver state transition");
            self.record(driver, TransitionRecord {
                from,
                to,
                at_ms,
                trip_id,
            })?;
            return Ok(TransitionOutcome::Applied);
        }
    }

    /// Moves the driver into cooldown and schedules the automatic return to
    /// available once `cooldown_ms` elapses. The scheduled task re-checks
    /// the state before applying, so a driver who went offline or busy in
    /// the meantime is not clobbered.
    pub fn complete_trip_cooldown(
        &self,
        driver: DriverId,
        cooldown_ms: u64,
        trip_id: Option<TripId>,
    ) -> Result<TransitionOutcome, StoreError> {
        let outcome = self.transition(driver, DriverState::Cooldown, trip_id)?;
        if matches!(outcome, TransitionOutcome::Rejected { .. }) {
            return Ok(outcome);
        }
        if cooldown_ms == 0 {
            return self.transition(driver, DriverState::Available, trip_id);
        }
        self.store.kv_put(
            &keys::cooldown(driver),
            &self.clock.now_ms().to_string(),
            Some(cooldown_ms),
        )?;
        self.tasks.schedule(
            self.clock.now_ms() + cooldown_ms,
            EngineTask::CooldownExpiry { driver_id: driver },
        );
        Ok(outcome)
    }

    /// Guarded cooldown expiry: only applies if the driver is still in
    /// cooldown.
    pub fn apply_cooldown_expiry(&self, driver: DriverId) -> Result<(), StoreError> {
        if self.current(driver)? != DriverState::Cooldown {
            debug!(driver_id = %driver, "cooldown expiry skipped, state moved on");
            return Ok(());
        }
        self.transition(driver, DriverState::Available, None)?;
        self.store.kv_delete(&keys::cooldown(driver))?;
        Ok(())
    }

    /// Applied transitions, most recent first.
    pub fn history(&self, driver: DriverId) -> Result<Vec<TransitionRecord>, StoreError> {
        let raw = self.store.list_range(&keys::driver_state_history(driver))?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(StoreError::from))
            .collect()
    }

    fn record(&self, driver: DriverId, record: TransitionRecord) -> Result<(), StoreError> {
        self.store.list_push_trim(
            &keys::driver_state_history(driver),
            &serde_json::to_string(&record)?,
            self.config.audit_capacity,
            Some(self.config.audit_ttl_ms),
        )
    }
}
