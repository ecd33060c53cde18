//! Deferred engine work.
//!
//! Dispatch rounds, cooldowns, and scheduled trips all need something to
//! happen later. The engine does not own a timer thread; it keeps due work
//! in a min-heap ordered by fire time and the host's timer drains it via
//! [`DispatchEngine::run_due`](crate::engine::DispatchEngine::run_due).
//! Every task re-checks its guard when it fires (round still current, state
//! still cooldown, trip still requested), so a task that raced a state
//! change is a no-op rather than a clobber.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use crate::ids::{DriverId, TripId};

/// Work the engine deferred to a future time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTask {
    /// A notification round's expiry: time the trip out if nobody accepted.
    DispatchTimeout { trip_id: TripId },
    /// A sequential round's expiry: advance to the next candidate.
    SequentialAdvance { trip_id: TripId, round: u32 },
    /// End of a post-trip cooldown: return the driver to available.
    CooldownExpiry { driver_id: DriverId },
    /// A scheduled trip's dispatch time arrived: run matching now.
    ScheduledDispatch { trip_id: TripId },
}

#[derive(Debug)]
struct Entry {
    fire_at_ms: u64,
    seq: u64,
    task: EngineTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ms == other.fire_at_ms && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by fire time;
        // insertion order breaks ties.
        other
            .fire_at_ms
            .cmp(&self.fire_at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of deferred tasks.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, fire_at_ms: u64, task: EngineTask) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            fire_at_ms,
            seq,
            task,
        });
    }

    /// Pops the next task due at or before `now`, earliest first.
    pub fn pop_due(&self, now_ms: u64) -> Option<EngineTask> {
        let mut state = self.inner.lock().ok()?;
        if state.heap.peek()?.fire_at_ms > now_ms {
            return None;
        }
        state.heap.pop().map(|e| e.task)
    }

    /// Fire time of the next pending task, if any.
    pub fn next_fire_at_ms(&self) -> Option<u64> {
        let state = self.inner.lock().ok()?;
        state.heap.peek().map(|e| e.fire_at_ms)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.heap.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
