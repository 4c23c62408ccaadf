pub mod gate;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use gate::PageGate;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GovernorLimits {
    pub max_concurrent: usize,
    pub max_per_key: usize,
}

impl GovernorLimits {
    pub fn new(max_concurrent: usize, max_per_key: usize) -> Self {
        Self {
            max_concurrent,
            max_per_key,
        }
    }
}

impl Default for GovernorLimits {
    fn default() -> Self {
        Self {
            max_concurrent: num_cpus::get(),
            max_per_key: 2,
        }
    }
}

/// A held admission slot. Never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct ConcurrencySlot {
    pub run_id: String,
    pub key: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GovernorStatus {
    pub active: usize,
    pub max_concurrent: usize,
    pub max_per_key: usize,
    pub per_key: HashMap<String, usize>,
    pub active_runs: Vec<String>,
    pub slots: Vec<ConcurrencySlot>,
}

#[derive(Default)]
struct Slots {
    by_run: HashMap<String, ConcurrencySlot>,
    per_key: HashMap<String, usize>,
}

/// Global and per-key admission control for runs.
///
/// Every decision happens inside one critical section, so a refused
/// `acquire` has no side effects.
pub struct ConcurrencyGovernor {
    limits: GovernorLimits,
    slots: Mutex<Slots>,
}

impl ConcurrencyGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn limits(&self) -> GovernorLimits {
        self.limits
    }

    /// Take a slot for `run_id` under `key`. Returns false when either limit
    /// is reached or the run already holds a slot.
    pub fn acquire(&self, run_id: &str, key: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        if slots.by_run.contains_key(run_id) {
            warn!(run_id = %run_id, key = %key, "Run already holds a slot");
            return false;
        }
        if slots.by_run.len() >= self.limits.max_concurrent {
            debug!(run_id = %run_id, active = slots.by_run.len(), "Global limit reached");
            return false;
        }
        let in_key = slots.per_key.get(key).copied().unwrap_or(0);
        if in_key >= self.limits.max_per_key {
            debug!(run_id = %run_id, key = %key, in_key, "Per-key limit reached");
            return false;
        }

        slots.by_run.insert(
            run_id.to_string(),
            ConcurrencySlot {
                run_id: run_id.to_string(),
                key: key.to_string(),
                acquired_at: Utc::now(),
            },
        );
        *slots.per_key.entry(key.to_string()).or_insert(0) += 1;
        info!(run_id = %run_id, key = %key, active = slots.by_run.len(), "Slot acquired");
        true
    }

    /// Give back the slot held by `run_id`. Untracked runs are a no-op.
    pub fn release(&self, run_id: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.by_run.remove(run_id) else {
            debug!(run_id = %run_id, "Release for untracked run ignored");
            return false;
        };
        if let Some(count) = slots.per_key.get_mut(&slot.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                slots.per_key.remove(&slot.key);
            }
        }
        info!(run_id = %run_id, key = %slot.key, active = slots.by_run.len(), "Slot released");
        true
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_run
            .len()
    }

    pub fn status(&self) -> GovernorStatus {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut held: Vec<ConcurrencySlot> = slots.by_run.values().cloned().collect();
        held.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        GovernorStatus {
            active: held.len(),
            max_concurrent: self.limits.max_concurrent,
            max_per_key: self.limits.max_per_key,
            per_key: slots.per_key.clone(),
            active_runs: held.iter().map(|s| s.run_id.clone()).collect(),
            slots: held,
        }
    }

    /// Drop every slot. Returns how many were held.
    pub fn force_release_all(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = slots.by_run.len();
        slots.by_run.clear();
        slots.per_key.clear();
        warn!(drained, "Force-released all concurrency slots");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_key_counter_is_removed_at_zero() {
        let governor = ConcurrencyGovernor::new(GovernorLimits::new(4, 2));
        assert!(governor.acquire("r1", "login"));
        assert!(governor.release("r1"));
        assert!(governor.status().per_key.is_empty());
    }

    #[test]
    fn same_run_cannot_hold_two_slots() {
        let governor = ConcurrencyGovernor::new(GovernorLimits::new(4, 4));
        assert!(governor.acquire("r1", "a"));
        assert!(!governor.acquire("r1", "b"));
        assert_eq!(governor.active_count(), 1);
    }
}
