//! Backpressure gate shared by every call into one rate-limit domain.
//!
//! The gate is a single timestamp: calls may proceed once the wall clock has
//! passed it. The default (epoch) always proceeds. It is cooperative rate
//! limiting, so a racy read next to a concurrent write is acceptable; the lock
//! only keeps individual reads and writes whole.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Default)]
pub struct BackpressureGate {
    not_before: RwLock<DateTime<Utc>>,
}

impl BackpressureGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no cooldown is active.
    pub fn can_proceed(&self) -> bool {
        self.can_proceed_at(Utc::now())
    }

    pub fn can_proceed_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.retry_after()
    }

    /// Close the gate until `t`. Never moves an existing cooldown earlier.
    pub fn not_before(&self, t: DateTime<Utc>) {
        let mut guard = self
            .not_before
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if t > *guard {
            debug!(retry_at = %t, "Backpressure gate closed");
            *guard = t;
        }
    }

    /// Earliest time calls may resume.
    pub fn retry_after(&self) -> DateTime<Utc> {
        *self
            .not_before
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Key of one rate-limit domain: the subscription plus the identity calling it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GateKey {
    pub subscription_id: String,
    pub principal: String,
}

/// Process-wide table of gates, one per rate-limit domain.
///
/// The map lock is held only for the lookup, never across I/O.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: Mutex<HashMap<GateKey, Arc<BackpressureGate>>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate for `key`, created open on first use.
    pub fn gate(&self, key: &GateKey) -> Arc<BackpressureGate> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(BackpressureGate::new()))
            .clone()
    }

    /// Drop gates no client holds anymore, unless they are still cooling down.
    pub fn prune(&self) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.retain(|_, gate| Arc::strong_count(gate) > 1 || !gate.can_proceed());
    }

    pub fn count(&self) -> usize {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
