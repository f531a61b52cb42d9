//! Process-wide registry of live lock gates
//!
//! Gates are created on first demand and retired once nobody holds or waits
//! for them. Callers that raced with a retirement see [`Attempt::Expired`]
//! and come back here for a fresh gate.
//!
//! [`Attempt::Expired`]: crate::common::Attempt::Expired

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::backend::LockBackend;
use super::gate::LockGate;
use super::object::LockObject;
use crate::common::Result;

pub struct LockPool {
    namespace: &'static str,
    backend: Arc<dyn LockBackend>,
    gates: DashMap<String, Arc<LockGate>, ahash::RandomState>,
    retry_sleep: Duration,
    poll: Duration,
}

impl LockPool {
    pub fn new(
        namespace: &'static str,
        backend: Arc<dyn LockBackend>,
        retry_sleep: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            namespace,
            backend,
            gates: DashMap::with_hasher(ahash::RandomState::new()),
            retry_sleep,
            poll,
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Get the live gate for `key`, creating it if needed
    pub fn get_gate(&self, key: &str) -> Result<Arc<LockGate>> {
        loop {
            let existing = self.gates.get(key).map(|entry| entry.value().clone());
            let gate = match existing {
                Some(gate) => gate,
                None => {
                    let global = self.backend.global_lock(key)?;
                    let object = LockObject::new(key, global, self.retry_sleep, self.poll);
                    let poll = self.poll;
                    self.gates
                        .entry(key.to_string())
                        .or_insert_with(|| Arc::new(LockGate::new(object, poll)))
                        .value()
                        .clone()
                }
            };
            if gate.is_valid() {
                return Ok(gate);
            }
            self.gates.remove_if(key, |_, current| Arc::ptr_eq(current, &gate));
        }
    }

    /// Retire and unregister `gate` if it is idle
    pub fn release_if_idle(&self, key: &str, gate: &Arc<LockGate>) {
        if gate.retire() {
            self.gates
                .remove_if(key, |_, current| Arc::ptr_eq(current, gate));
            log::trace!("Retired {} gate '{key}'", self.namespace);
        }
    }

    /// Threads queued at the gate for `key`, zero if there is none
    pub fn queue_len(&self, key: &str) -> usize {
        self.gates.get(key).map_or(0, |gate| gate.queue_len())
    }

    /// Number of live gates
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
