//! Per-thread re-entrancy bookkeeping
//!
//! A [`LocalLockTable`] counts how many times the owning thread has entered
//! each key in each mode, so nested calls never reach the shared lock object
//! and illegal escalations are rejected before anything blocks.

use std::collections::HashMap;

use crate::common::{CoordError, LockMode, Result};

/// Nested hold counts of one thread on one key
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LocalLock {
    read_count: u32,
    write_count: u32,
    non_ex_write_count: u32,
}

impl LocalLock {
    pub fn has_read_lock(&self) -> bool {
        self.read_count > 0
    }

    pub fn has_write_lock(&self) -> bool {
        self.write_count > 0
    }

    pub fn has_non_ex_write_lock(&self) -> bool {
        self.non_ex_write_count > 0
    }

    pub fn is_held(&self) -> bool {
        self.has_read_lock() || self.has_write_lock() || self.has_non_ex_write_lock()
    }

    pub fn count(&self, mode: LockMode) -> u32 {
        match mode {
            LockMode::Read => self.read_count,
            LockMode::NonExWrite => self.non_ex_write_count,
            LockMode::Write => self.write_count,
        }
    }

    /// Whether a new hold in `mode` is satisfied by what this thread already holds.
    ///
    /// A write hold covers everything, a non-exclusive write hold covers reads.
    pub fn covers(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.is_held(),
            LockMode::NonExWrite => self.has_write_lock() || self.has_non_ex_write_lock(),
            LockMode::Write => self.has_write_lock(),
        }
    }

    /// Reject escalations that could only be satisfied by an upgrade
    pub fn check_enter(&self, mode: LockMode, namespace: &'static str, key: &str) -> Result<()> {
        let illegal = match mode {
            LockMode::Write => {
                !self.has_write_lock() && (self.has_read_lock() || self.has_non_ex_write_lock())
            }
            LockMode::NonExWrite => {
                self.has_read_lock() && !self.has_write_lock() && !self.has_non_ex_write_lock()
            }
            LockMode::Read => false,
        };
        if illegal {
            return Err(CoordError::IllegalLockSequence {
                namespace,
                key: key.to_string(),
                message: format!(
                    "cannot enter {} while holding a weaker mode",
                    mode.as_str()
                ),
            });
        }
        Ok(())
    }

    pub fn increment(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read_count += 1,
            LockMode::NonExWrite => self.non_ex_write_count += 1,
            LockMode::Write => self.write_count += 1,
        }
    }

    /// Drop one hold in `mode`; fails without change if none is held
    pub fn decrement(&mut self, mode: LockMode, namespace: &'static str, key: &str) -> Result<()> {
        let counter = match mode {
            LockMode::Read => &mut self.read_count,
            LockMode::NonExWrite => &mut self.non_ex_write_count,
            LockMode::Write => &mut self.write_count,
        };
        if *counter == 0 {
            return Err(CoordError::general(format!(
                "Can't leave {} {namespace} '{key}' that is not held",
                mode.as_str()
            )));
        }
        *counter -= 1;
        Ok(())
    }
}

/// Map of key to [`LocalLock`], owned by a single thread
#[derive(Debug, Default)]
pub struct LocalLockTable {
    locks: HashMap<String, LocalLock>,
}

impl LocalLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `key`, creating an empty one if absent
    pub fn get(&mut self, key: &str) -> &mut LocalLock {
        self.locks.entry(key.to_string()).or_default()
    }

    pub fn peek(&self, key: &str) -> Option<&LocalLock> {
        self.locks.get(key)
    }

    /// Evict the entry for `key` if it holds nothing; returns whether it was evicted
    pub fn release(&mut self, key: &str) -> bool {
        match self.locks.get(key) {
            Some(lock) if !lock.is_held() => {
                self.locks.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Keys that still hold at least one mode
    pub fn held_keys(&self) -> Vec<String> {
        self.locks
            .iter()
            .filter(|(_, lock)| lock.is_held())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_counts() {
        let mut table = LocalLockTable::new();
        table.get("k").increment(LockMode::Read);
        table.get("k").increment(LockMode::Read);
        assert_eq!(table.get("k").count(LockMode::Read), 2);

        table.get("k").decrement(LockMode::Read, "lock", "k").unwrap();
        assert!(!table.release("k"));
        table.get("k").decrement(LockMode::Read, "lock", "k").unwrap();
        assert!(table.release("k"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_write_after_read_is_illegal() {
        let mut lock = LocalLock::default();
        lock.increment(LockMode::Read);
        assert!(matches!(
            lock.check_enter(LockMode::Write, "lock", "k"),
            Err(CoordError::IllegalLockSequence { .. })
        ));
        assert!(lock.check_enter(LockMode::NonExWrite, "lock", "k").is_err());
        assert_eq!(lock.count(LockMode::Read), 1);
    }

    #[test]
    fn test_weaker_modes_nest_inside_write() {
        let mut lock = LocalLock::default();
        lock.increment(LockMode::Write);
        assert!(lock.check_enter(LockMode::Read, "lock", "k").is_ok());
        assert!(lock.check_enter(LockMode::NonExWrite, "lock", "k").is_ok());
        assert!(lock.covers(LockMode::Read));
        assert!(lock.covers(LockMode::NonExWrite));
    }

    #[test]
    fn test_write_inside_non_ex_write_is_illegal() {
        let mut lock = LocalLock::default();
        lock.increment(LockMode::NonExWrite);
        assert!(lock.check_enter(LockMode::Write, "section", "k").is_err());
        assert!(lock.check_enter(LockMode::Read, "section", "k").is_ok());
    }

    #[test]
    fn test_decrement_unheld_fails() {
        let mut lock = LocalLock::default();
        assert!(lock.decrement(LockMode::Write, "lock", "k").is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_held_keys() {
        let mut table = LocalLockTable::new();
        table.get("a").increment(LockMode::Write);
        table.get("b");
        assert_eq!(table.held_keys(), vec!["a".to_string()]);
        assert_eq!(table.len(), 2);
    }
}
