//! Single-process backend
//!
//! Locks never leave the process, so the pooled lock objects provide all the
//! exclusion; flags, data and active markers live in concurrent maps.

use dashmap::{DashMap, DashSet};

use super::{GlobalLock, LockBackend, ProcessLocalLock};
use crate::common::Result;

#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    flags: DashSet<String, ahash::RandomState>,
    data: DashMap<String, Vec<u8>, ahash::RandomState>,
    active: DashSet<String, ahash::RandomState>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockBackend for MemoryLockBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn global_lock(&self, _key: &str) -> Result<Box<dyn GlobalLock>> {
        Ok(Box::new(ProcessLocalLock))
    }

    fn set_flag(&self, name: &str) -> Result<()> {
        self.flags.insert(name.to_string());
        Ok(())
    }

    fn clear_flag(&self, name: &str) -> Result<()> {
        self.flags.remove(name);
        Ok(())
    }

    fn check_flag(&self, name: &str) -> Result<bool> {
        Ok(self.flags.contains(name))
    }

    fn read_data(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(name).map(|entry| entry.value().clone()))
    }

    fn write_data(&self, name: &str, data: Option<&[u8]>) -> Result<()> {
        match data {
            Some(bytes) => {
                self.data.insert(name.to_string(), bytes.to_vec());
            }
            None => {
                self.data.remove(name);
            }
        }
        Ok(())
    }

    fn set_active(&self, name: &str) -> Result<()> {
        self.active.insert(name.to_string());
        Ok(())
    }

    fn clear_active(&self, name: &str) -> Result<()> {
        self.active.remove(name);
        Ok(())
    }

    fn check_active(&self, name: &str) -> Result<bool> {
        Ok(self.active.contains(name))
    }
}
