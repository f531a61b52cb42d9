//! Cross-process lock backends
//!
//! A [`LockBackend`] supplies the cross-process half of every lock (one
//! [`GlobalLock`] per key) together with the shared flag, data and active
//! marker resources the service registry and the database layer build on.

pub mod coordination;
pub mod file;
pub mod memory;

use std::time::Duration;

use crate::common::{LockMode, Result};
use crate::interrupt::Interrupt;

pub use coordination::CoordinationLockBackend;
pub use file::FileLockBackend;
pub use memory::MemoryLockBackend;

/// The cross-process state of one lock key.
///
/// A process obtains the global lock at most once per key: the pooled lock
/// object only calls `try_obtain`/`obtain` when no local thread holds the key
/// and `release` when the last local holder leaves.
pub trait GlobalLock: Send + Sync {
    /// Attempt to obtain the lock without waiting on other processes
    fn try_obtain(&self, mode: LockMode, interrupt: &Interrupt) -> Result<bool>;

    /// Obtain the lock, waiting for other processes to release it
    fn obtain(&self, mode: LockMode, interrupt: &Interrupt, retry_sleep: Duration) -> Result<()> {
        loop {
            if self.try_obtain(mode, interrupt)? {
                return Ok(());
            }
            interrupt.sleep(retry_sleep)?;
        }
    }

    /// Give the lock back to other processes
    fn release(&self, mode: LockMode, interrupt: &Interrupt) -> Result<()>;
}

/// Shared resources visible to every process using the same backend
pub trait LockBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn global_lock(&self, key: &str) -> Result<Box<dyn GlobalLock>>;

    fn set_flag(&self, name: &str) -> Result<()>;

    fn clear_flag(&self, name: &str) -> Result<()>;

    fn check_flag(&self, name: &str) -> Result<bool>;

    /// Read a datum; `None` if it was never written or has been deleted.
    ///
    /// Reads and writes are not atomic with respect to each other, callers
    /// guard them with a lock.
    fn read_data(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write a datum; `None` deletes it
    fn write_data(&self, name: &str, data: Option<&[u8]>) -> Result<()>;

    /// Create a marker that disappears when this process dies
    fn set_active(&self, name: &str) -> Result<()>;

    fn clear_active(&self, name: &str) -> Result<()>;

    fn check_active(&self, name: &str) -> Result<bool>;

    /// Refresh liveness of markers owned by this process
    fn heartbeat(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Global lock for backends where the in-process lock object already excludes everyone
#[derive(Debug, Default)]
pub struct ProcessLocalLock;

impl GlobalLock for ProcessLocalLock {
    fn try_obtain(&self, _mode: LockMode, _interrupt: &Interrupt) -> Result<bool> {
        Ok(true)
    }

    fn release(&self, _mode: LockMode, _interrupt: &Interrupt) -> Result<()> {
        Ok(())
    }
}

/// Escape characters that cannot appear in a file or node name as `&<code>!`
pub fn safe_name(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(
            ch,
            '/' | '"' | '\\' | '|' | '+' | ',' | ':' | ';' | '<' | '>' | '=' | '[' | ']' | '&'
        ) || (ch as u32) < 0x20
        {
            escaped.push('&');
            escaped.push_str(&(ch as u32).to_string());
            escaped.push('!');
        } else {
            escaped.push(ch);
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_name_escapes_separators() {
        assert_eq!(safe_name("plain-key_1"), "plain-key_1");
        assert_eq!(safe_name("a/b"), "a&47!b");
        assert_eq!(safe_name("x&y"), "x&38!y");
        assert_eq!(safe_name("tab\there"), "tab&9!here");
    }

    #[test]
    fn test_process_local_lock_always_obtains() {
        let lock = ProcessLocalLock;
        let interrupt = Interrupt::new();
        assert!(lock.try_obtain(LockMode::Write, &interrupt).unwrap());
        lock.obtain(LockMode::Read, &interrupt, Duration::from_millis(1))
            .unwrap();
        lock.release(LockMode::Write, &interrupt).unwrap();
    }
}
