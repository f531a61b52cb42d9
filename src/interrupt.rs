//! Cooperative cancellation
//!
//! Every wait point in the lock and database layers checks an [`Interrupt`]
//! and unwinds with [`CoordError::Interrupted`] once it has been triggered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::common::{CoordError, Result};

#[derive(Debug, Default)]
struct InterruptInner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// Cloneable cancellation token; all clones observe the same signal
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every holder of this token and wake interruptible sleeps
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.wakeup.notify_all();
    }

    /// Re-arm the token after an interrupt has been handled
    pub fn clear(&self) {
        self.inner.triggered.store(false, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Fail with `Interrupted` if the token has been triggered
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(CoordError::interrupted("operation cancelled"))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless interrupted first
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.lock.lock();
        loop {
            self.check()?;
            if self
                .inner
                .wakeup
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        drop(guard);
        self.check()
    }
}
