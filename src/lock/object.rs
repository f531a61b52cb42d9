//! Per-key lock object shared by every thread of the process
//!
//! The object counts how many local threads hold the key in each mode and
//! talks to the backend's [`GlobalLock`] only on the transitions from and to
//! "not held by this process".

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::backend::GlobalLock;
use crate::common::{Attempt, Contention, CoordError, LockMode, Result};
use crate::interrupt::Interrupt;

#[derive(Debug)]
struct ObjectState {
    valid: bool,
    write: bool,
    non_ex_write: u32,
    read: u32,
    /// A thread is obtaining the global lock with the state mutex released
    acquiring: bool,
}

impl ObjectState {
    fn is_free(&self) -> bool {
        !self.write && self.non_ex_write == 0 && self.read == 0 && !self.acquiring
    }

    /// Whether another local thread's hold prevents entering `mode`
    fn conflicts(&self, mode: LockMode) -> bool {
        if self.acquiring {
            return true;
        }
        match mode {
            LockMode::Write => self.write || self.non_ex_write > 0 || self.read > 0,
            LockMode::NonExWrite => self.write || self.read > 0,
            LockMode::Read => self.write || self.non_ex_write > 0,
        }
    }

    /// Whether the process already holds the global lock in `mode`
    fn shares(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.read > 0,
            LockMode::NonExWrite => self.non_ex_write > 0,
            LockMode::Write => false,
        }
    }

    fn holders(&self, mode: LockMode) -> u32 {
        match mode {
            LockMode::Read => self.read,
            LockMode::NonExWrite => self.non_ex_write,
            LockMode::Write => u32::from(self.write),
        }
    }

    fn add(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read += 1,
            LockMode::NonExWrite => self.non_ex_write += 1,
            LockMode::Write => self.write = true,
        }
    }

    fn remove(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.read -= 1,
            LockMode::NonExWrite => self.non_ex_write -= 1,
            LockMode::Write => self.write = false,
        }
    }
}

pub struct LockObject {
    key: String,
    global: Box<dyn GlobalLock>,
    state: Mutex<ObjectState>,
    changed: Condvar,
    retry_sleep: Duration,
    poll: Duration,
}

impl LockObject {
    pub fn new(
        key: impl Into<String>,
        global: Box<dyn GlobalLock>,
        retry_sleep: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            global,
            state: Mutex::new(ObjectState {
                valid: true,
                write: false,
                non_ex_write: 0,
                read: 0,
                acquiring: false,
            }),
            changed: Condvar::new(),
            retry_sleep,
            poll,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enter `mode` if possible right now
    pub fn try_enter(&self, mode: LockMode, interrupt: &Interrupt) -> Result<Attempt> {
        let mut state = self.state.lock();
        if !state.valid {
            return Ok(Attempt::Expired);
        }
        if state.conflicts(mode) {
            return Ok(Attempt::WouldBlock(Contention::Local));
        }
        if !state.shares(mode) && !self.global.try_obtain(mode, interrupt)? {
            return Ok(Attempt::WouldBlock(Contention::Remote));
        }
        state.add(mode);
        Ok(Attempt::Acquired)
    }

    /// Enter `mode`, waiting for local and remote holders to leave
    pub fn enter(&self, mode: LockMode, interrupt: &Interrupt) -> Result<Attempt> {
        let mut state = self.state.lock();
        loop {
            if !state.valid {
                return Ok(Attempt::Expired);
            }
            if !state.conflicts(mode) {
                break;
            }
            self.changed.wait_for(&mut state, self.poll);
            interrupt.check()?;
        }

        if state.shares(mode) {
            state.add(mode);
            return Ok(Attempt::Acquired);
        }

        state.acquiring = true;
        let obtained = MutexGuard::unlocked(&mut state, || {
            self.global.obtain(mode, interrupt, self.retry_sleep)
        });
        state.acquiring = false;
        if obtained.is_ok() {
            state.add(mode);
        }
        self.changed.notify_all();
        obtained.map(|_| Attempt::Acquired)
    }

    /// Leave `mode`; the last local holder releases the global lock.
    ///
    /// The hold is dropped even when the global release fails, e.g. with
    /// `LockLost`; the error is still returned.
    pub fn leave(&self, mode: LockMode, interrupt: &Interrupt) -> Result<()> {
        let mut state = self.state.lock();
        let released = match state.holders(mode) {
            0 => {
                return Err(CoordError::general(format!(
                    "lock '{}' is not held in {} mode by this process",
                    self.key,
                    mode.as_str()
                )));
            }
            1 => self.global.release(mode, interrupt),
            _ => Ok(()),
        };
        state.remove(mode);
        self.changed.notify_all();
        released
    }

    /// Mark the object expired if no thread holds or is obtaining it
    pub fn invalidate_if_free(&self) -> bool {
        let mut state = self.state.lock();
        if state.valid && state.is_free() {
            state.valid = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::backend::ProcessLocalLock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;

    /// Global lock that refuses while `busy` is set and counts transitions
    #[derive(Default)]
    struct ScriptedGlobal {
        busy: Arc<AtomicBool>,
        lose_on_release: Arc<AtomicBool>,
        obtained: Arc<AtomicU32>,
        released: Arc<AtomicU32>,
    }

    impl GlobalLock for ScriptedGlobal {
        fn try_obtain(&self, _mode: LockMode, _interrupt: &Interrupt) -> Result<bool> {
            if self.busy.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.obtained.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        fn release(&self, _mode: LockMode, _interrupt: &Interrupt) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.lose_on_release.load(Ordering::SeqCst) {
                return Err(CoordError::LockLost {
                    key: "k".to_string(),
                    message: "session expired".to_string(),
                });
            }
            Ok(())
        }
    }

    fn object(global: Box<dyn GlobalLock>) -> LockObject {
        LockObject::new("k", global, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_readers_share_one_global_hold() {
        let global = ScriptedGlobal::default();
        let obtained = global.obtained.clone();
        let released = global.released.clone();
        let object = object(Box::new(global));
        let interrupt = Interrupt::new();

        assert_eq!(object.enter(LockMode::Read, &interrupt).unwrap(), Attempt::Acquired);
        assert_eq!(object.try_enter(LockMode::Read, &interrupt).unwrap(), Attempt::Acquired);
        assert_eq!(obtained.load(Ordering::SeqCst), 1);

        object.leave(LockMode::Read, &interrupt).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        object.leave(LockMode::Read, &interrupt).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_and_remote_contention() {
        let global = ScriptedGlobal::default();
        let busy = global.busy.clone();
        let object = object(Box::new(global));
        let interrupt = Interrupt::new();

        object.enter(LockMode::Write, &interrupt).unwrap();
        assert_eq!(
            object.try_enter(LockMode::Read, &interrupt).unwrap(),
            Attempt::WouldBlock(Contention::Local)
        );
        object.leave(LockMode::Write, &interrupt).unwrap();

        busy.store(true, Ordering::SeqCst);
        assert_eq!(
            object.try_enter(LockMode::Write, &interrupt).unwrap(),
            Attempt::WouldBlock(Contention::Remote)
        );
    }

    #[test]
    fn test_enter_waits_for_remote_release() {
        let global = ScriptedGlobal::default();
        let busy = global.busy.clone();
        busy.store(true, Ordering::SeqCst);
        let object = Arc::new(object(Box::new(global)));

        let waiter = {
            let object = object.clone();
            thread::spawn(move || object.enter(LockMode::Write, &Interrupt::new()))
        };
        thread::sleep(Duration::from_millis(20));
        busy.store(false, Ordering::SeqCst);
        assert_eq!(waiter.join().unwrap().unwrap(), Attempt::Acquired);
    }

    #[test]
    fn test_interrupt_while_waiting_locally() {
        let object = Arc::new(object(Box::new(ProcessLocalLock)));
        let interrupt = Interrupt::new();
        object.enter(LockMode::Write, &interrupt).unwrap();

        let cancel = Interrupt::new();
        let waiter = {
            let object = object.clone();
            let cancel = cancel.clone();
            thread::spawn(move || object.enter(LockMode::Read, &cancel))
        };
        thread::sleep(Duration::from_millis(20));
        cancel.trigger();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(CoordError::Interrupted { .. })
        ));
        object.leave(LockMode::Write, &interrupt).unwrap();
        assert!(object.invalidate_if_free());
    }

    #[test]
    fn test_expired_object() {
        let object = object(Box::new(ProcessLocalLock));
        let interrupt = Interrupt::new();
        object.enter(LockMode::Read, &interrupt).unwrap();
        assert!(!object.invalidate_if_free());
        object.leave(LockMode::Read, &interrupt).unwrap();
        assert!(object.invalidate_if_free());
        assert_eq!(object.enter(LockMode::Read, &interrupt).unwrap(), Attempt::Expired);
        assert_eq!(object.try_enter(LockMode::Write, &interrupt).unwrap(), Attempt::Expired);
    }

    #[test]
    fn test_lost_release_still_drops_hold() {
        let global = ScriptedGlobal::default();
        let lose = global.lose_on_release.clone();
        let object = object(Box::new(global));
        let interrupt = Interrupt::new();

        object.enter(LockMode::Write, &interrupt).unwrap();
        lose.store(true, Ordering::SeqCst);
        assert!(matches!(
            object.leave(LockMode::Write, &interrupt),
            Err(CoordError::LockLost { .. })
        ));

        lose.store(false, Ordering::SeqCst);
        assert_eq!(object.try_enter(LockMode::Read, &interrupt).unwrap(), Attempt::Acquired);
        object.leave(LockMode::Read, &interrupt).unwrap();
        assert!(object.invalidate_if_free());
    }

    #[test]
    fn test_leave_unheld_mode_fails() {
        let object = object(Box::new(ProcessLocalLock));
        assert!(object.leave(LockMode::NonExWrite, &Interrupt::new()).is_err());
    }
}
