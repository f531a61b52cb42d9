//! Coordination service backend
//!
//! Each lock request creates an ephemeral sequential child (`read-`,
//! `nonexwrite-` or `write-`) under `<root>/locks/<key>`. A request is granted
//! once no lower-numbered sibling has a conflicting mode; until then it
//! watches the nearest such sibling and re-evaluates when that node goes away.
//! Grants are therefore FIFO by sequence number across processes.
//!
//! A request node that vanishes with an expired session is never re-created.
//! A queued request simply queues again at the back; a granted one is lost
//! and its release reports [`CoordError::LockLost`]. Once the last request
//! under a key is gone the key's parent node is pruned.
//!
//! Flags and data are persistent nodes, active markers are ephemeral nodes
//! that vanish with the session of the process that created them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{GlobalLock, LockBackend, safe_name};
use crate::common::{CoordError, LockMode, Result};
use crate::coordination::client::{CreateMode, join_path, split_path};
use crate::coordination::session::CoordinationSession;
use crate::interrupt::Interrupt;

const READ_PREFIX: &str = "read-";
const NON_EX_WRITE_PREFIX: &str = "nonexwrite-";
const WRITE_PREFIX: &str = "write-";

fn mode_prefix(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Read => READ_PREFIX,
        LockMode::NonExWrite => NON_EX_WRITE_PREFIX,
        LockMode::Write => WRITE_PREFIX,
    }
}

/// Mode and sequence number of a request node name
fn parse_request(name: &str) -> Option<(LockMode, u64)> {
    let (mode, rest) = if let Some(rest) = name.strip_prefix(WRITE_PREFIX) {
        (LockMode::Write, rest)
    } else if let Some(rest) = name.strip_prefix(NON_EX_WRITE_PREFIX) {
        (LockMode::NonExWrite, rest)
    } else if let Some(rest) = name.strip_prefix(READ_PREFIX) {
        (LockMode::Read, rest)
    } else {
        return None;
    };
    rest.parse().ok().map(|sequence| (mode, sequence))
}

fn conflicts(requested: LockMode, existing: LockMode) -> bool {
    matches!(
        (requested, existing),
        (LockMode::Write, _)
            | (_, LockMode::Write)
            | (LockMode::Read, LockMode::NonExWrite)
            | (LockMode::NonExWrite, LockMode::Read)
    )
}

/// The nearest lower-numbered sibling whose mode conflicts with `mode`
fn find_blocker(children: &[String], sequence: u64, mode: LockMode) -> Option<String> {
    children
        .iter()
        .filter_map(|name| parse_request(name).map(|(m, s)| (name, m, s)))
        .filter(|(_, m, s)| *s < sequence && conflicts(mode, *m))
        .max_by_key(|(_, _, s)| *s)
        .map(|(name, _, _)| name.clone())
}

/// One-shot signal opened by a watch callback
#[derive(Default)]
struct Latch {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn open(&self) {
        *self.opened.lock() = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout`; returns whether the latch is open
    fn wait(&self, timeout: Duration) -> bool {
        let mut opened = self.opened.lock();
        if !*opened {
            self.cond.wait_for(&mut opened, timeout);
        }
        *opened
    }
}

pub struct CoordinationGlobalLock {
    session: Arc<CoordinationSession>,
    lock_path: String,
    poll: Duration,
    /// Request node granted to this process
    held: Mutex<Option<String>>,
}

impl CoordinationGlobalLock {
    fn create_request(&self, mode: LockMode) -> Result<(String, u64)> {
        let prefix = join_path(&self.lock_path, mode_prefix(mode));
        let path = self
            .session
            .create(&prefix, b"", CreateMode::EphemeralSequential)?
            .ok_or_else(|| CoordError::general(format!("sequential node '{prefix}' collided")))?;
        let sequence = parse_request(split_path(&path).1)
            .map(|(_, sequence)| sequence)
            .ok_or_else(|| CoordError::general(format!("unexpected request node '{path}'")))?;
        Ok((path, sequence))
    }

    fn abandon(&self, path: &str) {
        if let Err(e) = self.session.delete(path) {
            log::warn!("Failed to withdraw lock request '{path}': {e}");
        }
        self.prune();
    }

    /// Remove the key's parent node if no request is left under it
    fn prune(&self) {
        match self.session.delete_if_empty(&self.lock_path) {
            Ok(true) => log::debug!("Pruned idle lock node '{}'", self.lock_path),
            Ok(false) => {}
            Err(e) => log::warn!("Failed to prune lock node '{}': {e}", self.lock_path),
        }
    }

    /// Current blocker of our request, or `None` once it is granted
    fn blocker(&self, path: &str, sequence: u64, mode: LockMode) -> Result<Option<String>> {
        let children = self.session.get_children(&self.lock_path)?;
        let own = split_path(path).1;
        if !children.iter().any(|child| child == own) {
            return Err(CoordError::LockLost {
                key: path.to_string(),
                message: "lock request node disappeared while queued".to_string(),
            });
        }
        Ok(find_blocker(&children, sequence, mode))
    }

    fn wait_for_turn(
        &self,
        path: &str,
        sequence: u64,
        mode: LockMode,
        interrupt: &Interrupt,
    ) -> Result<()> {
        loop {
            interrupt.check()?;
            let generation = self.session.generation();
            let Some(blocker) = self.blocker(path, sequence, mode)? else {
                return Ok(());
            };
            let blocker_path = join_path(&self.lock_path, &blocker);
            let latch = Arc::new(Latch::default());
            let signal = latch.clone();
            if !self
                .session
                .exists(&blocker_path, Some(Box::new(move |_| signal.open())))?
            {
                continue;
            }
            log::debug!("Lock request '{path}' waiting on '{blocker_path}'");
            while !latch.wait(self.poll) {
                interrupt.check()?;
                if self.session.generation() != generation {
                    break;
                }
            }
        }
    }
}

impl GlobalLock for CoordinationGlobalLock {
    fn try_obtain(&self, mode: LockMode, interrupt: &Interrupt) -> Result<bool> {
        interrupt.check()?;
        let generation = self.session.generation();
        let (path, sequence) = self.create_request(mode)?;
        match self.blocker(&path, sequence, mode) {
            Ok(None) if self.session.generation() == generation => {
                *self.held.lock() = Some(path);
                Ok(true)
            }
            Ok(_) => {
                // blocked, or the session was replaced while deciding
                self.abandon(&path);
                Ok(false)
            }
            Err(CoordError::LockLost { .. }) if self.session.take_lost(&path) => {
                self.prune();
                Ok(false)
            }
            Err(e) => {
                self.abandon(&path);
                Err(e)
            }
        }
    }

    fn obtain(&self, mode: LockMode, interrupt: &Interrupt, _retry_sleep: Duration) -> Result<()> {
        loop {
            let (path, sequence) = self.create_request(mode)?;
            match self.wait_for_turn(&path, sequence, mode, interrupt) {
                Ok(()) => {
                    *self.held.lock() = Some(path);
                    return Ok(());
                }
                // still queued when the session expired: nothing was granted yet
                Err(CoordError::LockLost { .. }) if self.session.take_lost(&path) => {
                    log::warn!("Lock request '{path}' expired while queued, queueing again");
                }
                Err(e) => {
                    self.abandon(&path);
                    return Err(e);
                }
            }
        }
    }

    fn release(&self, mode: LockMode, _interrupt: &Interrupt) -> Result<()> {
        let Some(path) = self.held.lock().take() else {
            return Err(CoordError::general(format!(
                "no {} request held under '{}'",
                mode.as_str(),
                self.lock_path
            )));
        };
        if self.session.take_lost(&path) {
            self.prune();
            return Err(CoordError::LockLost {
                key: path,
                message: "lock was lost with an expired session before release".to_string(),
            });
        }
        self.session.delete(&path)?;
        self.prune();
        Ok(())
    }
}

/// Backend built on a [`CoordinationSession`]
pub struct CoordinationLockBackend {
    session: Arc<CoordinationSession>,
    root: String,
    poll: Duration,
}

impl CoordinationLockBackend {
    pub fn new(session: Arc<CoordinationSession>, root: &str, poll: Duration) -> Result<Self> {
        let root = root.trim_end_matches('/').to_string();
        for area in ["locks", "flags", "data", "active"] {
            session.ensure_path(&format!("{root}/{area}"))?;
        }
        log::info!("Coordination lock backend rooted at '{root}'");
        Ok(Self {
            session,
            root,
            poll,
        })
    }

    pub fn session(&self) -> &Arc<CoordinationSession> {
        &self.session
    }

    fn path(&self, area: &str, name: &str) -> String {
        format!("{}/{area}/{}", self.root, safe_name(name))
    }
}

impl LockBackend for CoordinationLockBackend {
    fn name(&self) -> &'static str {
        "coordination"
    }

    fn global_lock(&self, key: &str) -> Result<Box<dyn GlobalLock>> {
        Ok(Box::new(CoordinationGlobalLock {
            session: self.session.clone(),
            lock_path: self.path("locks", key),
            poll: self.poll,
            held: Mutex::new(None),
        }))
    }

    fn set_flag(&self, name: &str) -> Result<()> {
        self.session
            .create(&self.path("flags", name), b"", CreateMode::Persistent)?;
        Ok(())
    }

    fn clear_flag(&self, name: &str) -> Result<()> {
        self.session.delete(&self.path("flags", name))?;
        Ok(())
    }

    fn check_flag(&self, name: &str) -> Result<bool> {
        self.session.exists(&self.path("flags", name), None)
    }

    fn read_data(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.session.get_data(&self.path("data", name))
    }

    fn write_data(&self, name: &str, data: Option<&[u8]>) -> Result<()> {
        let path = self.path("data", name);
        match data {
            None => {
                self.session.delete(&path)?;
            }
            Some(bytes) => {
                if !self.session.set_data(&path, bytes)?
                    && self
                        .session
                        .create(&path, bytes, CreateMode::Persistent)?
                        .is_none()
                {
                    self.session.set_data(&path, bytes)?;
                }
            }
        }
        Ok(())
    }

    fn set_active(&self, name: &str) -> Result<()> {
        let path = self.path("active", name);
        match self.session.create(&path, b"", CreateMode::Ephemeral)? {
            Some(_) => Ok(()),
            None if self.session.owns(&path) => Ok(()),
            None => Err(CoordError::general(format!(
                "active marker '{name}' is held by another member"
            ))),
        }
    }

    fn clear_active(&self, name: &str) -> Result<()> {
        self.session.delete(&self.path("active", name))?;
        Ok(())
    }

    fn check_active(&self, name: &str) -> Result<bool> {
        self.session.exists(&self.path("active", name), None)
    }

    /// Touch the service so a lost session is noticed and repaired.
    ///
    /// Fails with `LockLost` while a granted lock that vanished with an
    /// expired session has not been released yet.
    fn heartbeat(&self) -> Result<()> {
        self.session.exists(&self.root, None)?;
        let lost = self.session.lost_nodes();
        if lost.is_empty() {
            return Ok(());
        }
        Err(CoordError::LockLost {
            key: lost.join(", "),
            message: "held lock requests expired with the session".to_string(),
        })
    }

    fn shutdown(&self) -> Result<()> {
        self.session.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryCoordinator;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn backend(coordinator: &MemoryCoordinator) -> CoordinationLockBackend {
        let session = CoordinationSession::connect(
            Arc::new(coordinator.clone()),
            Duration::from_secs(30),
        )
        .unwrap();
        CoordinationLockBackend::new(Arc::new(session), "/coordkit", Duration::from_millis(10))
            .unwrap()
    }

    #[test]
    fn test_find_blocker() {
        let children: Vec<String> = ["read-0000000001", "write-0000000002", "read-0000000003"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(find_blocker(&children, 3, LockMode::Read), Some("write-0000000002".to_string()));
        assert_eq!(find_blocker(&children, 2, LockMode::Write), Some("read-0000000001".to_string()));
        assert_eq!(find_blocker(&children, 1, LockMode::Read), None);
        assert_eq!(find_blocker(&children, 4, LockMode::NonExWrite), Some("read-0000000003".to_string()));
    }

    #[test]
    fn test_conflict_rules() {
        assert!(conflicts(LockMode::Write, LockMode::Read));
        assert!(conflicts(LockMode::NonExWrite, LockMode::Read));
        assert!(!conflicts(LockMode::NonExWrite, LockMode::NonExWrite));
        assert!(!conflicts(LockMode::Read, LockMode::Read));
        assert!(conflicts(LockMode::Read, LockMode::NonExWrite));
    }

    #[test]
    fn test_try_obtain_between_members() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = backend(&coordinator);
        let interrupt = Interrupt::new();

        let a = first.global_lock("k").unwrap();
        let b = second.global_lock("k").unwrap();
        assert!(a.try_obtain(LockMode::NonExWrite, &interrupt).unwrap());
        assert!(b.try_obtain(LockMode::NonExWrite, &interrupt).unwrap());
        b.release(LockMode::NonExWrite, &interrupt).unwrap();
        assert!(!b.try_obtain(LockMode::Read, &interrupt).unwrap());
        // the refused request leaves no node behind
        assert_eq!(coordinator.children("/coordkit/locks/k").len(), 1);

        a.release(LockMode::NonExWrite, &interrupt).unwrap();
        assert!(b.try_obtain(LockMode::Write, &interrupt).unwrap());
    }

    #[test]
    fn test_blocking_obtain_waits_for_watch() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = backend(&coordinator);
        let interrupt = Interrupt::new();

        let a = first.global_lock("k").unwrap();
        assert!(a.try_obtain(LockMode::Write, &interrupt).unwrap());

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        let waiter = thread::spawn(move || {
            let b = second.global_lock("k").unwrap();
            b.obtain(LockMode::Read, &Interrupt::new(), Duration::from_millis(1))
                .unwrap();
            flag.store(true, Ordering::SeqCst);
            b.release(LockMode::Read, &Interrupt::new()).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        a.release(LockMode::Write, &interrupt).unwrap();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_interrupted_wait_withdraws_request() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = backend(&coordinator);
        let interrupt = Interrupt::new();

        let a = first.global_lock("k").unwrap();
        assert!(a.try_obtain(LockMode::Write, &interrupt).unwrap());

        let cancel = Interrupt::new();
        let remote = cancel.clone();
        let waiter = thread::spawn(move || {
            let b = second.global_lock("k").unwrap();
            b.obtain(LockMode::Write, &remote, Duration::from_millis(1))
        });
        thread::sleep(Duration::from_millis(30));
        cancel.trigger();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(CoordError::Interrupted { .. })));
        assert_eq!(coordinator.children("/coordkit/locks/k").len(), 1);
    }

    #[test]
    fn test_session_expiry_loses_held_lock() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = backend(&coordinator);
        let interrupt = Interrupt::new();

        let a = first.global_lock("k").unwrap();
        assert!(a.try_obtain(LockMode::Write, &interrupt).unwrap());

        coordinator.expire_session(first.session().session_id());
        assert!(matches!(
            first.heartbeat(),
            Err(CoordError::LockLost { .. })
        ));
        // the expired request is not resurrected
        assert!(coordinator.children("/coordkit/locks/k").is_empty());

        let b = second.global_lock("k").unwrap();
        assert!(b.try_obtain(LockMode::Write, &interrupt).unwrap());
        assert!(matches!(
            a.release(LockMode::Write, &interrupt),
            Err(CoordError::LockLost { .. })
        ));
        first.heartbeat().unwrap();
        assert_eq!(coordinator.children("/coordkit/locks/k").len(), 1);
        b.release(LockMode::Write, &interrupt).unwrap();
    }

    #[test]
    fn test_queued_request_requeues_after_expiry() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = Arc::new(backend(&coordinator));
        let interrupt = Interrupt::new();

        let a = first.global_lock("k").unwrap();
        assert!(a.try_obtain(LockMode::Write, &interrupt).unwrap());

        let waiting = second.clone();
        let waiter = thread::spawn(move || {
            let b = waiting.global_lock("k").unwrap();
            b.obtain(LockMode::Write, &Interrupt::new(), Duration::from_millis(1))
                .unwrap();
            b.release(LockMode::Write, &Interrupt::new()).unwrap();
        });
        while coordinator.children("/coordkit/locks/k").len() < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        coordinator.expire_session(second.session().session_id());
        thread::sleep(Duration::from_millis(50));
        // requeued behind the holder, not granted
        assert_eq!(coordinator.children("/coordkit/locks/k").len(), 2);

        a.release(LockMode::Write, &interrupt).unwrap();
        waiter.join().unwrap();
        assert!(!coordinator.node_exists("/coordkit/locks/k"));
    }

    #[test]
    fn test_idle_lock_node_is_pruned() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = backend(&coordinator);
        let interrupt = Interrupt::new();

        let a = first.global_lock("k").unwrap();
        let b = second.global_lock("k").unwrap();
        assert!(a.try_obtain(LockMode::Read, &interrupt).unwrap());
        assert!(b.try_obtain(LockMode::Read, &interrupt).unwrap());
        a.release(LockMode::Read, &interrupt).unwrap();
        assert!(coordinator.node_exists("/coordkit/locks/k"));

        b.release(LockMode::Read, &interrupt).unwrap();
        assert!(!coordinator.node_exists("/coordkit/locks/k"));
        assert!(coordinator.node_exists("/coordkit/locks"));

        // the key is usable again afterwards
        assert!(a.try_obtain(LockMode::Write, &interrupt).unwrap());
        a.release(LockMode::Write, &interrupt).unwrap();
    }

    #[test]
    fn test_active_markers_follow_session() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = backend(&coordinator);

        first.set_active("svc").unwrap();
        first.set_active("svc").unwrap();
        assert!(second.check_active("svc").unwrap());
        assert!(second.set_active("svc").is_err());

        first.shutdown().unwrap();
        assert!(!second.check_active("svc").unwrap());
    }

    #[test]
    fn test_flags_and_data() {
        let coordinator = MemoryCoordinator::new();
        let first = backend(&coordinator);
        let second = backend(&coordinator);

        first.set_flag("f").unwrap();
        first.set_flag("f").unwrap();
        assert!(second.check_flag("f").unwrap());
        second.clear_flag("f").unwrap();
        assert!(!first.check_flag("f").unwrap());

        first.write_data("d/1", Some(&b"one"[..])).unwrap();
        first.write_data("d/1", Some(&b"two"[..])).unwrap();
        assert_eq!(second.read_data("d/1").unwrap(), Some(b"two".to_vec()));
        second.write_data("d/1", None).unwrap();
        assert_eq!(first.read_data("d/1").unwrap(), None);
    }
}
