//! Lock manager facade
//!
//! [`LockService`] is the process-wide part: the chosen backend plus the two
//! gate pools (cross-process locks and process-local critical sections).
//! [`LockManager`] is the per-thread part: it owns the thread's re-entrancy
//! tables and interrupt token and exposes the public lock API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::backend::{
    CoordinationLockBackend, FileLockBackend, LockBackend, MemoryLockBackend,
};
use super::local::LocalLockTable;
use super::pool::LockPool;
use crate::common::{Attempt, Config, CoordError, LockBackendKind, LockMode, Result};
use crate::coordination::{Connector, CoordinationSession};
use crate::interrupt::Interrupt;
use crate::metrics::{SharedMetricsCollector, new_shared_metrics_collector};

pub(crate) const LOCK_NAMESPACE: &str = "lock";
pub(crate) const SECTION_NAMESPACE: &str = "critical section";

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide lock state shared by every [`LockManager`]
pub struct LockService {
    config: Config,
    backend: Arc<dyn LockBackend>,
    locks: LockPool,
    sections: LockPool,
    metrics: SharedMetricsCollector,
}

impl LockService {
    /// Create a service for the memory or file backend
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let backend: Arc<dyn LockBackend> = match &config.lock_backend {
            LockBackendKind::Memory => Arc::new(MemoryLockBackend::new()),
            LockBackendKind::File { sync_dir } => Arc::new(FileLockBackend::new(
                sync_dir,
                config.fail_stop,
                Duration::from_millis(config.lock_retry_sleep_ms),
                Duration::from_millis(config.file_mutex_backoff_ms),
                Duration::from_millis(config.active_marker_ttl_ms),
            )?),
            LockBackendKind::Coordination { .. } => {
                return Err(CoordError::setup(
                    "coordination backend requires a connector, use LockService::with_connector",
                ));
            }
        };
        Ok(Self::with_backend(config, backend))
    }

    /// Create a service for the coordination backend, opening a session through `connector`
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        config.validate()?;
        let LockBackendKind::Coordination {
            session_timeout_ms,
            root,
        } = &config.lock_backend
        else {
            return Err(CoordError::InvalidConfig {
                message: "a connector can only be used with the coordination backend".to_string(),
            });
        };
        let session = CoordinationSession::connect(
            connector,
            Duration::from_millis(*session_timeout_ms),
        )?;
        let backend = CoordinationLockBackend::new(
            Arc::new(session),
            root,
            Duration::from_millis(config.wait_poll_ms),
        )?;
        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    /// Create a service around an already constructed backend
    pub fn with_backend(config: Config, backend: Arc<dyn LockBackend>) -> Arc<Self> {
        let retry_sleep = Duration::from_millis(config.lock_retry_sleep_ms);
        let poll = Duration::from_millis(config.wait_poll_ms);
        log::info!("Lock service started on {} backend", backend.name());
        Arc::new(Self {
            locks: LockPool::new(LOCK_NAMESPACE, backend.clone(), retry_sleep, poll),
            sections: LockPool::new(
                SECTION_NAMESPACE,
                Arc::new(MemoryLockBackend::new()),
                retry_sleep,
                poll,
            ),
            backend,
            config,
            metrics: new_shared_metrics_collector(),
        })
    }

    /// Create a lock manager for the calling thread
    pub fn manager(self: &Arc<Self>) -> LockManager {
        LockManager::new(self.clone())
    }

    pub fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetricsCollector {
        &self.metrics
    }

    /// Number of live lock gates, locks and critical sections together
    pub fn live_gates(&self) -> usize {
        self.locks.len() + self.sections.len()
    }

    /// Threads of this process queued for lock `key`
    pub fn lock_queue_len(&self, key: &str) -> usize {
        self.locks.queue_len(key)
    }

    pub fn shutdown(&self) -> Result<()> {
        log::info!("Shutting down lock service");
        self.backend.shutdown()
    }

    fn pool(&self, scope: Scope) -> &LockPool {
        match scope {
            Scope::Lock => &self.locks,
            Scope::Section => &self.sections,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Lock,
    Section,
}

impl Scope {
    fn namespace(self) -> &'static str {
        match self {
            Scope::Lock => LOCK_NAMESPACE,
            Scope::Section => SECTION_NAMESPACE,
        }
    }
}

/// Collapse the three key lists into one request per key, strongest mode
/// wins, ordered by key name
fn sorted_requests(
    read_keys: &[&str],
    non_ex_write_keys: &[&str],
    write_keys: &[&str],
) -> BTreeMap<String, LockMode> {
    let mut requests = BTreeMap::new();
    let roles = [
        (read_keys, LockMode::Read),
        (non_ex_write_keys, LockMode::NonExWrite),
        (write_keys, LockMode::Write),
    ];
    for (keys, mode) in roles {
        for key in keys {
            let entry = requests.entry(key.to_string()).or_insert(mode);
            *entry = (*entry).max(mode);
        }
    }
    requests
}

/// Per-thread lock API.
///
/// A manager must stay on the thread that created it; re-entrant calls are
/// counted locally and never reach the shared lock objects.
pub struct LockManager {
    service: Arc<LockService>,
    thread_id: u64,
    interrupt: Interrupt,
    local_locks: LocalLockTable,
    local_sections: LocalLockTable,
}

impl LockManager {
    pub fn new(service: Arc<LockService>) -> Self {
        Self {
            service,
            thread_id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            interrupt: Interrupt::new(),
            local_locks: LocalLockTable::new(),
            local_sections: LocalLockTable::new(),
        }
    }

    pub fn service(&self) -> &Arc<LockService> {
        &self.service
    }

    pub(crate) fn backend(&self) -> &Arc<dyn LockBackend> {
        &self.service.backend
    }

    /// Token that cancels this manager's waits; clone it to another thread to interrupt
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Sleep for `millis`, returning early with `Interrupted` if cancelled
    pub fn timed_wait(&self, millis: u64) -> Result<()> {
        self.interrupt.sleep(Duration::from_millis(millis))
    }

    fn table(&mut self, scope: Scope) -> &mut LocalLockTable {
        match scope {
            Scope::Lock => &mut self.local_locks,
            Scope::Section => &mut self.local_sections,
        }
    }

    fn enter(&mut self, scope: Scope, key: &str, mode: LockMode, wait: bool) -> Result<()> {
        let namespace = scope.namespace();
        let local = self.table(scope).get(key);
        if let Err(e) = local.check_enter(mode, namespace, key) {
            self.table(scope).release(key);
            return Err(e);
        }
        if local.covers(mode) {
            local.increment(mode);
            return Ok(());
        }

        if let Err(e) = self.obtain_shared(scope, key, mode, wait) {
            self.table(scope).release(key);
            if !e.is_lock_unavailable() {
                self.service.metrics.record_error(&e);
            }
            return Err(e);
        }
        self.table(scope).get(key).increment(mode);
        log::debug!("Entered {} {namespace} '{key}'", mode.as_str());
        Ok(())
    }

    /// Pass the gate for `key`, retrying on gates retired under us
    fn obtain_shared(&self, scope: Scope, key: &str, mode: LockMode, wait: bool) -> Result<()> {
        let pool = self.service.pool(scope);
        let started = Instant::now();
        loop {
            let gate = pool.get_gate(key)?;
            let attempt = if wait {
                gate.enter(self.thread_id, mode, &self.interrupt)
            } else {
                gate.try_enter(self.thread_id, mode, &self.interrupt)
            };
            match attempt {
                Ok(Attempt::Acquired) => {
                    self.service
                        .metrics
                        .record_lock_acquired(mode, started.elapsed());
                    return Ok(());
                }
                Ok(Attempt::Expired) => continue,
                Ok(Attempt::WouldBlock(contention)) => {
                    pool.release_if_idle(key, &gate);
                    self.service.metrics.record_lock_unavailable();
                    return Err(CoordError::unavailable(key, contention));
                }
                Err(e) => {
                    pool.release_if_idle(key, &gate);
                    return Err(e);
                }
            }
        }
    }

    fn release_shared(&self, scope: Scope, key: &str, mode: LockMode) -> Result<()> {
        let pool = self.service.pool(scope);
        let gate = pool.get_gate(key)?;
        let left = gate.leave(mode, &self.interrupt);
        pool.release_if_idle(key, &gate);
        self.service.metrics.record_lock_released();
        left
    }

    fn leave(&mut self, scope: Scope, key: &str, mode: LockMode) -> Result<()> {
        let namespace = scope.namespace();
        let local = self.table(scope).get(key);
        if let Err(e) = local.decrement(mode, namespace, key) {
            self.table(scope).release(key);
            return Err(e);
        }
        if local.count(mode) > 0 {
            return Ok(());
        }

        let illegal = |message: &str| CoordError::IllegalLockSequence {
            namespace,
            key: key.to_string(),
            message: message.to_string(),
        };
        match mode {
            LockMode::Read => {
                if local.has_write_lock() || local.has_non_ex_write_lock() {
                    return Ok(());
                }
            }
            LockMode::NonExWrite => {
                if local.has_write_lock() {
                    return Ok(());
                }
                if local.has_read_lock() {
                    local.increment(mode);
                    return Err(illegal(
                        "cannot leave non-exclusive write while a nested read is held",
                    ));
                }
            }
            LockMode::Write => {
                if local.has_read_lock() || local.has_non_ex_write_lock() {
                    local.increment(mode);
                    return Err(illegal("cannot leave write while a nested weaker mode is held"));
                }
            }
        }

        self.table(scope).release(key);
        log::debug!("Leaving {} {namespace} '{key}'", mode.as_str());
        self.release_shared(scope, key, mode)
    }

    fn enter_many(
        &mut self,
        scope: Scope,
        read_keys: &[&str],
        non_ex_write_keys: &[&str],
        write_keys: &[&str],
        wait: bool,
    ) -> Result<()> {
        let requests = sorted_requests(read_keys, non_ex_write_keys, write_keys);
        let mut entered: Vec<(&str, LockMode)> = Vec::with_capacity(requests.len());
        for (key, mode) in &requests {
            if let Err(e) = self.enter(scope, key, *mode, wait) {
                for (done, done_mode) in entered.into_iter().rev() {
                    if let Err(release_err) = self.leave(scope, done, done_mode) {
                        log::warn!(
                            "Failed to release {} '{done}' after partial acquisition: {release_err}",
                            scope.namespace()
                        );
                    }
                }
                return Err(e);
            }
            entered.push((key, *mode));
        }
        Ok(())
    }

    /// Release in reverse sorted order; continues past failures and reports the first
    fn leave_many(
        &mut self,
        scope: Scope,
        read_keys: &[&str],
        non_ex_write_keys: &[&str],
        write_keys: &[&str],
    ) -> Result<()> {
        let requests = sorted_requests(read_keys, non_ex_write_keys, write_keys);
        let mut first_error = None;
        for (key, mode) in requests.iter().rev() {
            if let Err(e) = self.leave(scope, key, *mode) {
                log::warn!("Failed to leave {} '{key}': {e}", scope.namespace());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // Locks

    pub fn enter_read_lock(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Lock, key, LockMode::Read, true)
    }

    pub fn enter_read_lock_no_wait(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Lock, key, LockMode::Read, false)
    }

    pub fn leave_read_lock(&mut self, key: &str) -> Result<()> {
        self.leave(Scope::Lock, key, LockMode::Read)
    }

    pub fn enter_non_ex_write_lock(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Lock, key, LockMode::NonExWrite, true)
    }

    pub fn enter_non_ex_write_lock_no_wait(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Lock, key, LockMode::NonExWrite, false)
    }

    pub fn leave_non_ex_write_lock(&mut self, key: &str) -> Result<()> {
        self.leave(Scope::Lock, key, LockMode::NonExWrite)
    }

    pub fn enter_write_lock(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Lock, key, LockMode::Write, true)
    }

    pub fn enter_write_lock_no_wait(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Lock, key, LockMode::Write, false)
    }

    pub fn leave_write_lock(&mut self, key: &str) -> Result<()> {
        self.leave(Scope::Lock, key, LockMode::Write)
    }

    /// Enter several locks in key order; a key named in several lists gets its strongest mode.
    ///
    /// On failure every lock entered by this call is released again.
    pub fn enter_locks(
        &mut self,
        read_keys: &[&str],
        non_ex_write_keys: &[&str],
        write_keys: &[&str],
    ) -> Result<()> {
        self.enter_many(Scope::Lock, read_keys, non_ex_write_keys, write_keys, true)
    }

    pub fn enter_locks_no_wait(
        &mut self,
        read_keys: &[&str],
        non_ex_write_keys: &[&str],
        write_keys: &[&str],
    ) -> Result<()> {
        self.enter_many(Scope::Lock, read_keys, non_ex_write_keys, write_keys, false)
    }

    pub fn leave_locks(
        &mut self,
        read_keys: &[&str],
        non_ex_write_keys: &[&str],
        write_keys: &[&str],
    ) -> Result<()> {
        self.leave_many(Scope::Lock, read_keys, non_ex_write_keys, write_keys)
    }

    /// Release every lock and critical section this thread holds.
    ///
    /// Meant for session teardown; continues past failures and reports the first.
    pub fn clear_locks(&mut self) -> Result<()> {
        let mut first_error = None;
        for scope in [Scope::Lock, Scope::Section] {
            for key in self.table(scope).held_keys() {
                for mode in [LockMode::Read, LockMode::NonExWrite, LockMode::Write] {
                    let count = self.table(scope).peek(&key).map_or(0, |l| l.count(mode));
                    for _ in 0..count {
                        if let Err(e) = self.leave(scope, &key, mode) {
                            log::warn!("Failed to clear {} '{key}': {e}", scope.namespace());
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Whether this thread holds `key` in any mode
    pub fn holds_lock(&self, key: &str) -> bool {
        self.local_locks.peek(key).is_some_and(|lock| lock.is_held())
    }

    // Critical sections

    pub fn enter_read_critical_section(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Section, key, LockMode::Read, true)
    }

    pub fn leave_read_critical_section(&mut self, key: &str) -> Result<()> {
        self.leave(Scope::Section, key, LockMode::Read)
    }

    pub fn enter_non_ex_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Section, key, LockMode::NonExWrite, true)
    }

    pub fn leave_non_ex_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.leave(Scope::Section, key, LockMode::NonExWrite)
    }

    pub fn enter_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.enter(Scope::Section, key, LockMode::Write, true)
    }

    pub fn leave_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.leave(Scope::Section, key, LockMode::Write)
    }

    pub fn enter_critical_sections(
        &mut self,
        read_keys: &[&str],
        non_ex_write_keys: &[&str],
        write_keys: &[&str],
    ) -> Result<()> {
        self.enter_many(Scope::Section, read_keys, non_ex_write_keys, write_keys, true)
    }

    pub fn leave_critical_sections(
        &mut self,
        read_keys: &[&str],
        non_ex_write_keys: &[&str],
        write_keys: &[&str],
    ) -> Result<()> {
        self.leave_many(Scope::Section, read_keys, non_ex_write_keys, write_keys)
    }

    // Shared resources

    pub fn set_global_flag(&self, name: &str) -> Result<()> {
        self.backend().set_flag(name)
    }

    pub fn clear_global_flag(&self, name: &str) -> Result<()> {
        self.backend().clear_flag(name)
    }

    pub fn check_global_flag(&self, name: &str) -> Result<bool> {
        self.backend().check_flag(name)
    }

    pub fn read_data(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.backend().read_data(name)
    }

    /// Write shared data; `None` deletes it
    pub fn write_data(&self, name: &str, data: Option<&[u8]>) -> Result<()> {
        self.backend().write_data(name, data)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        let held = self.local_locks.held_keys().len() + self.local_sections.held_keys().len();
        if held > 0 {
            log::warn!("Lock manager dropped while holding {held} keys, releasing them");
            if let Err(e) = self.clear_locks() {
                log::error!("Failed to release locks on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<LockService> {
        let mut config = Config::single_process();
        config.lock_retry_sleep_ms = 1;
        config.wait_poll_ms = 5;
        LockService::new(config).unwrap()
    }

    #[test]
    fn test_sorted_requests_keep_strongest_mode() {
        let requests = sorted_requests(&["b", "a", "c"], &["c"], &["b"]);
        let ordered: Vec<_> = requests.into_iter().collect();
        assert_eq!(
            ordered,
            vec![
                ("a".to_string(), LockMode::Read),
                ("b".to_string(), LockMode::Write),
                ("c".to_string(), LockMode::NonExWrite),
            ]
        );
    }

    #[test]
    fn test_nested_weaker_modes() {
        let service = service();
        let mut manager = service.manager();

        manager.enter_write_lock("k").unwrap();
        manager.enter_read_lock("k").unwrap();
        manager.enter_non_ex_write_lock("k").unwrap();

        // The outer write cannot be left while nested modes are held
        assert!(matches!(
            manager.leave_write_lock("k"),
            Err(CoordError::IllegalLockSequence { .. })
        ));
        manager.leave_non_ex_write_lock("k").unwrap();
        manager.leave_read_lock("k").unwrap();
        assert!(manager.holds_lock("k"));
        manager.leave_write_lock("k").unwrap();
        assert!(!manager.holds_lock("k"));
        assert_eq!(service.live_gates(), 0);
    }

    #[test]
    fn test_leave_unheld_lock_fails() {
        let service = service();
        let mut manager = service.manager();
        assert!(manager.leave_read_lock("missing").is_err());
        assert!(!manager.holds_lock("missing"));
    }

    #[test]
    fn test_locks_and_sections_are_separate_namespaces() {
        let service = service();
        let mut first = service.manager();
        let mut second = service.manager();

        first.enter_write_lock("k").unwrap();
        second.enter_write_critical_section("k").unwrap();
        assert!(matches!(
            second.enter_write_lock_no_wait("k"),
            Err(CoordError::LocalLockUnavailable { .. })
        ));

        second.leave_write_critical_section("k").unwrap();
        first.leave_write_lock("k").unwrap();
    }

    #[test]
    fn test_critical_section_modes() {
        let service = service();
        let mut first = service.manager();
        let mut second = service.manager();

        first
            .enter_critical_sections(&["pool-a"], &["pool-b"], &["pool-c"])
            .unwrap();
        second.enter_read_critical_section("pool-a").unwrap();
        second.enter_non_ex_write_critical_section("pool-b").unwrap();
        assert!(!first.holds_lock("pool-a"));

        second.leave_non_ex_write_critical_section("pool-b").unwrap();
        second.leave_read_critical_section("pool-a").unwrap();
        first
            .leave_critical_sections(&["pool-a"], &["pool-b"], &["pool-c"])
            .unwrap();

        second.enter_write_critical_section("pool-c").unwrap();
        second.leave_write_critical_section("pool-c").unwrap();
    }

    #[test]
    fn test_partial_multi_key_failure_releases_acquired() {
        let service = service();
        let mut holder = service.manager();
        let mut other = service.manager();

        holder.enter_write_lock("b").unwrap();
        assert!(
            other
                .enter_locks_no_wait(&["a"], &[], &["b", "c"])
                .unwrap_err()
                .is_lock_unavailable()
        );
        assert!(!other.holds_lock("a"));
        assert!(!other.holds_lock("c"));

        holder.leave_write_lock("b").unwrap();
        other.enter_locks_no_wait(&["a"], &[], &["b", "c"]).unwrap();
        other.leave_locks(&["a"], &[], &["b", "c"]).unwrap();
        assert_eq!(service.live_gates(), 0);
    }

    #[test]
    fn test_clear_locks_releases_everything() {
        let service = service();
        let mut manager = service.manager();
        manager.enter_write_lock("x").unwrap();
        manager.enter_read_lock("x").unwrap();
        manager.enter_non_ex_write_lock("y").unwrap();
        manager.enter_read_critical_section("z").unwrap();

        manager.clear_locks().unwrap();
        assert!(!manager.holds_lock("x"));
        assert!(!manager.holds_lock("y"));
        assert_eq!(service.live_gates(), 0);
    }

    #[test]
    fn test_drop_releases_held_locks() {
        let service = service();
        {
            let mut manager = service.manager();
            manager.enter_write_lock("k").unwrap();
        }
        let mut manager = service.manager();
        manager.enter_write_lock_no_wait("k").unwrap();
        manager.leave_write_lock("k").unwrap();
    }

    #[test]
    fn test_flags_and_data() {
        let service = service();
        let manager = service.manager();
        assert!(!manager.check_global_flag("f").unwrap());
        manager.set_global_flag("f").unwrap();
        assert!(manager.check_global_flag("f").unwrap());
        manager.clear_global_flag("f").unwrap();
        assert!(!manager.check_global_flag("f").unwrap());

        manager.write_data("d", Some(&b"value"[..])).unwrap();
        assert_eq!(manager.read_data("d").unwrap(), Some(b"value".to_vec()));
        manager.write_data("d", None).unwrap();
        assert_eq!(manager.read_data("d").unwrap(), None);
    }

    #[test]
    fn test_timed_wait_interrupted() {
        let service = service();
        let manager = service.manager();
        manager.interrupt().trigger();
        assert!(matches!(
            manager.timed_wait(10_000),
            Err(CoordError::Interrupted { .. })
        ));
    }

    #[test]
    fn test_coordination_requires_connector() {
        let config = Config::coordinated("/coordkit").unwrap();
        assert!(matches!(
            LockService::new(config),
            Err(CoordError::Setup { .. })
        ));
    }
}
