//! Background task management for coordkit
//!
//! This module implements the periodic maintenance a long-running process
//! needs: expiring cached query results, reaping services whose members
//! crashed, and refreshing this process's active markers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::cache::QueryCache;
use crate::common::{BackgroundConfig, CoordError, Result, now_millis};
use crate::lock::{LockService, ServiceCleanup};

/// Cleanup callbacks shared with the reaper task
pub type SharedServiceCleanup = Arc<Mutex<Box<dyn ServiceCleanup + Send>>>;

/// Background task manager for automatic maintenance operations
pub struct BackgroundTaskManager {
    /// Whether background tasks are running
    running: Arc<AtomicBool>,

    config: BackgroundConfig,

    locks: Arc<LockService>,

    /// Query cache to expire, if this process runs database sessions
    cache: Option<Arc<QueryCache>>,

    /// Callbacks for reaping crashed services
    cleanup: Option<SharedServiceCleanup>,

    /// Task handles for cleanup
    task_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BackgroundTaskManager {
    /// Create a new background task manager
    pub fn new(locks: Arc<LockService>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            config: locks.config().background.clone(),
            locks,
            cache: None,
            cleanup: None,
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Expire objects of `cache` periodically
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Reap inactive members of the configured service types with `cleanup`
    pub fn with_service_cleanup(mut self, cleanup: SharedServiceCleanup) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Start all background tasks
    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoordError::general("Background tasks are already running"));
        }

        log::info!("Starting background task manager");

        let mut handles = self.task_handles.lock();

        if self.cache.is_some() {
            handles.push(self.start_cache_expiry_task());
        }

        if self.cleanup.is_some() && !self.config.reaped_service_types.is_empty() {
            handles.push(self.start_reaper_task());
        }

        handles.push(self.start_heartbeat_task());

        log::info!("Started {} background tasks", handles.len());
        Ok(())
    }

    /// Stop all background tasks
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        log::info!("Stopping background tasks");

        let handles = {
            let mut handles = self.task_handles.lock();
            std::mem::take(&mut *handles)
        };

        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        log::info!("All background tasks stopped");
        Ok(())
    }

    /// Check if background tasks are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn start_cache_expiry_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let cache = self.cache.clone();
        let interval_ms = self.config.cache_expiry_interval_ms;

        tokio::spawn(async move {
            let Some(cache) = cache else {
                return;
            };
            let mut interval = interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            log::info!("Cache expiry task started with interval {interval_ms}ms");

            while running.load(Ordering::Acquire) {
                interval.tick().await;

                if !running.load(Ordering::Acquire) {
                    break;
                }

                let expired = cache.expire_objects(now_millis());
                log::trace!("Cache expiry pass removed {expired} objects");
            }

            log::info!("Cache expiry task stopped");
        })
    }

    fn start_reaper_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let locks = self.locks.clone();
        let cleanup = self.cleanup.clone();
        let service_types = self.config.reaped_service_types.clone();
        let interval_ms = self.config.reaper_interval_ms;

        tokio::spawn(async move {
            let Some(cleanup) = cleanup else {
                return;
            };
            let mut interval = interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            log::info!("Service reaper task started with interval {interval_ms}ms");

            while running.load(Ordering::Acquire) {
                interval.tick().await;

                if !running.load(Ordering::Acquire) {
                    break;
                }

                let locks = locks.clone();
                let cleanup = cleanup.clone();
                let service_types = service_types.clone();
                // lock waits block, keep them off the runtime's workers
                let pass = tokio::task::spawn_blocking(move || {
                    reap_inactive_services(&locks, &cleanup, &service_types)
                })
                .await;

                match pass {
                    Ok(Ok(0)) => log::trace!("No inactive services"),
                    Ok(Ok(reaped)) => log::info!("Reaped {reaped} inactive services"),
                    Ok(Err(e)) => log::warn!("Service reaping failed: {e}"),
                    Err(e) => log::warn!("Service reaper panicked: {e}"),
                }
            }

            log::info!("Service reaper task stopped");
        })
    }

    fn start_heartbeat_task(&self) -> tokio::task::JoinHandle<()> {
        let running = self.running.clone();
        let locks = self.locks.clone();
        let interval_ms = self.config.heartbeat_interval_ms;

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            log::info!("Heartbeat task started with interval {interval_ms}ms");

            while running.load(Ordering::Acquire) {
                interval.tick().await;

                if !running.load(Ordering::Acquire) {
                    break;
                }

                let locks = locks.clone();
                match tokio::task::spawn_blocking(move || locks.backend().heartbeat()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("Heartbeat failed: {e}"),
                    Err(e) => log::warn!("Heartbeat panicked: {e}"),
                }
            }

            log::info!("Heartbeat task stopped");
        })
    }

    /// Get statistics about background task performance
    pub fn get_stats(&self) -> BackgroundTaskStats {
        BackgroundTaskStats {
            is_running: self.is_running(),
            cache_expiry_enabled: self.cache.is_some(),
            reaper_enabled: self.cleanup.is_some() && !self.config.reaped_service_types.is_empty(),
            cache_expiry_interval_ms: self.config.cache_expiry_interval_ms,
            reaper_interval_ms: self.config.reaper_interval_ms,
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            active_task_count: self.task_handles.lock().len(),
        }
    }
}

/// Reap every inactive member of `service_types`, returning how many went
pub fn reap_inactive_services(
    locks: &Arc<LockService>,
    cleanup: &SharedServiceCleanup,
    service_types: &[String],
) -> Result<usize> {
    let mut manager = locks.manager();
    let mut cleanup = cleanup.lock();
    let mut reaped = 0;
    for service_type in service_types {
        while !manager.cleanup_inactive_service(service_type, &mut **cleanup)? {
            reaped += 1;
        }
    }
    Ok(reaped)
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        let running = self.running.clone();
        let handles = {
            let mut handles = self.task_handles.lock();
            std::mem::take(&mut *handles)
        };

        if running.swap(false, Ordering::AcqRel) {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

/// Statistics about background task performance
#[derive(Debug, Clone)]
pub struct BackgroundTaskStats {
    pub is_running: bool,
    pub cache_expiry_enabled: bool,
    pub reaper_enabled: bool,
    pub cache_expiry_interval_ms: u64,
    pub reaper_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Number of active background tasks
    pub active_task_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CacheConfig, Config};
    use crate::db::backend::RowSet;
    use crate::cache::{CacheTransactions, QueryDescription};
    use crate::metrics::new_shared_metrics_collector;

    #[derive(Default)]
    struct RecordingCleanup {
        cleaned: Arc<Mutex<Vec<String>>>,
    }

    impl ServiceCleanup for RecordingCleanup {
        fn clean_up_all_services(&mut self) -> Result<()> {
            Ok(())
        }

        fn cluster_init(&mut self) -> Result<()> {
            Ok(())
        }

        fn clean_up_service(&mut self, service_name: &str) -> Result<()> {
            self.cleaned.lock().push(service_name.to_string());
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::single_process();
        config.background.cache_expiry_interval_ms = 20;
        config.background.reaper_interval_ms = 20;
        config.background.heartbeat_interval_ms = 20;
        config.background.reaped_service_types = vec!["agents".to_string()];
        config
    }

    fn create_test_background_manager() -> BackgroundTaskManager {
        let locks = LockService::new(test_config()).unwrap();
        BackgroundTaskManager::new(locks)
    }

    #[tokio::test]
    async fn test_background_manager_start_stop() {
        let manager = create_test_background_manager();

        assert!(!manager.is_running());

        manager.start().unwrap();
        assert!(manager.is_running());

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_background_manager_double_start() {
        let manager = create_test_background_manager();

        manager.start().unwrap();

        let result = manager.start();
        assert!(result.is_err());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_manager_stats() {
        let locks = LockService::new(test_config()).unwrap();
        let cache = Arc::new(QueryCache::new(
            CacheConfig::default(),
            new_shared_metrics_collector(),
        ));
        let manager = BackgroundTaskManager::new(locks).with_cache(cache);

        let stats_before = manager.get_stats();
        assert!(!stats_before.is_running);
        assert!(stats_before.cache_expiry_enabled);
        assert!(!stats_before.reaper_enabled);
        assert_eq!(stats_before.active_task_count, 0);

        manager.start().unwrap();

        let stats_after = manager.get_stats();
        assert!(stats_after.is_running);
        assert_eq!(stats_after.active_task_count, 2);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_expiry_task_removes_expired_objects() {
        let locks = LockService::new(test_config()).unwrap();
        let cache = Arc::new(QueryCache::new(
            CacheConfig::default(),
            new_shared_metrics_collector(),
        ));
        let description = QueryDescription::new("q", Vec::new()).with_ttl(Some(10));
        cache.store(
            &mut CacheTransactions::new(),
            &description,
            Arc::new(RowSet::default()),
            now_millis(),
        );
        assert_eq!(cache.len(), 1);

        let manager = BackgroundTaskManager::new(locks).with_cache(cache.clone());
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.stop().await.unwrap();

        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_reaper_task_cleans_up_crashed_service() {
        let locks = LockService::new(test_config()).unwrap();
        {
            let mut manager = locks.manager();
            manager
                .register_service_begin_service_activity("agents", Some("a1"), None, None)
                .unwrap();
            // simulate the member dying without signing out
            manager.backend().clear_active("_ACTIVE_agents_a1").unwrap();
        }

        let cleaned = Arc::new(Mutex::new(Vec::new()));
        let cleanup: SharedServiceCleanup = Arc::new(Mutex::new(Box::new(RecordingCleanup {
            cleaned: cleaned.clone(),
        })));
        let background = BackgroundTaskManager::new(locks.clone()).with_service_cleanup(cleanup);
        assert!(background.get_stats().reaper_enabled);

        background.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        background.stop().await.unwrap();

        assert_eq!(*cleaned.lock(), vec!["a1".to_string()]);
        let mut manager = locks.manager();
        assert!(!manager.check_service_registered("agents", "a1").unwrap());
    }

    #[test]
    fn test_background_manager_drop() {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let manager = create_test_background_manager();

            manager.start().unwrap();
            assert!(manager.is_running());

            drop(manager);

            tokio::time::sleep(Duration::from_millis(50)).await;
        });
    }
}
