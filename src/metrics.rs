//! Runtime metrics for coordkit
//!
//! Counters for lock traffic, transactions, the query cache and table
//! maintenance, plus a wait-time histogram for blocking lock acquisitions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::{CoordError, LockMode};

/// Metrics collector shared by the lock service, sessions and caches
#[derive(Debug)]
pub struct MetricsCollector {
    locks: LockMetrics,
    transactions: TransactionMetrics,
    cache: CacheMetrics,
    maintenance: MaintenanceMetrics,
    errors: ErrorMetrics,
    lock_waits: LatencyHistogram,
    start_time: Instant,
}

#[derive(Debug, Default)]
pub struct LockMetrics {
    pub read_acquired: AtomicU64,
    pub non_ex_write_acquired: AtomicU64,
    pub write_acquired: AtomicU64,
    pub released: AtomicU64,
    pub unavailable: AtomicU64,
}

#[derive(Debug, Default)]
pub struct TransactionMetrics {
    pub begun: AtomicU64,
    /// Begin statements actually sent to a backend
    pub physical_begins: AtomicU64,
    pub committed: AtomicU64,
    pub rolled_back: AtomicU64,
    pub retried_aborts: AtomicU64,
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub invalidated_keys: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub reindexes: AtomicU64,
    pub analyzes: AtomicU64,
    pub services_cleaned_up: AtomicU64,
}

#[derive(Debug, Default)]
pub struct ErrorMetrics {
    pub total_errors: AtomicU64,
    pub interrupted: AtomicU64,
    pub transaction_aborts: AtomicU64,
    pub connection_errors: AtomicU64,
    pub coordination_errors: AtomicU64,
    pub io_errors: AtomicU64,
}

/// Bucketed wait-time histogram, in microseconds
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    total_sum: AtomicU64,
    max_latency: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub locks: LockMetricsSnapshot,
    pub transactions: TransactionMetricsSnapshot,
    pub cache: CacheMetricsSnapshot,
    pub maintenance: MaintenanceMetricsSnapshot,
    pub errors: ErrorMetricsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetricsSnapshot {
    pub read_acquired: u64,
    pub non_ex_write_acquired: u64,
    pub write_acquired: u64,
    pub released: u64,
    pub unavailable: u64,
    pub wait_p50_us: f64,
    pub wait_p99_us: f64,
    pub wait_max_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMetricsSnapshot {
    pub begun: u64,
    pub physical_begins: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub retried_aborts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub invalidated_keys: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceMetricsSnapshot {
    pub reindexes: u64,
    pub analyzes: u64,
    pub services_cleaned_up: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetricsSnapshot {
    pub total_errors: u64,
    pub interrupted: u64,
    pub transaction_aborts: u64,
    pub connection_errors: u64,
    pub coordination_errors: u64,
    pub io_errors: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            locks: LockMetrics::default(),
            transactions: TransactionMetrics::default(),
            cache: CacheMetrics::default(),
            maintenance: MaintenanceMetrics::default(),
            errors: ErrorMetrics::default(),
            lock_waits: LatencyHistogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Record a cross-process acquisition and how long it waited
    pub fn record_lock_acquired(&self, mode: LockMode, waited: Duration) {
        let counter = match mode {
            LockMode::Read => &self.locks.read_acquired,
            LockMode::NonExWrite => &self.locks.non_ex_write_acquired,
            LockMode::Write => &self.locks.write_acquired,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.lock_waits.record(waited);
    }

    pub fn record_lock_released(&self) {
        self.locks.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_unavailable(&self) {
        self.locks.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction_begin(&self, physical: bool) {
        if physical {
            self.transactions
                .physical_begins
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.transactions.begun.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_transaction_end(&self, committed: bool) {
        if committed {
            self.transactions.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transactions.rolled_back.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_abort_retry(&self) {
        self.transactions
            .retried_aborts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_invalidation(&self, keys: usize, evicted: usize) {
        self.cache
            .invalidated_keys
            .fetch_add(keys as u64, Ordering::Relaxed);
        self.cache
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
    }

    pub fn record_reindex(&self) {
        self.maintenance.reindexes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_analyze(&self) {
        self.maintenance.analyzes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_service_cleanup(&self) {
        self.maintenance
            .services_cleaned_up
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error by its category
    pub fn record_error(&self, error: &CoordError) {
        self.errors.total_errors.fetch_add(1, Ordering::Relaxed);

        let counter = match error.category() {
            "interrupted" => &self.errors.interrupted,
            "transaction_abort" => &self.errors.transaction_aborts,
            "connection" => &self.errors.connection_errors,
            "coordination" | "lock_lost" => &self.errors.coordination_errors,
            "io" => &self.errors.io_errors,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.cache.hits.load(Ordering::Relaxed);
        let misses = self.cache.misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };
        let waits = &self.lock_waits;

        MetricsSnapshot {
            timestamp: crate::common::now_millis() / 1000,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            locks: LockMetricsSnapshot {
                read_acquired: self.locks.read_acquired.load(Ordering::Relaxed),
                non_ex_write_acquired: self.locks.non_ex_write_acquired.load(Ordering::Relaxed),
                write_acquired: self.locks.write_acquired.load(Ordering::Relaxed),
                released: self.locks.released.load(Ordering::Relaxed),
                unavailable: self.locks.unavailable.load(Ordering::Relaxed),
                wait_p50_us: waits.percentile(50.0),
                wait_p99_us: waits.percentile(99.0),
                wait_max_us: waits.max_latency.load(Ordering::Relaxed),
            },
            transactions: TransactionMetricsSnapshot {
                begun: self.transactions.begun.load(Ordering::Relaxed),
                physical_begins: self.transactions.physical_begins.load(Ordering::Relaxed),
                committed: self.transactions.committed.load(Ordering::Relaxed),
                rolled_back: self.transactions.rolled_back.load(Ordering::Relaxed),
                retried_aborts: self.transactions.retried_aborts.load(Ordering::Relaxed),
            },
            cache: CacheMetricsSnapshot {
                hits,
                misses,
                hit_rate,
                invalidated_keys: self.cache.invalidated_keys.load(Ordering::Relaxed),
                evictions: self.cache.evictions.load(Ordering::Relaxed),
            },
            maintenance: MaintenanceMetricsSnapshot {
                reindexes: self.maintenance.reindexes.load(Ordering::Relaxed),
                analyzes: self.maintenance.analyzes.load(Ordering::Relaxed),
                services_cleaned_up: self.maintenance.services_cleaned_up.load(Ordering::Relaxed),
            },
            errors: ErrorMetricsSnapshot {
                total_errors: self.errors.total_errors.load(Ordering::Relaxed),
                interrupted: self.errors.interrupted.load(Ordering::Relaxed),
                transaction_aborts: self.errors.transaction_aborts.load(Ordering::Relaxed),
                connection_errors: self.errors.connection_errors.load(Ordering::Relaxed),
                coordination_errors: self.errors.coordination_errors.load(Ordering::Relaxed),
                io_errors: self.errors.io_errors.load(Ordering::Relaxed),
            },
        }
    }
}

impl LatencyHistogram {
    fn new() -> Self {
        // 100us, 1ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s, 30s, 2min
        let buckets = vec![
            100, 1_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000, 30_000_000,
            120_000_000,
        ];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            total_sum: AtomicU64::new(0),
            max_latency: AtomicU64::new(0),
        }
    }

    fn record(&self, latency: Duration) {
        let latency_us = latency.as_micros() as u64;
        self.max_latency.fetch_max(latency_us, Ordering::Relaxed);

        let bucket = self
            .buckets
            .iter()
            .position(|&limit| latency_us <= limit)
            .unwrap_or(self.buckets.len() - 1);
        self.counts[bucket].fetch_add(1, Ordering::Relaxed);

        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.total_sum.fetch_add(latency_us, Ordering::Relaxed);
    }

    fn percentile(&self, p: f64) -> f64 {
        let total = self.total_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }

        let target_count = ((total as f64 * p / 100.0) as u64).max(1);
        let mut cumulative = 0;

        for (i, count) in self.counts.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target_count {
                return self.buckets[i] as f64;
            }
        }

        *self.buckets.last().unwrap_or(&0) as f64
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics collector type
pub type SharedMetricsCollector = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn new_shared_metrics_collector() -> SharedMetricsCollector {
    Arc::new(MetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        let metrics = MetricsCollector::new();

        metrics.record_lock_acquired(LockMode::Write, Duration::from_micros(500));
        metrics.record_lock_acquired(LockMode::Read, Duration::from_millis(20));
        metrics.record_lock_released();
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(false);
        metrics.record_transaction_begin(false);
        metrics.record_transaction_begin(true);
        metrics.record_transaction_end(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.locks.write_acquired, 1);
        assert_eq!(snapshot.locks.read_acquired, 1);
        assert_eq!(snapshot.locks.released, 1);
        assert_eq!(snapshot.cache.hit_rate, 0.5);
        assert_eq!(snapshot.transactions.begun, 1);
        assert_eq!(snapshot.transactions.physical_begins, 1);
        assert_eq!(snapshot.transactions.committed, 1);
        assert!(snapshot.locks.wait_p50_us > 0.0);
        assert_eq!(snapshot.locks.wait_max_us, 20_000);
    }

    #[test]
    fn test_error_categories() {
        let metrics = MetricsCollector::new();
        metrics.record_error(&CoordError::interrupted("stop"));
        metrics.record_error(&CoordError::TransactionAbort {
            message: "deadlock".to_string(),
            source: None,
        });
        metrics.record_error(&CoordError::general("other"));
        metrics.record_error(&CoordError::Io(std::io::Error::other("disk full")));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors.total_errors, 4);
        assert_eq!(snapshot.errors.interrupted, 1);
        assert_eq!(snapshot.errors.transaction_aborts, 1);
        assert_eq!(snapshot.errors.io_errors, 1);
    }

    #[test]
    fn test_latency_histogram() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::from_micros(50));
        histogram.record(Duration::from_millis(5));
        histogram.record(Duration::from_secs(600));

        assert_eq!(histogram.total_count.load(Ordering::Relaxed), 3);
        assert_eq!(histogram.percentile(30.0), 100.0);
        assert_eq!(histogram.percentile(100.0), 120_000_000.0);
    }
}
