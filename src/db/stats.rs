//! Table modification statistics driving analyze and reindex
//!
//! Each process accumulates modification events per table in a
//! [`MaintenanceRegistry`]. Every `commit_threshold` events the local count
//! is folded into a cluster-wide total kept as shared data, and maintenance
//! runs once that total crosses the table's threshold.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::common::{MaintenanceConfig, Result};
use crate::lock::LockManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatisticsKind {
    /// Fed by updates and deletes
    Reindex,
    /// Fed by updates and inserts
    Analyze,
}

impl StatisticsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatisticsKind::Reindex => "reindex",
            StatisticsKind::Analyze => "analyze",
        }
    }

    /// Critical section and lock name guarding the table's counters
    pub fn lock_key(&self, table: &str) -> String {
        format!("statslock-{}-{table}", self.as_str())
    }

    /// Shared datum holding the cluster-wide total
    pub fn datum_key(&self, table: &str) -> String {
        format!("stats-{}-{table}", self.as_str())
    }
}

/// Events seen by this process and not yet folded into the shared total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStatistics {
    event_count: u64,
}

impl TableStatistics {
    pub fn add(&mut self, events: u64) {
        self.event_count = self.event_count.saturating_add(events);
    }

    pub fn reset(&mut self) {
        self.event_count = 0;
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }
}

/// Per-process statistics, shared by every session of the process
#[derive(Debug)]
pub struct MaintenanceRegistry {
    config: MaintenanceConfig,
    tables: Mutex<HashMap<(StatisticsKind, String), TableStatistics>>,
}

impl MaintenanceRegistry {
    pub fn new(config: MaintenanceConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn commit_threshold(&self) -> u64 {
        self.config.commit_threshold
    }

    /// Shared total at which `kind` maintenance runs for `table`
    pub fn threshold(&self, kind: StatisticsKind, table: &str) -> u64 {
        let (overrides, default) = match kind {
            StatisticsKind::Reindex => (
                &self.config.reindex_thresholds,
                self.config.default_reindex_threshold,
            ),
            StatisticsKind::Analyze => (
                &self.config.analyze_thresholds,
                self.config.default_analyze_threshold,
            ),
        };
        overrides.get(table).copied().unwrap_or(default)
    }

    /// Add local events and return the new local count
    pub fn add_events(&self, kind: StatisticsKind, table: &str, events: u64) -> u64 {
        let mut tables = self.tables.lock();
        let stats = tables.entry((kind, table.to_string())).or_default();
        stats.add(events);
        stats.event_count()
    }

    pub fn pending(&self, kind: StatisticsKind, table: &str) -> u64 {
        self.tables
            .lock()
            .get(&(kind, table.to_string()))
            .map_or(0, |s| s.event_count())
    }

    pub fn reset(&self, kind: StatisticsKind, table: &str) {
        if let Some(stats) = self.tables.lock().get_mut(&(kind, table.to_string())) {
            stats.reset();
        }
    }
}

/// Read the cluster-wide total; absent or malformed data counts as zero
pub fn read_shared_count(locks: &LockManager, kind: StatisticsKind, table: &str) -> Result<u64> {
    match locks.read_data(&kind.datum_key(table))? {
        Some(bytes) if bytes.len() == 4 => Ok(bincode::deserialize::<u32>(&bytes)? as u64),
        _ => Ok(0),
    }
}

pub fn write_shared_count(
    locks: &LockManager,
    kind: StatisticsKind,
    table: &str,
    count: u64,
) -> Result<()> {
    let bytes = bincode::serialize(&(count.min(u32::MAX as u64) as u32))?;
    locks.write_data(&kind.datum_key(table), Some(bytes.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::lock::LockService;

    #[test]
    fn test_thresholds_with_overrides() {
        let mut config = MaintenanceConfig::default();
        config.reindex_thresholds.insert("jobs".to_string(), 10);
        let registry = MaintenanceRegistry::new(config);

        assert_eq!(registry.threshold(StatisticsKind::Reindex, "jobs"), 10);
        assert_eq!(registry.threshold(StatisticsKind::Reindex, "other"), 250_000);
        assert_eq!(registry.threshold(StatisticsKind::Analyze, "jobs"), 2_000);
        assert_eq!(registry.commit_threshold(), 100);
    }

    #[test]
    fn test_accumulators_are_per_kind_and_table() {
        let registry = MaintenanceRegistry::new(MaintenanceConfig::default());
        assert_eq!(registry.add_events(StatisticsKind::Reindex, "a", 3), 3);
        assert_eq!(registry.add_events(StatisticsKind::Reindex, "a", 4), 7);
        assert_eq!(registry.add_events(StatisticsKind::Analyze, "a", 1), 1);
        assert_eq!(registry.pending(StatisticsKind::Reindex, "b"), 0);

        registry.reset(StatisticsKind::Reindex, "a");
        assert_eq!(registry.pending(StatisticsKind::Reindex, "a"), 0);
        assert_eq!(registry.pending(StatisticsKind::Analyze, "a"), 1);
    }

    #[test]
    fn test_shared_count_round_trip() {
        let service = LockService::new(Config::single_process()).unwrap();
        let locks = service.manager();

        assert_eq!(read_shared_count(&locks, StatisticsKind::Analyze, "t").unwrap(), 0);
        write_shared_count(&locks, StatisticsKind::Analyze, "t", 1234).unwrap();
        assert_eq!(read_shared_count(&locks, StatisticsKind::Analyze, "t").unwrap(), 1234);
        assert_eq!(read_shared_count(&locks, StatisticsKind::Reindex, "t").unwrap(), 0);

        locks
            .write_data("stats-analyze-t", Some(&b"garbage!"[..]))
            .unwrap();
        assert_eq!(read_shared_count(&locks, StatisticsKind::Analyze, "t").unwrap(), 0);
    }
}
