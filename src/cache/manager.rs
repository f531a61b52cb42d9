//! Transaction-aware query result cache
//!
//! Results are cached under a [`QueryDescription`] and tagged with the
//! invalidation keys they depend on. Outside a transaction, results go
//! straight to the process-wide [`GeneralCache`] and invalidations are
//! published at once. Inside a transaction both are kept in a per-session
//! stack of levels: a nested commit folds a level into its parent, the
//! outermost commit publishes, and a rollback discards the level without
//! anyone else having seen it.
//!
//! Publishing writes a millisecond stamp to the shared datum `cache-<key>`
//! for every invalidated key. A process looking up an entry created at or
//! before the stamp of one of its keys drops the entry, so invalidations
//! reach the caches of other processes too.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::common::{CacheConfig, Result, now_millis};
use crate::db::backend::RowSet;
use crate::lock::LockManager;
use crate::metrics::SharedMetricsCollector;

use super::general::GeneralCache;

/// Name of the lock guarding an invalidation key
pub fn cache_lock_key(key: &str) -> String {
    format!("_Cache_{key}")
}

/// Name of the shared datum holding a key's last invalidation time
pub fn stamp_key(key: &str) -> String {
    format!("cache-{key}")
}

/// Identity and cache policy of one cacheable result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescription {
    key: String,
    dependencies: Vec<String>,
    class: Option<String>,
    ttl_ms: Option<u64>,
}

impl QueryDescription {
    pub fn new(key: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            key: key.into(),
            dependencies,
            class: None,
            ttl_ms: None,
        }
    }

    pub fn with_class(mut self, class: Option<String>) -> Self {
        self.class = class;
        self
    }

    pub fn with_ttl(mut self, ttl_ms: Option<u64>) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }
}

#[derive(Debug, Clone)]
struct PendingObject {
    rows: Arc<RowSet>,
    description: QueryDescription,
    created_at: u64,
}

#[derive(Debug)]
struct CacheLevel {
    id: String,
    objects: HashMap<String, PendingObject>,
    invalidated: HashSet<String>,
}

impl CacheLevel {
    fn invalidate(&mut self, keys: &[String]) {
        self.objects.retain(|_, pending| {
            !pending
                .description
                .dependencies
                .iter()
                .any(|k| keys.contains(k))
        });
        self.invalidated.extend(keys.iter().cloned());
    }
}

/// One session's stack of open transaction levels
#[derive(Debug, Default)]
pub struct CacheTransactions {
    levels: Vec<CacheLevel>,
}

impl CacheTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        !self.levels.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Id of the innermost level
    pub fn current(&self) -> Option<&str> {
        self.levels.last().map(|level| level.id.as_str())
    }
}

/// Process-wide query cache shared by every session
pub struct QueryCache {
    objects: GeneralCache<Arc<RowSet>>,
    config: CacheConfig,
    metrics: SharedMetricsCollector,
}

impl QueryCache {
    pub fn new(config: CacheConfig, metrics: SharedMetricsCollector) -> Self {
        Self {
            objects: GeneralCache::new(),
            config,
            metrics,
        }
    }

    /// Find a cached result visible to the session.
    ///
    /// The caller holds read locks on the description's invalidation keys.
    pub fn lookup(
        &self,
        transactions: &CacheTransactions,
        locks: &LockManager,
        description: &QueryDescription,
    ) -> Result<Option<Arc<RowSet>>> {
        let found = self.find(transactions, locks, description)?;
        self.metrics.record_cache_lookup(found.is_some());
        Ok(found)
    }

    fn find(
        &self,
        transactions: &CacheTransactions,
        locks: &LockManager,
        description: &QueryDescription,
    ) -> Result<Option<Arc<RowSet>>> {
        for level in transactions.levels.iter().rev() {
            if let Some(pending) = level.objects.get(&description.key) {
                return Ok(Some(pending.rows.clone()));
            }
            if description
                .dependencies
                .iter()
                .any(|k| level.invalidated.contains(k))
            {
                return Ok(None);
            }
        }

        let Some(object) = self.objects.get(&description.key) else {
            return Ok(None);
        };
        let now = now_millis();
        if object.expires_at.is_some_and(|at| at <= now) {
            self.objects.remove(&description.key);
            return Ok(None);
        }
        for key in &object.keys {
            if let Some(stamp) = read_stamp(locks, key)? {
                if stamp >= object.created_at {
                    log::trace!(
                        "Dropping cached '{}', key '{key}' invalidated at {stamp}",
                        description.key
                    );
                    self.objects.remove(&description.key);
                    return Ok(None);
                }
            }
        }
        if object.expires_at.is_some() {
            self.objects
                .set_expiration(&description.key, self.expiration_for(description, now));
        }
        Ok(Some(object.value))
    }

    /// Save a freshly computed result, created at `created_at`
    pub fn store(
        &self,
        transactions: &mut CacheTransactions,
        description: &QueryDescription,
        rows: Arc<RowSet>,
        created_at: u64,
    ) {
        if let Some(level) = transactions.levels.last_mut() {
            level.objects.insert(
                description.key.clone(),
                PendingObject {
                    rows,
                    description: description.clone(),
                    created_at,
                },
            );
        } else {
            self.publish_object(description, rows, created_at);
        }
    }

    fn publish_object(&self, description: &QueryDescription, rows: Arc<RowSet>, created_at: u64) {
        self.objects.insert(
            &description.key,
            rows,
            description.dependencies.clone(),
            created_at,
        );
        let expires_at = self.expiration_for(description, now_millis());
        if expires_at.is_some() {
            self.objects.set_expiration(&description.key, expires_at);
        }
        if let Some(class) = &description.class {
            let limit = self.config.class_limits.get(class).copied();
            let evicted = self.objects.set_class(&description.key, class, limit);
            if evicted > 0 {
                log::debug!("Evicted {evicted} cached objects of class '{class}'");
            }
        }
    }

    fn expiration_for(&self, description: &QueryDescription, now: u64) -> Option<u64> {
        description
            .ttl_ms
            .or(self.config.default_ttl_ms)
            .map(|ttl| now.saturating_add(ttl))
    }

    /// Invalidate `keys`: at once outside a transaction, at the outermost
    /// commit inside one
    pub fn invalidate(
        &self,
        transactions: &mut CacheTransactions,
        locks: &mut LockManager,
        keys: &[String],
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        match transactions.levels.last_mut() {
            Some(level) => {
                level.invalidate(keys);
                Ok(())
            }
            None => self.publish_invalidation(locks, keys),
        }
    }

    /// Stamp `keys` as invalidated now and evict their dependents locally
    pub fn publish_invalidation(&self, locks: &mut LockManager, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let lock_keys: Vec<String> = keys.iter().map(|k| cache_lock_key(k)).collect();
        let lock_refs: Vec<&str> = lock_keys.iter().map(String::as_str).collect();
        locks.enter_locks(&[], &[], &lock_refs)?;

        let result = (|| -> Result<usize> {
            let stamp = bincode::serialize(&now_millis())?;
            for key in keys {
                locks.write_data(&stamp_key(key), Some(stamp.as_slice()))?;
            }
            Ok(self.objects.invalidate_keys(keys))
        })();
        let released = locks.leave_locks(&[], &[], &lock_refs);

        let evicted = result?;
        released?;
        self.metrics.record_cache_invalidation(keys.len(), evicted);
        log::debug!("Invalidated {} cache keys, evicted {evicted} objects", keys.len());
        Ok(())
    }

    /// Open a transaction level on top of the session's stack
    pub fn start_transaction(&self, transactions: &mut CacheTransactions, id: &str) {
        transactions.levels.push(CacheLevel {
            id: id.to_string(),
            objects: HashMap::new(),
            invalidated: HashSet::new(),
        });
    }

    /// Close the innermost level, handing its effects to the parent or
    /// publishing them if it was the outermost
    pub fn commit_transaction(
        &self,
        transactions: &mut CacheTransactions,
        locks: &mut LockManager,
    ) -> Result<()> {
        let Some(level) = transactions.levels.pop() else {
            return Ok(());
        };
        let invalidated: Vec<String> = level.invalidated.into_iter().collect();
        match transactions.levels.last_mut() {
            Some(parent) => {
                parent.invalidate(&invalidated);
                parent.objects.extend(level.objects);
                Ok(())
            }
            None => {
                self.publish_invalidation(locks, &invalidated)?;
                for (_, pending) in level.objects {
                    self.publish_object(&pending.description, pending.rows, pending.created_at);
                }
                Ok(())
            }
        }
    }

    /// Discard the innermost level
    pub fn rollback_transaction(&self, transactions: &mut CacheTransactions) {
        if let Some(level) = transactions.levels.pop() {
            log::trace!(
                "Discarding {} cached objects of transaction {}",
                level.objects.len(),
                level.id
            );
        }
    }

    /// Remove every published object that expired at or before `now`
    pub fn expire_objects(&self, now: u64) -> usize {
        let expired = self.objects.expire(now);
        if expired > 0 {
            log::debug!("Expired {expired} cached objects");
        }
        expired
    }

    /// Number of published objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn read_stamp(locks: &LockManager, key: &str) -> Result<Option<u64>> {
    match locks.read_data(&stamp_key(key))? {
        Some(bytes) if bytes.len() == 8 => Ok(Some(bincode::deserialize::<u64>(&bytes)?)),
        _ => Ok(None),
    }
}
