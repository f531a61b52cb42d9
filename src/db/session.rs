//! Transactional database sessions
//!
//! A [`DatabaseSession`] is owned by one thread. Transactions are begun
//! lazily: `begin_transaction` only pushes a logical level, and the physical
//! connection and begin statement are produced when the first statement
//! needs them. Nested levels share the outermost physical transaction, so a
//! chain of begin/end pairs reaches the backend as a single begin and a
//! single commit or rollback.
//!
//! Every statement goes through the process-wide [`QueryCache`] when it
//! names cache keys, and announces invalidations when it names invalidation
//! keys. Table modification counts feed the [`MaintenanceRegistry`], which
//! triggers analyze and reindex once the cluster-wide totals cross their
//! thresholds. Maintenance requested inside a transaction is deferred until
//! the outermost commit.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backend::{
    BackendConnection, ConnectionPool, Credentials, Dialect, ExecuteResult, IsolationLevel,
    RowSet, Value, translate,
};
use super::stats::{MaintenanceRegistry, StatisticsKind, read_shared_count, write_shared_count};
use super::transaction::{TransactionHandle, TransactionType};
use crate::cache::{CacheTransactions, QueryCache, QueryDescription, cache_lock_key};
use crate::common::{CoordError, ErrorKind, Result, RetryConfig, now_millis};
use crate::interrupt::Interrupt;
use crate::lock::{LockManager, LockService};
use crate::metrics::SharedMetricsCollector;

/// Process-wide database state shared by every session
pub struct DatabaseContext {
    locks: Arc<LockService>,
    pool: Arc<dyn ConnectionPool>,
    dialect: Arc<dyn Dialect>,
    cache: Arc<QueryCache>,
    registry: Arc<MaintenanceRegistry>,
    retry: RetryConfig,
    metrics: SharedMetricsCollector,
}

impl DatabaseContext {
    /// Build the context from the lock service's configuration
    pub fn new(
        locks: Arc<LockService>,
        pool: Arc<dyn ConnectionPool>,
        dialect: Arc<dyn Dialect>,
    ) -> Arc<Self> {
        let config = locks.config().clone();
        let metrics = locks.metrics().clone();
        Arc::new(Self {
            cache: Arc::new(QueryCache::new(config.cache, metrics.clone())),
            registry: Arc::new(MaintenanceRegistry::new(config.maintenance)),
            retry: config.retry,
            metrics,
            locks,
            pool,
            dialect,
        })
    }

    /// Open a session for `credentials`, with its own lock identity
    pub fn session(self: &Arc<Self>, credentials: Credentials) -> DatabaseSession {
        DatabaseSession::new(self.clone(), credentials)
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<MaintenanceRegistry> {
        &self.registry
    }

    pub fn lock_service(&self) -> &Arc<LockService> {
        &self.locks
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }
}

/// A statement together with its caching behaviour
#[derive(Debug, Clone)]
pub struct Query<'a> {
    statement: &'a str,
    params: &'a [Value],
    cache_keys: Option<Vec<String>>,
    invalidate_keys: Vec<String>,
    class: Option<String>,
    ttl_ms: Option<u64>,
    max_rows: Option<usize>,
}

impl<'a> Query<'a> {
    pub fn new(statement: &'a str, params: &'a [Value]) -> Self {
        Self {
            statement,
            params,
            cache_keys: None,
            invalidate_keys: Vec::new(),
            class: None,
            ttl_ms: None,
            max_rows: None,
        }
    }

    /// Cache the result, tagged with the invalidation keys it depends on
    pub fn cached(mut self, keys: &[&str]) -> Self {
        self.cache_keys = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    /// Invalidate cached results tagged with `keys` once this statement takes effect
    pub fn invalidates(mut self, keys: &[&str]) -> Self {
        self.invalidate_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Query class selecting the cache's LRU bucket
    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn limit(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Cache identity, if the result may be cached at all.
    ///
    /// Statements announcing invalidations never cache their own result.
    fn description(&self, database: &str) -> Option<QueryDescription> {
        if !self.invalidate_keys.is_empty() {
            return None;
        }
        let keys = self.cache_keys.as_ref()?;
        let key = format!(
            "{database}\u{1f}{}\u{1f}{:?}\u{1f}{:?}",
            self.statement, self.params, self.max_rows
        );
        Some(
            QueryDescription::new(key, keys.clone())
                .with_class(self.class.clone())
                .with_ttl(self.ttl_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Modifications {
    inserts: u64,
    modifies: u64,
    deletes: u64,
}

/// One thread's connection to a database
pub struct DatabaseSession {
    context: Arc<DatabaseContext>,
    credentials: Credentials,
    locks: LockManager,
    connection: Option<Box<dyn BackendConnection>>,
    transaction: Option<Box<TransactionHandle>>,
    cache_transactions: CacheTransactions,
    /// Levels begun but not yet started on the backend
    delayed_depth: u32,
    /// Levels started on the backend; only the first issued a begin
    physical_depth: u32,
    /// Nested levels swallowed by an enclosing serializable transaction
    serializable_depth: u32,
    do_rollback: bool,
    /// Rollback flags of the enclosing levels
    saved_rollback: Vec<bool>,
    commit_done: bool,
    modifications: HashMap<String, Modifications>,
    tables_to_analyze: Vec<String>,
    tables_to_reindex: Vec<String>,
}

impl DatabaseSession {
    pub fn new(context: Arc<DatabaseContext>, credentials: Credentials) -> Self {
        let locks = context.locks.manager();
        Self {
            context,
            credentials,
            locks,
            connection: None,
            transaction: None,
            cache_transactions: CacheTransactions::new(),
            delayed_depth: 0,
            physical_depth: 0,
            serializable_depth: 0,
            do_rollback: false,
            saved_rollback: Vec::new(),
            commit_done: false,
            modifications: HashMap::new(),
            tables_to_analyze: Vec::new(),
            tables_to_reindex: Vec::new(),
        }
    }

    pub fn database(&self) -> &str {
        &self.credentials.database
    }

    /// Cancellation token; triggering it unwinds blocked statements and lock waits
    pub fn interrupt(&self) -> &Interrupt {
        self.locks.interrupt()
    }

    /// The session's lock manager, for callers coordinating with other processes
    pub fn lock_manager(&mut self) -> &mut LockManager {
        &mut self.locks
    }

    fn metrics(&self) -> &SharedMetricsCollector {
        &self.context.metrics
    }

    // Transactions

    /// Begin a transaction of the enclosing type
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.begin_transaction_of(TransactionType::Enclosing)
    }

    pub fn begin_transaction_of(&mut self, transaction_type: TransactionType) -> Result<()> {
        let current = self.current_transaction_type();
        if current == Some(TransactionType::Serializable) {
            self.serializable_depth += 1;
            return Ok(());
        }

        let resolved = match transaction_type {
            TransactionType::Enclosing => current.unwrap_or(TransactionType::ReadCommitted),
            other => other,
        };
        if resolved == TransactionType::Serializable && self.physical_depth > 0 {
            return Err(CoordError::general(
                "Cannot begin a serializable transaction inside a running read-committed transaction",
            ));
        }

        let handle = Box::new(TransactionHandle::new(self.transaction.take(), resolved));
        self.context
            .cache
            .start_transaction(&mut self.cache_transactions, handle.id());
        log::debug!(
            "Beginning {:?} transaction {} at depth {}",
            resolved,
            handle.id(),
            handle.depth()
        );
        self.transaction = Some(handle);
        self.delayed_depth += 1;
        self.saved_rollback.push(self.do_rollback);
        self.do_rollback = false;
        self.metrics().record_transaction_begin(false);
        Ok(())
    }

    /// Mark the current transaction for rollback at its end
    pub fn signal_rollback(&mut self) {
        if self.serializable_depth == 0 {
            self.do_rollback = true;
        }
    }

    /// Commit the physical transaction now. A later rollback of it is an error.
    pub fn perform_commit(&mut self) -> Result<()> {
        if self.do_rollback || self.delayed_depth > 0 || self.physical_depth == 0 {
            return Ok(());
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(dropped_connection());
        };
        connection
            .commit()
            .map_err(|e| translate(self.context.dialect.as_ref(), "Committing transaction", e))?;
        self.commit_done = true;
        log::debug!("Committed transaction early");
        Ok(())
    }

    /// End the current transaction, committing or rolling back as signalled
    pub fn end_transaction(&mut self) -> Result<()> {
        if self.serializable_depth > 0 {
            self.serializable_depth -= 1;
            return Ok(());
        }
        let Some(handle) = self.transaction.take() else {
            return Err(CoordError::general("End transaction without matching begin"));
        };
        let rollback = self.do_rollback;

        let mut was_physical = false;
        let mut result = Ok(());
        if self.delayed_depth > 0 {
            self.delayed_depth -= 1;
        } else {
            was_physical = true;
            self.physical_depth = self.physical_depth.saturating_sub(1);
            if self.physical_depth == 0 {
                result = self.finish_physical(rollback);
            }
        }

        let committed = !rollback && result.is_ok();
        if committed {
            let published = self
                .context
                .cache
                .commit_transaction(&mut self.cache_transactions, &mut self.locks);
            result = result.and(published);
        } else {
            self.context
                .cache
                .rollback_transaction(&mut self.cache_transactions);
        }

        log::debug!(
            "Ended transaction {} ({})",
            handle.id(),
            if committed { "commit" } else { "rollback" }
        );
        self.transaction = handle.into_parent();
        let parent_rollback = self.saved_rollback.pop().unwrap_or(false);
        // a rolled back level that reached the backend dooms the shared physical transaction
        self.do_rollback =
            parent_rollback || (rollback && was_physical && self.transaction.is_some());

        if self.transaction.is_none() {
            result = result.and(self.after_outermost(committed));
        }
        if let Err(e) = &result {
            self.metrics().record_error(e);
        }
        result
    }

    fn finish_physical(&mut self, rollback: bool) -> Result<()> {
        let commit_done = std::mem::replace(&mut self.commit_done, false);
        let Some(mut connection) = self.connection.take() else {
            if rollback {
                log::warn!("Transaction connection already discarded, nothing to roll back");
                self.metrics().record_transaction_end(false);
                return Ok(());
            }
            self.metrics().record_transaction_end(false);
            return Err(dropped_connection());
        };

        let dialect = self.context.dialect.clone();
        let outcome = if rollback {
            if commit_done {
                Err(CoordError::general(
                    "Cannot roll back an already committed transaction",
                ))
            } else {
                connection
                    .rollback()
                    .map_err(|e| translate(dialect.as_ref(), "Rolling back transaction", e))
            }
        } else if commit_done {
            Ok(())
        } else {
            connection
                .commit()
                .map_err(|e| translate(dialect.as_ref(), "Committing transaction", e))
        };

        self.return_connection(connection, is_interrupted(&outcome));
        self.metrics()
            .record_transaction_end(!rollback && outcome.is_ok());
        outcome
    }

    /// Replay or discard what was deferred until the outermost level ended
    fn after_outermost(&mut self, committed: bool) -> Result<()> {
        let modifications = std::mem::take(&mut self.modifications);
        if !committed {
            self.tables_to_analyze.clear();
            self.tables_to_reindex.clear();
            if !modifications.is_empty() {
                log::debug!(
                    "Discarding modification counts for {} tables",
                    modifications.len()
                );
            }
            return Ok(());
        }

        for (table, m) in modifications {
            self.note_modifications_no_transaction(&table, m.inserts, m.modifies, m.deletes)?;
        }
        for table in std::mem::take(&mut self.tables_to_analyze) {
            self.analyze_table_internal(&table)?;
        }
        for table in std::mem::take(&mut self.tables_to_reindex) {
            self.reindex_table_internal(&table)?;
        }
        Ok(())
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction.as_ref().map(|t| t.id())
    }

    pub fn current_transaction_type(&self) -> Option<TransactionType> {
        self.transaction.as_ref().map(|t| t.transaction_type())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    // Physical connection handling

    fn synchronize_transactions(&mut self) -> Result<()> {
        while self.delayed_depth > 0 {
            self.internal_transaction_begin()?;
            self.delayed_depth -= 1;
        }
        Ok(())
    }

    fn internal_transaction_begin(&mut self) -> Result<()> {
        if self.physical_depth == 0 {
            let isolation = self.requested_isolation();
            let mut connection = self.acquire_connection()?;
            if let Err(e) = connection.begin(isolation) {
                let err = translate(self.context.dialect.as_ref(), "Starting transaction", e);
                self.return_connection(connection, err.kind() == ErrorKind::Interrupted);
                return Err(err);
            }
            log::debug!("Started physical {isolation:?} transaction");
            self.connection = Some(connection);
            self.metrics().record_transaction_begin(true);
        }
        self.physical_depth += 1;
        Ok(())
    }

    /// Serializable if any pending level asked for it
    fn requested_isolation(&self) -> IsolationLevel {
        let mut level = self.transaction.as_deref();
        while let Some(handle) = level {
            if handle.transaction_type() == TransactionType::Serializable {
                return IsolationLevel::Serializable;
            }
            level = handle.parent();
        }
        IsolationLevel::ReadCommitted
    }

    fn acquire_connection(&self) -> Result<Box<dyn BackendConnection>> {
        let attempts = self.context.retry.connection_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.locks.interrupt().check()?;
            match self.context.pool.acquire(&self.credentials) {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    let err = translate(
                        self.context.dialect.as_ref(),
                        &format!("Connecting to '{}'", self.credentials.database),
                        e,
                    );
                    if err.kind() != ErrorKind::ConnectionError || attempt >= attempts {
                        return Err(err);
                    }
                    log::warn!("Connection attempt {attempt}/{attempts} failed: {err}");
                    attempt += 1;
                    self.sleep_for(self.context.retry.abort_backoff_min_ms)?;
                }
            }
        }
    }

    /// Give a connection back, or drop it if a statement on it was cancelled
    fn return_connection(&self, connection: Box<dyn BackendConnection>, interrupted: bool) {
        if interrupted {
            log::warn!("Discarding connection after interrupted statement");
            self.context.pool.discard(connection);
        } else {
            self.context.pool.release(connection);
        }
    }

    /// Run one statement on the backend, with no cache involvement.
    ///
    /// Outside a transaction a transaction abort is retried after a
    /// randomized backoff; inside one it is the caller's to retry.
    fn execute_statement(&mut self, statement: &str, params: &[Value]) -> Result<ExecuteResult> {
        self.locks.interrupt().check()?;
        self.synchronize_transactions()?;
        let interrupt = self.locks.interrupt().clone();
        log::debug!("Executing '{statement}'");

        if self.transaction.is_some() {
            let Some(connection) = self.connection.as_mut() else {
                return Err(dropped_connection());
            };
            return match connection.execute(statement, params, &interrupt) {
                Ok(result) => Ok(result),
                Err(e) => {
                    let err = translate(self.context.dialect.as_ref(), statement, e);
                    if err.kind() == ErrorKind::Interrupted {
                        if let Some(connection) = self.connection.take() {
                            self.context.pool.discard(connection);
                        }
                    }
                    Err(err)
                }
            };
        }

        loop {
            let mut connection = self.acquire_connection()?;
            let outcome = connection
                .execute(statement, params, &interrupt)
                .map_err(|e| translate(self.context.dialect.as_ref(), statement, e));
            self.return_connection(connection, is_interrupted(&outcome));
            match outcome {
                Err(e) if e.kind() == ErrorKind::TransactionAbort => {
                    self.metrics().record_abort_retry();
                    let pause = self.get_sleep_amount();
                    log::warn!("Retrying '{statement}' in {pause} ms after abort: {e}");
                    self.sleep_for(pause)?;
                }
                other => return other,
            }
        }
    }

    // Statements

    /// Execute a statement, consulting and maintaining the query cache
    pub fn execute(&mut self, query: &Query<'_>) -> Result<ExecuteResult> {
        if self.commit_done {
            return Err(CoordError::general(
                "Cannot execute a statement after the transaction was committed",
            ));
        }
        let result = match query.description(&self.credentials.database) {
            Some(description) => self
                .execute_cached(query, &description)
                .map(|rows| ExecuteResult::Rows(rows.as_ref().clone())),
            None => self.execute_direct(query),
        };
        if let Err(e) = &result {
            if !e.is_lock_unavailable() {
                self.metrics().record_error(e);
            }
        }
        result
    }

    fn execute_direct(&mut self, query: &Query<'_>) -> Result<ExecuteResult> {
        let mut result = self.execute_statement(query.statement, query.params)?;
        if let (ExecuteResult::Rows(rows), Some(max)) = (&mut result, query.max_rows) {
            rows.truncate(max);
        }
        self.context.cache.invalidate(
            &mut self.cache_transactions,
            &mut self.locks,
            &query.invalidate_keys,
        )?;
        Ok(result)
    }

    fn execute_cached(
        &mut self,
        query: &Query<'_>,
        description: &QueryDescription,
    ) -> Result<Arc<RowSet>> {
        let lock_keys: Vec<String> = description
            .dependencies()
            .iter()
            .map(|k| cache_lock_key(k))
            .collect();
        let lock_refs: Vec<&str> = lock_keys.iter().map(String::as_str).collect();
        let section = cache_lock_key(description.key());

        self.locks.enter_locks(&lock_refs, &[], &[])?;
        if let Err(e) = self.locks.enter_write_critical_section(&section) {
            if let Err(release) = self.locks.leave_locks(&lock_refs, &[], &[]) {
                log::warn!("Failed to release cache locks: {release}");
            }
            return Err(e);
        }

        let outcome = self.lookup_or_execute(query, description);
        let left_section = self.locks.leave_write_critical_section(&section);
        let left_locks = self.locks.leave_locks(&lock_refs, &[], &[]);

        let rows = outcome?;
        left_section?;
        left_locks?;
        Ok(rows)
    }

    fn lookup_or_execute(
        &mut self,
        query: &Query<'_>,
        description: &QueryDescription,
    ) -> Result<Arc<RowSet>> {
        if let Some(rows) =
            self.context
                .cache
                .lookup(&self.cache_transactions, &self.locks, description)?
        {
            log::trace!("Cache hit for '{}'", query.statement);
            return Ok(rows);
        }

        let created_at = now_millis();
        let mut rows = self
            .execute_statement(query.statement, query.params)?
            .into_rows();
        if let Some(max) = query.max_rows {
            rows.truncate(max);
        }
        let rows = Arc::new(rows);
        self.context.cache.store(
            &mut self.cache_transactions,
            description,
            rows.clone(),
            created_at,
        );
        Ok(rows)
    }

    /// Execute a statement bypassing the cache entirely
    pub fn execute_uncached(&mut self, statement: &str, params: &[Value]) -> Result<ExecuteResult> {
        self.execute(&Query::new(statement, params))
    }

    /// Run a cached query
    pub fn perform_query(
        &mut self,
        statement: &str,
        params: &[Value],
        cache_keys: &[&str],
    ) -> Result<RowSet> {
        self.execute(&Query::new(statement, params).cached(cache_keys))
            .map(ExecuteResult::into_rows)
    }

    /// Run a modification invalidating `invalidate_keys`, returning the update count
    pub fn perform_modification(
        &mut self,
        statement: &str,
        params: &[Value],
        invalidate_keys: &[&str],
    ) -> Result<u64> {
        self.execute(&Query::new(statement, params).invalidates(invalidate_keys))
            .map(|result| result.update_count())
    }

    /// Randomized pause before retrying an aborted transaction, in milliseconds
    pub fn get_sleep_amount(&self) -> u64 {
        let min = self.context.retry.abort_backoff_min_ms;
        let spread = self.context.retry.abort_backoff_max_ms.saturating_sub(min);
        if spread == 0 {
            return min;
        }
        let noise = ahash::RandomState::new().hash_one(Instant::now());
        min + noise % spread.saturating_add(1)
    }

    /// Interruptible sleep
    pub fn sleep_for(&self, millis: u64) -> Result<()> {
        self.locks.interrupt().sleep(Duration::from_millis(millis))
    }

    // Table maintenance

    /// Record modifications to `table`; inside a transaction they count
    /// only once the outermost level commits
    pub fn note_modifications(
        &mut self,
        table: &str,
        inserts: u64,
        modifies: u64,
        deletes: u64,
    ) -> Result<()> {
        if self.transaction.is_some() {
            let m = self.modifications.entry(table.to_string()).or_default();
            m.inserts += inserts;
            m.modifies += modifies;
            m.deletes += deletes;
            return Ok(());
        }
        self.note_modifications_no_transaction(table, inserts, modifies, deletes)
    }

    fn note_modifications_no_transaction(
        &mut self,
        table: &str,
        inserts: u64,
        modifies: u64,
        deletes: u64,
    ) -> Result<()> {
        let reindex_events = modifies + deletes;
        if reindex_events > 0 {
            self.accumulate(StatisticsKind::Reindex, table, reindex_events)?;
        }
        let analyze_events = modifies + inserts;
        if analyze_events > 0 {
            self.accumulate(StatisticsKind::Analyze, table, analyze_events)?;
        }
        Ok(())
    }

    fn accumulate(&mut self, kind: StatisticsKind, table: &str, events: u64) -> Result<()> {
        let key = kind.lock_key(table);
        self.locks.enter_write_critical_section(&key)?;
        let result = self.fold_local(kind, table, events);
        let left = self.locks.leave_write_critical_section(&key);
        result?;
        left
    }

    /// Add to the local count; fold into the shared total every commit threshold
    fn fold_local(&mut self, kind: StatisticsKind, table: &str, events: u64) -> Result<()> {
        let registry = self.context.registry.clone();
        let local = registry.add_events(kind, table, events);
        if local < registry.commit_threshold() {
            return Ok(());
        }

        let key = kind.lock_key(table);
        self.locks.enter_write_lock(&key)?;
        let result = self.fold_shared(kind, table, local);
        let left = self.locks.leave_write_lock(&key);
        result?;
        left?;
        registry.reset(kind, table);
        Ok(())
    }

    fn fold_shared(&mut self, kind: StatisticsKind, table: &str, local: u64) -> Result<()> {
        let total = read_shared_count(&self.locks, kind, table)? + local;
        let threshold = self.context.registry.threshold(kind, table);
        if total >= threshold {
            log::info!(
                "Table '{table}' reached {total} {} events (threshold {threshold})",
                kind.as_str()
            );
            self.run_maintenance(kind, table)?;
            write_shared_count(&self.locks, kind, table, 0)
        } else {
            write_shared_count(&self.locks, kind, table, total)
        }
    }

    fn run_maintenance(&mut self, kind: StatisticsKind, table: &str) -> Result<()> {
        match kind {
            StatisticsKind::Reindex => self.reindex_table_internal(table),
            StatisticsKind::Analyze => self.analyze_table_internal(table),
        }
    }

    /// Analyze `table` now (or at the outermost commit) and reset its counters
    pub fn analyze_table(&mut self, table: &str) -> Result<()> {
        self.explicit_maintenance(StatisticsKind::Analyze, table)
    }

    /// Reindex `table` now (or at the outermost commit) and reset its counters
    pub fn reindex_table(&mut self, table: &str) -> Result<()> {
        self.explicit_maintenance(StatisticsKind::Reindex, table)
    }

    fn explicit_maintenance(&mut self, kind: StatisticsKind, table: &str) -> Result<()> {
        let key = kind.lock_key(table);
        self.locks.enter_write_critical_section(&key)?;
        let result = self.locked_maintenance(kind, table);
        let left = self.locks.leave_write_critical_section(&key);
        result?;
        left
    }

    fn locked_maintenance(&mut self, kind: StatisticsKind, table: &str) -> Result<()> {
        let key = kind.lock_key(table);
        self.locks.enter_write_lock(&key)?;
        let result = self.run_maintenance(kind, table).and_then(|()| {
            write_shared_count(&self.locks, kind, table, 0)?;
            self.context.registry.reset(kind, table);
            Ok(())
        });
        let left = self.locks.leave_write_lock(&key);
        result?;
        left
    }

    fn analyze_table_internal(&mut self, table: &str) -> Result<()> {
        if self.transaction.is_some() {
            queue_once(&mut self.tables_to_analyze, table);
            return Ok(());
        }
        let statement = self.context.dialect.analyze_statement(table);
        self.execute_statement(&statement, &[])?;
        self.metrics().record_analyze();
        log::info!("Analyzed table '{table}'");
        Ok(())
    }

    fn reindex_table_internal(&mut self, table: &str) -> Result<()> {
        if self.transaction.is_some() {
            queue_once(&mut self.tables_to_reindex, table);
            return Ok(());
        }
        let statement = self.context.dialect.reindex_statement(table);
        self.execute_statement(&statement, &[])?;
        self.metrics().record_reindex();
        log::info!("Reindexed table '{table}'");
        Ok(())
    }
}

impl Drop for DatabaseSession {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            log::warn!(
                "Database session for '{}' dropped inside a transaction, rolling back",
                self.credentials.database
            );
        }
        if let Some(mut connection) = self.connection.take() {
            if self.commit_done {
                self.context.pool.release(connection);
            } else if let Err(e) = connection.rollback() {
                log::error!("Rollback on drop failed: {e}");
                self.context.pool.discard(connection);
            } else {
                self.context.pool.release(connection);
            }
        }
    }
}

fn queue_once(queue: &mut Vec<String>, table: &str) {
    if !queue.iter().any(|t| t == table) {
        queue.push(table.to_string());
    }
}

fn dropped_connection() -> CoordError {
    CoordError::Connection {
        message: "Transaction connection was discarded after an interrupted statement".to_string(),
        source: None,
    }
}

fn is_interrupted<T>(outcome: &Result<T>) -> bool {
    matches!(outcome, Err(e) if e.kind() == ErrorKind::Interrupted)
}
