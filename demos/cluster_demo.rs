//! Cluster demo
//!
//! Two "processes" (here: two lock services sharing one synchronization
//! directory) register as workers, coordinate through locks and run
//! transactional statements against a toy in-memory table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coordkit::db::{
    BackendConnection, ConnectionPool, ExecuteResult, IsolationLevel, NativeError, NativeResult,
    RowSet, Value,
};
use coordkit::lock::ServiceCleanup;
use coordkit::{
    BackgroundTaskManager, Config, Credentials, DatabaseContext, Interrupt, LockService,
    PostgresDialect,
};
use parking_lot::Mutex;

/// A single key/value table shared by every connection
#[derive(Default)]
struct Table {
    committed: BTreeMap<String, i64>,
}

struct DemoConnection {
    table: Arc<Mutex<Table>>,
    pending: Option<BTreeMap<String, i64>>,
}

impl DemoConnection {
    fn view(&self) -> BTreeMap<String, i64> {
        match &self.pending {
            Some(pending) => pending.clone(),
            None => self.table.lock().committed.clone(),
        }
    }
}

impl BackendConnection for DemoConnection {
    fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
        _interrupt: &Interrupt,
    ) -> NativeResult<ExecuteResult> {
        if statement.starts_with("SELECT") {
            let rows = self
                .view()
                .into_iter()
                .map(|(k, v)| vec![Value::Text(k), Value::Int(v)])
                .collect();
            return Ok(ExecuteResult::Rows(RowSet::new(
                vec!["name".to_string(), "value".to_string()],
                rows,
            )));
        }
        if statement.starts_with("UPSERT") {
            let (Some(Value::Text(name)), Some(Value::Int(value))) = (params.first(), params.get(1))
            else {
                return Err(NativeError::new(Some("42601"), "UPSERT needs (text, int)"));
            };
            let mut view = self.view();
            view.insert(name.clone(), *value);
            match &mut self.pending {
                Some(pending) => *pending = view,
                None => self.table.lock().committed = view,
            }
            return Ok(ExecuteResult::Updated(1));
        }
        println!("  backend: {statement}");
        Ok(ExecuteResult::Updated(0))
    }

    fn begin(&mut self, _isolation: IsolationLevel) -> NativeResult<()> {
        self.pending = Some(self.table.lock().committed.clone());
        Ok(())
    }

    fn commit(&mut self) -> NativeResult<()> {
        if let Some(pending) = self.pending.take() {
            self.table.lock().committed = pending;
        }
        Ok(())
    }

    fn rollback(&mut self) -> NativeResult<()> {
        self.pending = None;
        Ok(())
    }
}

struct DemoPool {
    table: Arc<Mutex<Table>>,
}

impl ConnectionPool for DemoPool {
    fn acquire(&self, _credentials: &Credentials) -> NativeResult<Box<dyn BackendConnection>> {
        Ok(Box::new(DemoConnection {
            table: self.table.clone(),
            pending: None,
        }))
    }

    fn release(&self, _connection: Box<dyn BackendConnection>) {}
}

struct LoggingCleanup;

impl ServiceCleanup for LoggingCleanup {
    fn clean_up_all_services(&mut self) -> coordkit::Result<()> {
        println!("  cleanup: wiping state of all workers");
        Ok(())
    }

    fn cluster_init(&mut self) -> coordkit::Result<()> {
        println!("  cleanup: initializing cluster");
        Ok(())
    }

    fn clean_up_service(&mut self, service_name: &str) -> coordkit::Result<()> {
        println!("  cleanup: reclaiming work of {service_name}");
        Ok(())
    }
}

fn print_table(rows: &RowSet) {
    for row in 0..rows.len() {
        if let (Some(Value::Text(name)), Some(Value::Int(value))) =
            (rows.get(row, "name"), rows.get(row, "value"))
        {
            println!("    {name} = {value}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("coordkit cluster demo");
    println!("=====================");

    let sync_dir = tempfile::tempdir()?;
    let sync_path = sync_dir.path().to_string_lossy().to_string();

    // Two members of the cluster share the synchronization directory.
    // Active markers go stale quickly so the crash below is noticed fast.
    let member_config = |path: String| -> coordkit::Result<Config> {
        let mut config = Config::file_based(path)?;
        config.active_marker_ttl_ms = 300;
        config.background.heartbeat_interval_ms = 100;
        Ok(config)
    };
    let service_a = LockService::new(member_config(sync_path.clone())?)?;
    let service_b = LockService::new(member_config(sync_path)?)?;

    println!("\nService registry:");
    let mut cleanup = LoggingCleanup;
    let mut manager_a = service_a.manager();
    let name_a = manager_a.register_service_begin_service_activity(
        "workers",
        Some("worker-a"),
        Some(b"capacity=4".as_slice()),
        Some(&mut cleanup as &mut dyn ServiceCleanup),
    )?;
    let mut manager_b = service_b.manager();
    let name_b = manager_b.register_service_begin_service_activity(
        "workers",
        None,
        None,
        Some(&mut cleanup as &mut dyn ServiceCleanup),
    )?;
    println!("  registered {name_a} and {name_b}");
    println!(
        "  active workers: {}",
        manager_a.count_active_services("workers")?
    );

    println!("\nLocks across members:");
    manager_a.enter_write_lock("queue")?;
    match manager_b.enter_read_lock_no_wait("queue") {
        Ok(()) => println!("  unexpected: read lock granted while queue is write-locked"),
        Err(e) => println!("  worker B without waiting: {e}"),
    }
    let waiter = {
        let service_b = service_b.clone();
        thread::spawn(move || -> coordkit::Result<()> {
            let mut manager = service_b.manager();
            manager.enter_read_lock("queue")?;
            println!("  worker B got the read lock after A released");
            manager.leave_read_lock("queue")
        })
    };
    thread::sleep(Duration::from_millis(100));
    manager_a.leave_write_lock("queue")?;
    waiter
        .join()
        .map_err(|_| "waiting thread panicked")??;

    println!("\nTransactions:");
    let table = Arc::new(Mutex::new(Table::default()));
    let context = DatabaseContext::new(
        service_a.clone(),
        Arc::new(DemoPool {
            table: table.clone(),
        }),
        Arc::new(PostgresDialect),
    );
    let mut session = context.session(Credentials::new("demo", "worker", ""));

    session.begin_transaction()?;
    session.perform_modification(
        "UPSERT settings",
        &[Value::from("retries"), Value::Int(3)],
        &["settings"],
    )?;
    session.begin_transaction()?;
    session.perform_modification(
        "UPSERT settings",
        &[Value::from("timeout"), Value::Int(30)],
        &["settings"],
    )?;
    session.end_transaction()?;
    session.end_transaction()?;
    println!("  committed nested transaction:");
    print_table(&session.perform_query("SELECT * FROM settings", &[], &["settings"])?);

    session.begin_transaction()?;
    session.perform_modification(
        "UPSERT settings",
        &[Value::from("retries"), Value::Int(99)],
        &["settings"],
    )?;
    session.signal_rollback();
    session.end_transaction()?;
    println!("  after rolled back change:");
    print_table(&session.perform_query("SELECT * FROM settings", &[], &["settings"])?);

    let snapshot = service_a.metrics().snapshot();
    println!(
        "  cache hits: {}, misses: {}",
        snapshot.cache.hits, snapshot.cache.misses
    );

    println!("\nCrash recovery:");
    let background = BackgroundTaskManager::new(service_a.clone()).with_cache(context.cache().clone());
    background.start()?;
    // B stops heartbeating without signing out
    drop(manager_b);
    drop(service_b);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let reaped = coordkit::background::reap_inactive_services(
        &service_a,
        &Arc::new(Mutex::new(Box::new(LoggingCleanup) as Box<dyn ServiceCleanup + Send>)),
        &["workers".to_string()],
    )?;
    println!("  reaped {reaped} crashed worker(s)");
    println!(
        "  active workers: {}",
        manager_a.count_active_services("workers")?
    );

    background.stop().await?;
    drop(session);
    manager_a.end_service_activity("workers", &name_a)?;
    println!("\nDone.");
    Ok(())
}
