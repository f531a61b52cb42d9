//! Coordination benchmarks
//!
//! Measures the hot paths of a running cluster member:
//! - uncontended lock enter/leave per mode
//! - multi-key acquisition in sorted order
//! - cached query lookups against an instant backend
//! - concurrent read locks on a shared key

use coordkit::db::{
    BackendConnection, ConnectionPool, ExecuteResult, IsolationLevel, NativeResult, RowSet, Value,
};
use coordkit::{Config, Credentials, DatabaseContext, Interrupt, LockService, PostgresDialect};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Connection answering every statement with the same small row set
struct InstantConnection;

impl BackendConnection for InstantConnection {
    fn execute(
        &mut self,
        _statement: &str,
        params: &[Value],
        _interrupt: &Interrupt,
    ) -> NativeResult<ExecuteResult> {
        let rows = (0..8)
            .map(|i| vec![Value::Int(i), params.first().cloned().unwrap_or(Value::Null)])
            .collect();
        Ok(ExecuteResult::Rows(RowSet::new(
            vec!["id".to_string(), "param".to_string()],
            rows,
        )))
    }

    fn begin(&mut self, _isolation: IsolationLevel) -> NativeResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> NativeResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> NativeResult<()> {
        Ok(())
    }
}

struct InstantPool;

impl ConnectionPool for InstantPool {
    fn acquire(&self, _credentials: &Credentials) -> NativeResult<Box<dyn BackendConnection>> {
        Ok(Box::new(InstantConnection))
    }

    fn release(&self, _connection: Box<dyn BackendConnection>) {}
}

fn generate_key(index: usize) -> String {
    format!("resource_{index:06}")
}

/// Single-key enter/leave for each lock mode
fn bench_uncontended_locks(c: &mut Criterion) {
    let service = LockService::new(Config::single_process()).unwrap();
    let mut manager = service.manager();

    let mut group = c.benchmark_group("uncontended_locks");
    group.throughput(Throughput::Elements(1));

    group.bench_function("read", |b| {
        b.iter(|| {
            manager.enter_read_lock(black_box("bench")).unwrap();
            manager.leave_read_lock(black_box("bench")).unwrap();
        })
    });

    group.bench_function("non_ex_write", |b| {
        b.iter(|| {
            manager.enter_non_ex_write_lock(black_box("bench")).unwrap();
            manager.leave_non_ex_write_lock(black_box("bench")).unwrap();
        })
    });

    group.bench_function("write", |b| {
        b.iter(|| {
            manager.enter_write_lock(black_box("bench")).unwrap();
            manager.leave_write_lock(black_box("bench")).unwrap();
        })
    });

    group.bench_function("reentrant_read_in_write", |b| {
        manager.enter_write_lock("outer").unwrap();
        b.iter(|| {
            manager.enter_read_lock(black_box("outer")).unwrap();
            manager.leave_read_lock(black_box("outer")).unwrap();
        });
        manager.leave_write_lock("outer").unwrap();
    });

    group.finish();
}

/// Multi-key acquisition with growing key counts
fn bench_multi_key(c: &mut Criterion) {
    let service = LockService::new(Config::single_process()).unwrap();
    let mut manager = service.manager();

    let mut group = c.benchmark_group("multi_key");

    for count in [2usize, 8, 32] {
        let keys: Vec<String> = (0..count).rev().map(generate_key).collect();
        let (reads, writes) = keys.split_at(count / 2);
        let reads: Vec<&str> = reads.iter().map(String::as_str).collect();
        let writes: Vec<&str> = writes.iter().map(String::as_str).collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("enter_leave", count), &count, |b, _| {
            b.iter(|| {
                manager.enter_locks(&reads, &[], &writes).unwrap();
                manager.leave_locks(&reads, &[], &writes).unwrap();
            })
        });
    }

    group.finish();
}

/// Cached lookups against uncached execution of the same statement
fn bench_cached_queries(c: &mut Criterion) {
    let service = LockService::new(Config::single_process()).unwrap();
    let context = DatabaseContext::new(service, Arc::new(InstantPool), Arc::new(PostgresDialect));
    let mut session = context.session(Credentials::new("bench", "bench", ""));
    let params = [Value::Int(7)];

    let mut group = c.benchmark_group("query_cache");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("uncached", |b| {
        b.iter(|| {
            session
                .execute_uncached(black_box("SELECT id FROM jobs WHERE owner = $1"), &params)
                .unwrap()
        })
    });

    session
        .perform_query("SELECT id FROM jobs WHERE owner = $1", &params, &["jobs"])
        .unwrap();
    group.bench_function("cache_hit", |b| {
        b.iter(|| {
            session
                .perform_query(
                    black_box("SELECT id FROM jobs WHERE owner = $1"),
                    &params,
                    &["jobs"],
                )
                .unwrap()
        })
    });

    group.bench_function("invalidate_then_lookup", |b| {
        b.iter(|| {
            session
                .perform_modification("UPDATE jobs SET state = 1", &[], &["jobs"])
                .unwrap();
            session
                .perform_query("SELECT id FROM jobs WHERE owner = $1", &params, &["jobs"])
                .unwrap()
        })
    });

    group.finish();
}

/// Several threads sharing read locks on one key
fn bench_concurrent_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_readers");
    group.sample_size(20);

    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * 100) as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &n| {
            let service = LockService::new(Config::single_process()).unwrap();
            b.iter(|| {
                let handles: Vec<_> = (0..n)
                    .map(|_| {
                        let service = service.clone();
                        thread::spawn(move || {
                            let mut manager = service.manager();
                            for _ in 0..100 {
                                manager.enter_read_lock("shared").unwrap();
                                manager.leave_read_lock("shared").unwrap();
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended_locks,
    bench_multi_key,
    bench_cached_queries,
    bench_concurrent_readers
);
criterion_main!(benches);
