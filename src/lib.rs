//! # coordkit: Cluster Coordination Primitives in Rust
//!
//! `coordkit` lets several threads in several processes share work safely.
//! It provides hierarchical read / non-exclusive write / write locks with
//! pluggable cross-process backends, a registry of cluster members with
//! crash cleanup, and transactional database sessions whose query cache
//! stays consistent across transactions and processes.
//!
//! ## Core Features
//!
//! - **Cross-Process Locks**: Re-entrant per thread, FIFO within a process, shared
//!   through memory, a synchronization directory or a coordination service
//! - **Deadlock-Free Multi-Key Locking**: Keys are always taken in sorted order
//! - **Service Registry**: Registration, active markers and reaping of crashed members
//! - **Lazy Transactions**: No connection is held until a statement needs one
//! - **Transactional Query Cache**: Invalidations published only on commit
//!
//! ## Example
//!
//! ```rust,ignore
//! use coordkit::{Config, LockService};
//!
//! fn main() -> coordkit::Result<()> {
//!     let service = LockService::new(Config::file_based("/var/lib/coordkit")?)?;
//!     let mut locks = service.manager();
//!
//!     locks.enter_locks(&["jobs"], &[], &["queue"])?;
//!     // ... work with both resources ...
//!     locks.leave_locks(&["jobs"], &[], &["queue"])?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod common;
pub mod coordination;
pub mod db;
pub mod interrupt;
pub mod lock;
pub mod metrics;

// Re-export commonly used types
pub use common::{Config, CoordError, ErrorKind, LockBackendKind, LockMode, Result};
pub use interrupt::Interrupt;

// Re-export main types
pub use background::{BackgroundTaskManager, BackgroundTaskStats};
pub use cache::{QueryCache, QueryDescription};
pub use coordination::{CoordinationSession, MemoryCoordinator};
pub use db::{
    Credentials, DatabaseContext, DatabaseSession, PostgresDialect, Query, TransactionType,
};
pub use lock::{LockManager, LockService, ServiceCleanup};
pub use metrics::{
    MetricsCollector, MetricsSnapshot, SharedMetricsCollector, new_shared_metrics_collector,
};
