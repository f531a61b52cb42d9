//! Transactional database access
//!
//! Sessions run statements through pluggable backend capabilities, begin
//! transactions lazily, route results through the query cache and keep the
//! table statistics that schedule analyze and reindex runs.

pub mod backend;
pub mod session;
pub mod stats;
pub mod transaction;


pub use backend::{
    BackendConnection, ConnectionPool, Credentials, Dialect, ExecuteResult, IsolationLevel,
    NativeError, NativeResult, PostgresDialect, RowSet, Value,
};
pub use session::{DatabaseContext, DatabaseSession, Query};
pub use stats::{MaintenanceRegistry, StatisticsKind, TableStatistics};
pub use transaction::{TransactionHandle, TransactionType};
