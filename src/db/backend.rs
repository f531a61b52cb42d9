//! Database backend capabilities
//!
//! The session layer never talks to a driver directly. It needs a
//! [`ConnectionPool`] handing out [`BackendConnection`]s that execute
//! parameterized statements, and a [`Dialect`] that classifies native errors
//! and produces the few maintenance statements the session issues itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{BoxError, CoordError, ErrorKind};
use crate::interrupt::Interrupt;

/// A positional statement parameter or a result column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Rows returned by a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row`, if both exist
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index)
    }

    /// Keep at most `max_rows` rows
    pub fn truncate(&mut self, max_rows: usize) {
        self.rows.truncate(max_rows);
    }
}

/// What a statement produced
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResult {
    Rows(RowSet),
    Updated(u64),
}

impl ExecuteResult {
    pub fn into_rows(self) -> RowSet {
        match self {
            ExecuteResult::Rows(rows) => rows,
            ExecuteResult::Updated(_) => RowSet::default(),
        }
    }

    pub fn update_count(&self) -> u64 {
        match self {
            ExecuteResult::Rows(rows) => rows.len() as u64,
            ExecuteResult::Updated(count) => *count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

/// Who a connection is opened for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

/// An error reported by a driver, before classification
#[derive(Error, Debug)]
#[error("{message}")]
pub struct NativeError {
    /// SQLSTATE or the equivalent vendor code
    pub code: Option<String>,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl NativeError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: BoxError) -> Self {
        self.source = Some(source);
        self
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// A physical connection, used by one thread at a time
pub trait BackendConnection: Send {
    /// Execute a statement. Drivers poll `interrupt` while the statement
    /// runs and cancel it once the token fires.
    fn execute(
        &mut self,
        statement: &str,
        params: &[Value],
        interrupt: &Interrupt,
    ) -> NativeResult<ExecuteResult>;

    fn begin(&mut self, isolation: IsolationLevel) -> NativeResult<()>;

    fn commit(&mut self) -> NativeResult<()>;

    fn rollback(&mut self) -> NativeResult<()>;
}

/// Source of physical connections
pub trait ConnectionPool: Send + Sync {
    fn acquire(&self, credentials: &Credentials) -> NativeResult<Box<dyn BackendConnection>>;

    /// Return a healthy connection for reuse
    fn release(&self, connection: Box<dyn BackendConnection>);

    /// Drop a connection whose state is unknown, e.g. after a cancelled statement
    fn discard(&self, connection: Box<dyn BackendConnection>) {
        drop(connection);
    }
}

/// Vendor-specific behaviour the generic session delegates to
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, error: &NativeError) -> ErrorKind;

    fn analyze_statement(&self, table: &str) -> String;

    fn reindex_statement(&self, table: &str) -> String;
}

/// PostgreSQL error classes and maintenance statements
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn classify(&self, error: &NativeError) -> ErrorKind {
        error
            .code
            .as_deref()
            .map_or(ErrorKind::GeneralError, classify_sqlstate)
    }

    fn analyze_statement(&self, table: &str) -> String {
        format!("ANALYZE {table}")
    }

    fn reindex_statement(&self, table: &str) -> String {
        format!("REINDEX TABLE {table}")
    }
}

/// Map a SQLSTATE to an error kind.
///
/// Unique violations are folded into `TransactionAbort`: with concurrent
/// inserts they are retried the same way as deadlocks.
pub fn classify_sqlstate(state: &str) -> ErrorKind {
    match state {
        "08003" => ErrorKind::Interrupted,
        "40001" | "40P01" | "23505" | "25P02" => ErrorKind::TransactionAbort,
        s if s.starts_with("08") => ErrorKind::ConnectionError,
        s if s.starts_with("28") || s.starts_with("3D") || s.starts_with("58") => {
            ErrorKind::SetupError
        }
        _ => ErrorKind::GeneralError,
    }
}

/// Translate a native error into the crate taxonomy, keeping it as the cause
pub fn translate(dialect: &dyn Dialect, context: &str, error: NativeError) -> CoordError {
    let kind = dialect.classify(&error);
    let message = match &error.code {
        Some(code) => format!("{context}: {} ({code})", error.message),
        None => format!("{context}: {}", error.message),
    };
    let source: Option<BoxError> = Some(Box::new(error));
    match kind {
        ErrorKind::Interrupted => CoordError::Interrupted { message, source },
        ErrorKind::TransactionAbort => CoordError::TransactionAbort { message, source },
        ErrorKind::ConnectionError => CoordError::Connection { message, source },
        ErrorKind::SetupError => CoordError::Setup { message, source },
        _ => CoordError::General { message, source },
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(classify_sqlstate("08003"), ErrorKind::Interrupted);
        for state in ["40001", "40P01", "23505", "25P02"] {
            assert_eq!(classify_sqlstate(state), ErrorKind::TransactionAbort);
        }
        assert_eq!(classify_sqlstate("08006"), ErrorKind::ConnectionError);
        assert_eq!(classify_sqlstate("28P01"), ErrorKind::SetupError);
        assert_eq!(classify_sqlstate("42P01"), ErrorKind::GeneralError);
    }

    #[test]
    fn test_translate_keeps_cause() {
        use std::error::Error as _;

        let err = translate(
            &PostgresDialect,
            "Executing insert",
            NativeError::new(Some("40P01"), "deadlock detected"),
        );
        assert_eq!(err.kind(), ErrorKind::TransactionAbort);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("deadlock detected"));
        assert!(err.source().is_some());

        let err = translate(&PostgresDialect, "x", NativeError::new(None, "driver bug"));
        assert_eq!(err.kind(), ErrorKind::GeneralError);

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let native = NativeError::new(Some("08006"), "connection failure").with_source(Box::new(io));
        assert!(native.source().is_some());
        let err = translate(&PostgresDialect, "Executing select", native);
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn test_row_set_access() {
        let rows = RowSet::new(
            vec!["id".to_string(), "name".to_string()],
            vec![
                vec![Value::Int(1), Value::from("a")],
                vec![Value::Int(2), Value::from("b")],
            ],
        );
        assert_eq!(rows.get(1, "name"), Some(&Value::from("b")));
        assert_eq!(rows.get(0, "missing"), None);
        assert_eq!(ExecuteResult::Rows(rows).update_count(), 2);
    }

    #[test]
    fn test_postgres_maintenance_statements() {
        assert_eq!(PostgresDialect.analyze_statement("jobs"), "ANALYZE jobs");
        assert_eq!(PostgresDialect.reindex_statement("jobs"), "REINDEX TABLE jobs");
    }
}
