//! Common types and error definitions for coordkit
//!
//! This module contains the lock modes, the crate-wide error taxonomy and the
//! configuration shared by the lock, database and cache layers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lock modes, ordered from weakest to strongest.
///
/// The ordering is used when the same key is requested in several roles of a
/// multi-key call: only the strongest mode is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared with other readers; excluded by writers of either kind
    Read,
    /// Shared with other non-exclusive writers; excludes readers and writers
    NonExWrite,
    /// Exclusive
    Write,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Read => "read",
            LockMode::NonExWrite => "non-exclusive write",
            LockMode::Write => "write",
        }
    }
}

/// Which side of the process boundary a contended lock is held on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// Another thread in this process holds or is queued for the lock
    Local,
    /// Another process holds the lock
    Remote,
}

/// Outcome of a single lock transition attempt.
///
/// `Expired` means the pooled object was evicted while the caller held a
/// reference to it; the caller fetches a fresh object and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Acquired,
    WouldBlock(Contention),
    Expired,
}

/// What the filesystem backend does when it cannot write or delete a lock file
/// after the logical state change already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailStopPolicy {
    /// Log and terminate the process with exit code -100
    Exit,
    /// Mark the backend unhealthy; every later operation fails with a setup error
    Poison,
}

/// Stable error-kind codes surfaced to operational tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Interrupted,
    LockUnavailable,
    IllegalLockSequence,
    TransactionAbort,
    ConnectionError,
    SetupError,
    GeneralError,
    LockLost,
    CoordinationUnavailable,
    Io,
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for coordkit operations
#[derive(Error, Debug)]
pub enum CoordError {
    /// Cooperative cancellation reached a wait point
    #[error("Interrupted: {message}")]
    Interrupted {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Lock '{key}' is held by another thread in this process")]
    LocalLockUnavailable { key: String },

    #[error("Lock '{key}' is held by another process")]
    RemoteLockUnavailable { key: String },

    #[error("Illegal {namespace} sequence on '{key}': {message}")]
    IllegalLockSequence {
        namespace: &'static str,
        key: String,
        message: String,
    },

    #[error("Transaction abort: {message}")]
    TransactionAbort {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Database connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Setup error: {message}")]
    Setup {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// An ephemeral node this process believed it owned could not be re-asserted
    #[error("Lock '{key}' lost: {message}")]
    LockLost { key: String, message: String },

    #[error("Coordination service unavailable: {message}")]
    CoordinationUnavailable { message: String },

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{message}")]
    General {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl CoordError {
    pub fn interrupted(message: impl Into<String>) -> Self {
        CoordError::Interrupted {
            message: message.into(),
            source: None,
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        CoordError::General {
            message: message.into(),
            source: None,
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        CoordError::Setup {
            message: message.into(),
            source: None,
        }
    }

    pub fn unavailable(key: &str, contention: Contention) -> Self {
        match contention {
            Contention::Local => CoordError::LocalLockUnavailable {
                key: key.to_string(),
            },
            Contention::Remote => CoordError::RemoteLockUnavailable {
                key: key.to_string(),
            },
        }
    }

    /// The stable kind code of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordError::Interrupted { .. } => ErrorKind::Interrupted,
            CoordError::LocalLockUnavailable { .. } | CoordError::RemoteLockUnavailable { .. } => {
                ErrorKind::LockUnavailable
            }
            CoordError::IllegalLockSequence { .. } => ErrorKind::IllegalLockSequence,
            CoordError::TransactionAbort { .. } => ErrorKind::TransactionAbort,
            CoordError::Connection { .. } => ErrorKind::ConnectionError,
            CoordError::Setup { .. } | CoordError::InvalidConfig { .. } => ErrorKind::SetupError,
            CoordError::LockLost { .. } => ErrorKind::LockLost,
            CoordError::CoordinationUnavailable { .. } => ErrorKind::CoordinationUnavailable,
            CoordError::Io(_) => ErrorKind::Io,
            CoordError::Serialization(_) | CoordError::General { .. } => ErrorKind::GeneralError,
        }
    }

    /// Check if the failed operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LockUnavailable | ErrorKind::TransactionAbort | ErrorKind::ConnectionError
        )
    }

    /// Check if this error reports a lock held elsewhere
    pub fn is_lock_unavailable(&self) -> bool {
        self.kind() == ErrorKind::LockUnavailable
    }

    /// Check if this error indicates a programming defect rather than a runtime condition
    pub fn is_defect(&self) -> bool {
        matches!(self, CoordError::IllegalLockSequence { .. })
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            CoordError::Interrupted { .. } => "interrupted",
            CoordError::LocalLockUnavailable { .. } => "local_lock_unavailable",
            CoordError::RemoteLockUnavailable { .. } => "remote_lock_unavailable",
            CoordError::IllegalLockSequence { .. } => "illegal_lock_sequence",
            CoordError::TransactionAbort { .. } => "transaction_abort",
            CoordError::Connection { .. } => "connection",
            CoordError::Setup { .. } => "setup",
            CoordError::LockLost { .. } => "lock_lost",
            CoordError::CoordinationUnavailable { .. } => "coordination",
            CoordError::Io(_) => "io",
            CoordError::Serialization(_) => "serialization",
            CoordError::InvalidConfig { .. } => "configuration",
            CoordError::General { .. } => "general",
        }
    }
}

/// Result type alias for coordkit operations
pub type Result<T> = std::result::Result<T, CoordError>;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Which mechanism backs cross-process locks, flags and shared data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockBackendKind {
    /// Single process; no cross-process visibility
    Memory,
    /// Lock files under a shared synchronization directory
    File { sync_dir: String },
    /// Sequential ephemeral nodes on a coordination service
    Coordination { session_timeout_ms: u64, root: String },
}

/// Database maintenance thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Local events accumulated before they are folded into the shared total
    pub commit_threshold: u64,
    pub default_reindex_threshold: u64,
    pub default_analyze_threshold: u64,
    /// Per-table reindex threshold overrides
    pub reindex_thresholds: HashMap<String, u64>,
    /// Per-table analyze threshold overrides
    pub analyze_thresholds: HashMap<String, u64>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            commit_threshold: 100,
            default_reindex_threshold: 250_000,
            default_analyze_threshold: 2_000,
            reindex_thresholds: HashMap::new(),
            analyze_thresholds: HashMap::new(),
        }
    }
}

/// Query result cache settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime applied to cached results that do not name their own
    pub default_ttl_ms: Option<u64>,
    /// Maximum number of entries kept per query class
    pub class_limits: HashMap<String, usize>,
}

/// Retry behaviour for database operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub abort_backoff_min_ms: u64,
    pub abort_backoff_max_ms: u64,
    /// Attempts made to acquire a connection before giving up
    pub connection_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            abort_backoff_min_ms: 500,
            abort_backoff_max_ms: 60_500,
            connection_attempts: 3,
        }
    }
}

/// Periodic maintenance driven by the background task manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    pub cache_expiry_interval_ms: u64,
    pub reaper_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Service types whose crashed members are reaped periodically
    pub reaped_service_types: Vec<String>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            cache_expiry_interval_ms: 10_000,
            reaper_interval_ms: 60_000,
            heartbeat_interval_ms: 5_000,
            reaped_service_types: Vec::new(),
        }
    }
}

/// Configuration for a coordkit instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub lock_backend: LockBackendKind,
    /// Sleep between attempts when another process holds a lock
    pub lock_retry_sleep_ms: u64,
    /// Sleep after an unexpected failure creating a lock mutex file
    pub file_mutex_backoff_ms: u64,
    /// Upper bound on how late a blocked wait notices an interrupt
    pub wait_poll_ms: u64,
    pub fail_stop: FailStopPolicy,
    /// How long a file-backend active marker stays valid without a heartbeat
    pub active_marker_ttl_ms: u64,
    pub maintenance: MaintenanceConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub background: BackgroundConfig,
}

impl Config {
    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        match &self.lock_backend {
            LockBackendKind::Memory => {}
            LockBackendKind::File { sync_dir } => {
                if sync_dir.is_empty() {
                    return Err(CoordError::InvalidConfig {
                        message: "Synchronization directory cannot be empty".to_string(),
                    });
                }
            }
            LockBackendKind::Coordination {
                session_timeout_ms,
                root,
            } => {
                if *session_timeout_ms == 0 {
                    return Err(CoordError::InvalidConfig {
                        message: "Session timeout must be greater than zero".to_string(),
                    });
                }
                if !root.starts_with('/') {
                    return Err(CoordError::InvalidConfig {
                        message: format!("Coordination root '{root}' must be an absolute path"),
                    });
                }
            }
        }

        if self.lock_retry_sleep_ms == 0 || self.file_mutex_backoff_ms == 0 || self.wait_poll_ms == 0
        {
            return Err(CoordError::InvalidConfig {
                message: "Lock retry, mutex backoff and wait poll intervals must be non-zero"
                    .to_string(),
            });
        }

        if self.active_marker_ttl_ms == 0 {
            return Err(CoordError::InvalidConfig {
                message: "Active marker TTL must be non-zero".to_string(),
            });
        }

        if self.maintenance.commit_threshold == 0 {
            return Err(CoordError::InvalidConfig {
                message: "Statistics commit threshold must be at least 1".to_string(),
            });
        }

        if self.retry.abort_backoff_max_ms < self.retry.abort_backoff_min_ms {
            return Err(CoordError::InvalidConfig {
                message: "Maximum abort backoff cannot be less than the minimum".to_string(),
            });
        }

        if self.retry.connection_attempts == 0 {
            return Err(CoordError::InvalidConfig {
                message: "Connection attempts must be at least 1".to_string(),
            });
        }

        if self.background.cache_expiry_interval_ms == 0
            || self.background.reaper_interval_ms == 0
            || self.background.heartbeat_interval_ms == 0
        {
            return Err(CoordError::InvalidConfig {
                message: "Background intervals must be non-zero".to_string(),
            });
        }

        if self.background.heartbeat_interval_ms >= self.active_marker_ttl_ms {
            log::warn!(
                "Heartbeat interval ({} ms) is not shorter than the active marker TTL ({} ms), live services may appear inactive",
                self.background.heartbeat_interval_ms,
                self.active_marker_ttl_ms
            );
        }

        Ok(())
    }

    /// Create a configuration for a single process with in-memory locks
    pub fn single_process() -> Self {
        Self::default()
    }

    /// Create a configuration sharing locks through a synchronization directory
    pub fn file_based(sync_dir: impl Into<String>) -> Result<Self> {
        let config = Self {
            lock_backend: LockBackendKind::File {
                sync_dir: sync_dir.into(),
            },
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration using a coordination service rooted at `root`
    pub fn coordinated(root: impl Into<String>) -> Result<Self> {
        let config = Self {
            lock_backend: LockBackendKind::Coordination {
                session_timeout_ms: 30_000,
                root: root.into(),
            },
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_backend: LockBackendKind::Memory,
            lock_retry_sleep_ms: 10,
            file_mutex_backoff_ms: 100,
            wait_poll_ms: 50,
            fail_stop: FailStopPolicy::Exit,
            active_marker_ttl_ms: 30_000,
            maintenance: MaintenanceConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_strength_order() {
        assert!(LockMode::Write > LockMode::NonExWrite);
        assert!(LockMode::NonExWrite > LockMode::Read);
        assert_eq!(
            [LockMode::Read, LockMode::Write, LockMode::NonExWrite]
                .into_iter()
                .max(),
            Some(LockMode::Write)
        );
    }

    #[test]
    fn test_error_kinds() {
        let err = CoordError::unavailable("k", Contention::Local);
        assert_eq!(err.kind(), ErrorKind::LockUnavailable);
        assert_eq!(err.category(), "local_lock_unavailable");
        assert!(err.is_retryable());

        let err = CoordError::IllegalLockSequence {
            namespace: "lock",
            key: "k".to_string(),
            message: "write while holding read".to_string(),
        };
        assert!(err.is_defect());
        assert!(!err.is_retryable());

        let err = CoordError::interrupted("stop");
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_preserves_cause() {
        use std::error::Error as _;

        let err = CoordError::Connection {
            message: "severed".to_string(),
            source: Some(Box::new(std::io::Error::other("reset by peer"))),
        };
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.maintenance.commit_threshold, 100);
        assert_eq!(config.retry.abort_backoff_max_ms, 60_500);
    }

    #[test]
    fn test_config_presets() {
        let config = Config::file_based("/tmp/sync").unwrap();
        assert!(matches!(config.lock_backend, LockBackendKind::File { .. }));

        assert!(Config::file_based("").is_err());
        assert!(Config::coordinated("relative").is_err());
        assert!(Config::coordinated("/coordkit").is_ok());
    }

    #[test]
    fn test_config_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.retry.abort_backoff_min_ms = 1000;
        config.retry.abort_backoff_max_ms = 10;
        assert!(matches!(
            config.validate(),
            Err(CoordError::InvalidConfig { .. })
        ));
    }
}
