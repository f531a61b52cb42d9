//! Coordination service client capability
//!
//! The hierarchical-namespace operations the coordination lock backend needs:
//! persistent, ephemeral and sequential nodes, child listing, single-shot
//! existence watches and node data.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::common::CoordError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    /// Ephemeral with a monotonically increasing ten-digit suffix appended by the service
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

/// Why a watch fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NodeDeleted(String),
    NodeCreated(String),
    /// The session that armed the watch is gone; the watch will never fire again
    SessionExpired,
}

/// Single-shot watch callback
pub type Watcher = Box<dyn FnOnce(WatchEvent) + Send>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("node '{0}' does not exist")]
    NoNode(String),
    #[error("node '{0}' already exists")]
    NodeExists(String),
    #[error("node '{0}' has children")]
    NotEmpty(String),
    #[error("session expired")]
    SessionExpired,
    #[error("connection lost")]
    ConnectionLoss,
}

impl ClientError {
    /// Whether a new session has to be established before retrying
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, ClientError::SessionExpired | ClientError::ConnectionLoss)
    }
}

impl From<ClientError> for CoordError {
    fn from(err: ClientError) -> Self {
        CoordError::CoordinationUnavailable {
            message: err.to_string(),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// One session with the coordination service
pub trait CoordinationClient: Send + Sync {
    fn session_id(&self) -> u64;

    /// Create a node and return its actual path (sequential modes append a suffix)
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> ClientResult<String>;

    fn delete(&self, path: &str) -> ClientResult<()>;

    /// Check existence, optionally arming a watch that fires on the next
    /// creation or deletion of `path`
    fn exists(&self, path: &str, watch: Option<Watcher>) -> ClientResult<bool>;

    /// Child node names, unordered
    fn get_children(&self, path: &str) -> ClientResult<Vec<String>>;

    fn get_data(&self, path: &str) -> ClientResult<Vec<u8>>;

    fn set_data(&self, path: &str, data: &[u8]) -> ClientResult<()>;

    /// End the session; ephemeral nodes it owns are removed
    fn close(&self);
}

/// Opens sessions, used again whenever a session is lost
pub trait Connector: Send + Sync {
    fn connect(&self, session_timeout: Duration) -> ClientResult<Arc<dyn CoordinationClient>>;
}

/// Split a node path into its parent and its final name
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(split_path("/a/b/c"), ("/a/b", "c"));
        assert_eq!(split_path("/a"), ("/", "a"));
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_client_error_conversion() {
        assert!(ClientError::SessionExpired.needs_reconnect());
        assert!(!ClientError::NoNode("/x".to_string()).needs_reconnect());
        let err: CoordError = ClientError::ConnectionLoss.into();
        assert_eq!(err.kind(), crate::common::ErrorKind::CoordinationUnavailable);
    }
}
