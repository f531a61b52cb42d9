//! Self-healing coordination session
//!
//! [`CoordinationSession`] wraps a client and tracks every ephemeral node this
//! process created. When the service reports the session expired (or the
//! connection lost), the session reconnects and retries the operation.
//!
//! Plain ephemeral nodes (active markers) are re-created at their exact
//! paths; if one cannot be, the triggering call fails with
//! [`CoordError::LockLost`]. Sequential nodes (lock requests) are never
//! re-created: their place in the queue is gone and another member may
//! already have been granted the lock in the gap. They are recorded as lost
//! and the owning lock reports [`CoordError::LockLost`] on its next use.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::client::{
    ClientError, ClientResult, CoordinationClient, Connector, CreateMode, Watcher,
};
use crate::common::{CoordError, Result};

const MAX_ATTEMPTS: usize = 3;

/// Create every missing ancestor of `path` (and `path` itself) as persistent nodes
fn ensure_with(client: &dyn CoordinationClient, path: &str) -> ClientResult<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(part);
        match client.create(&current, b"", CreateMode::Persistent) {
            Ok(_) | Err(ClientError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub struct CoordinationSession {
    connector: Arc<dyn Connector>,
    session_timeout: Duration,
    client: RwLock<Arc<dyn CoordinationClient>>,
    /// Ephemeral nodes this process believes it owns, with their data and mode
    owned: Mutex<BTreeMap<String, (Vec<u8>, CreateMode)>>,
    /// Ephemeral nodes that did not survive a reconnect
    lost: Mutex<HashSet<String>>,
    generation: AtomicU64,
    reconnecting: Mutex<()>,
}

impl CoordinationSession {
    pub fn connect(connector: Arc<dyn Connector>, session_timeout: Duration) -> Result<Self> {
        let client = connector
            .connect(session_timeout)
            .map_err(|e| CoordError::CoordinationUnavailable {
                message: format!("cannot open session: {e}"),
            })?;
        log::info!("Coordination session {} established", client.session_id());
        Ok(Self {
            connector,
            session_timeout,
            client: RwLock::new(client),
            owned: Mutex::new(BTreeMap::new()),
            lost: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
            reconnecting: Mutex::new(()),
        })
    }

    /// Incremented on every reconnect
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> u64 {
        self.client.read().session_id()
    }

    pub fn owns(&self, path: &str) -> bool {
        self.owned.lock().contains_key(path)
    }

    /// Whether `path` was lost in a reconnect; clears the record
    pub fn take_lost(&self, path: &str) -> bool {
        self.lost.lock().remove(path)
    }

    /// Lost nodes not yet claimed by their owners, sorted
    pub fn lost_nodes(&self) -> Vec<String> {
        let mut lost: Vec<String> = self.lost.lock().iter().cloned().collect();
        lost.sort();
        lost
    }

    /// Replace a lost session, re-creating owned plain ephemeral nodes
    fn reconnect(&self, seen_generation: u64, cause: &ClientError) -> Result<()> {
        let _guard = self.reconnecting.lock();
        if self.generation() != seen_generation {
            return Ok(());
        }
        log::warn!("Coordination session lost ({cause}), reconnecting");

        self.client.read().close();
        let client = self
            .connector
            .connect(self.session_timeout)
            .map_err(|e| CoordError::CoordinationUnavailable {
                message: format!("reconnect failed: {e}"),
            })?;

        let owned = self.owned.lock().clone();
        let mut lost = Vec::new();
        let mut dropped = Vec::new();
        for (path, (data, mode)) in &owned {
            if *mode == CreateMode::EphemeralSequential {
                log::warn!("Lock request '{path}' lost with the expired session");
                dropped.push(path.clone());
                continue;
            }
            let parent = super::client::split_path(path).0;
            let recreated = ensure_with(client.as_ref(), parent)
                .and_then(|_| client.create(path, data, CreateMode::Ephemeral));
            match recreated {
                Ok(_) => {}
                Err(e) if e.needs_reconnect() => {
                    return Err(CoordError::CoordinationUnavailable {
                        message: format!("session lost again while re-asserting '{path}': {e}"),
                    });
                }
                Err(e) => {
                    log::warn!("Could not re-assert ephemeral node '{path}': {e}");
                    lost.push(path.clone());
                }
            }
        }

        log::info!(
            "Coordination session {} replaced session {}, re-asserted {} nodes",
            client.session_id(),
            self.client.read().session_id(),
            owned.len() - lost.len() - dropped.len()
        );
        *self.client.write() = client;
        self.generation.fetch_add(1, Ordering::AcqRel);

        {
            let mut owned = self.owned.lock();
            let mut lost_set = self.lost.lock();
            for path in lost.iter().chain(&dropped) {
                owned.remove(path);
                lost_set.insert(path.clone());
            }
        }
        if lost.is_empty() {
            return Ok(());
        }
        Err(CoordError::LockLost {
            key: lost.join(", "),
            message: "ephemeral node could not be re-created after session loss".to_string(),
        })
    }

    /// Run `op`, reconnecting on session loss. The outer result carries
    /// session failures, the inner one node-level outcomes.
    fn run<T>(
        &self,
        mut op: impl FnMut(&dyn CoordinationClient) -> ClientResult<T>,
    ) -> Result<ClientResult<T>> {
        let mut last = ClientError::ConnectionLoss;
        for _ in 0..MAX_ATTEMPTS {
            let generation = self.generation();
            let client = self.client.read().clone();
            match op(client.as_ref()) {
                Err(e) if e.needs_reconnect() => {
                    self.reconnect(generation, &e)?;
                    last = e;
                }
                outcome => return Ok(outcome),
            }
        }
        Err(CoordError::CoordinationUnavailable {
            message: format!("giving up after {MAX_ATTEMPTS} attempts: {last}"),
        })
    }

    /// Create `path` and its missing ancestors as persistent nodes
    pub fn ensure_path(&self, path: &str) -> Result<()> {
        self.run(|client| ensure_with(client, path))?
            .map_err(CoordError::from)
    }

    /// Create a node; `Ok(None)` if it already exists. Missing parents are
    /// created, again if another member prunes them in between.
    pub fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<Option<String>> {
        let outcome = self.run(|client| {
            let mut attempts = 0;
            loop {
                match client.create(path, data, mode) {
                    Err(ClientError::NoNode(missing)) if attempts < MAX_ATTEMPTS => {
                        log::debug!("Creating missing parent '{missing}' of '{path}'");
                        ensure_with(client, super::client::split_path(path).0)?;
                        attempts += 1;
                    }
                    other => return other,
                }
            }
        })?;
        match outcome {
            Ok(actual) => {
                if mode.is_ephemeral() {
                    self.owned
                        .lock()
                        .insert(actual.clone(), (data.to_vec(), mode));
                }
                Ok(Some(actual))
            }
            Err(ClientError::NodeExists(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a node; `Ok(false)` if it did not exist
    pub fn delete(&self, path: &str) -> Result<bool> {
        self.owned.lock().remove(path);
        self.lost.lock().remove(path);
        match self.run(|client| client.delete(path))? {
            Ok(()) => Ok(true),
            Err(ClientError::NoNode(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `path` only if it has no children; `Ok(false)` if it has
    /// children or is already gone
    pub fn delete_if_empty(&self, path: &str) -> Result<bool> {
        match self.run(|client| client.delete(path))? {
            Ok(()) => Ok(true),
            Err(ClientError::NoNode(_) | ClientError::NotEmpty(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Check existence, arming a single-shot watch when given one
    pub fn exists(&self, path: &str, watch: Option<Watcher>) -> Result<bool> {
        let mut watch = watch;
        self.run(|client| client.exists(path, watch.take()))?
            .map_err(CoordError::from)
    }

    /// Child names; empty if `path` does not exist
    pub fn get_children(&self, path: &str) -> Result<Vec<String>> {
        match self.run(|client| client.get_children(path))? {
            Ok(children) => Ok(children),
            Err(ClientError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.run(|client| client.get_data(path))? {
            Ok(data) => Ok(Some(data)),
            Err(ClientError::NoNode(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite node data; `Ok(false)` if the node does not exist
    pub fn set_data(&self, path: &str, data: &[u8]) -> Result<bool> {
        match self.run(|client| client.set_data(path, data))? {
            Ok(()) => Ok(true),
            Err(ClientError::NoNode(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// End the session; ephemeral nodes go away with it
    pub fn close(&self) {
        self.owned.lock().clear();
        self.client.read().close();
    }
}
