//! In-process coordination service
//!
//! A [`MemoryCoordinator`] is the shared server; every call to
//! [`Connector::connect`] opens a new session on it. Several lock services in
//! one process can share a coordinator to behave like separate cluster
//! members, and tests can expire sessions or cut the service off entirely.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::client::{
    ClientError, ClientResult, CoordinationClient, Connector, CreateMode, WatchEvent, Watcher,
    split_path,
};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<u64>) -> Self {
        Self {
            data,
            owner,
            next_sequence: 0,
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    live_sessions: HashSet<u64>,
    next_session: u64,
    watches: HashMap<String, Vec<(u64, Watcher)>>,
    unavailable: bool,
}

type Fired = Vec<(Watcher, WatchEvent)>;

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            live_sessions: HashSet::new(),
            next_session: 1,
            watches: HashMap::new(),
            unavailable: false,
        }
    }

    fn check_session(&self, session: u64) -> ClientResult<()> {
        if self.unavailable {
            return Err(ClientError::ConnectionLoss);
        }
        if !self.live_sessions.contains(&session) {
            return Err(ClientError::SessionExpired);
        }
        Ok(())
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn take_watches(&mut self, path: &str, event: WatchEvent, fired: &mut Fired) {
        if let Some(watchers) = self.watches.remove(path) {
            fired.extend(
                watchers
                    .into_iter()
                    .map(|(_, watcher)| (watcher, event.clone())),
            );
        }
    }

    fn remove_node(&mut self, path: &str, fired: &mut Fired) {
        self.nodes.remove(path);
        self.take_watches(path, WatchEvent::NodeDeleted(path.to_string()), fired);
    }

    /// Drop a session, its ephemeral nodes and its pending watches
    fn end_session(&mut self, session: u64, fired: &mut Fired) {
        if !self.live_sessions.remove(&session) {
            return;
        }
        let ephemeral: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemeral {
            self.remove_node(&path, fired);
        }
        for watchers in self.watches.values_mut() {
            let (expired, kept): (Vec<_>, Vec<_>) =
                watchers.drain(..).partition(|(owner, _)| *owner == session);
            *watchers = kept;
            fired.extend(
                expired
                    .into_iter()
                    .map(|(_, watcher)| (watcher, WatchEvent::SessionExpired)),
            );
        }
        self.watches.retain(|_, watchers| !watchers.is_empty());
    }
}

fn fire(fired: Fired) {
    for (watcher, event) in fired {
        watcher(event);
    }
}

/// Shared in-process coordination service
#[derive(Clone)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Expire a session as the service would after missed heartbeats
    pub fn expire_session(&self, session: u64) {
        let mut fired = Vec::new();
        self.tree.lock().end_session(session, &mut fired);
        log::debug!("Expired coordination session {session}");
        fire(fired);
    }

    /// Simulate an outage: every operation and connection attempt fails
    pub fn set_unavailable(&self, unavailable: bool) {
        self.tree.lock().unavailable = unavailable;
    }

    pub fn live_sessions(&self) -> Vec<u64> {
        self.tree.lock().live_sessions.iter().copied().collect()
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// Children of `path` in name order
    pub fn children(&self, path: &str) -> Vec<String> {
        let mut children = self.tree.lock().children(path);
        children.sort();
        children
    }
}

impl Connector for MemoryCoordinator {
    fn connect(&self, _session_timeout: Duration) -> ClientResult<Arc<dyn CoordinationClient>> {
        let mut tree = self.tree.lock();
        if tree.unavailable {
            return Err(ClientError::ConnectionLoss);
        }
        let session_id = tree.next_session;
        tree.next_session += 1;
        tree.live_sessions.insert(session_id);
        log::debug!("Opened coordination session {session_id}");
        Ok(Arc::new(MemoryClient {
            coordinator: self.clone(),
            session_id,
        }))
    }
}

/// A session on a [`MemoryCoordinator`]
pub struct MemoryClient {
    coordinator: MemoryCoordinator,
    session_id: u64,
}

impl CoordinationClient for MemoryClient {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> ClientResult<String> {
        let mut fired = Vec::new();
        let actual = {
            let mut tree = self.coordinator.tree.lock();
            tree.check_session(self.session_id)?;
            let (parent_path, _) = split_path(path);
            let parent = tree
                .nodes
                .get_mut(parent_path)
                .ok_or_else(|| ClientError::NoNode(parent_path.to_string()))?;
            let sequence = parent.next_sequence;
            parent.next_sequence += 1;
            let actual = match mode {
                CreateMode::EphemeralSequential => format!("{path}{sequence:010}"),
                _ => path.to_string(),
            };
            if tree.nodes.contains_key(&actual) {
                return Err(ClientError::NodeExists(actual));
            }
            let owner = mode.is_ephemeral().then_some(self.session_id);
            tree.nodes
                .insert(actual.clone(), Node::new(data.to_vec(), owner));
            tree.take_watches(&actual, WatchEvent::NodeCreated(actual.clone()), &mut fired);
            actual
        };
        fire(fired);
        Ok(actual)
    }

    fn delete(&self, path: &str) -> ClientResult<()> {
        let mut fired = Vec::new();
        {
            let mut tree = self.coordinator.tree.lock();
            tree.check_session(self.session_id)?;
            if !tree.nodes.contains_key(path) {
                return Err(ClientError::NoNode(path.to_string()));
            }
            if !tree.children(path).is_empty() {
                return Err(ClientError::NotEmpty(path.to_string()));
            }
            tree.remove_node(path, &mut fired);
        }
        fire(fired);
        Ok(())
    }

    fn exists(&self, path: &str, watch: Option<Watcher>) -> ClientResult<bool> {
        let mut tree = self.coordinator.tree.lock();
        tree.check_session(self.session_id)?;
        let exists = tree.nodes.contains_key(path);
        if let Some(watcher) = watch {
            tree.watches
                .entry(path.to_string())
                .or_default()
                .push((self.session_id, watcher));
        }
        Ok(exists)
    }

    fn get_children(&self, path: &str) -> ClientResult<Vec<String>> {
        let tree = self.coordinator.tree.lock();
        tree.check_session(self.session_id)?;
        if !tree.nodes.contains_key(path) {
            return Err(ClientError::NoNode(path.to_string()));
        }
        Ok(tree.children(path))
    }

    fn get_data(&self, path: &str) -> ClientResult<Vec<u8>> {
        let tree = self.coordinator.tree.lock();
        tree.check_session(self.session_id)?;
        tree.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| ClientError::NoNode(path.to_string()))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> ClientResult<()> {
        let mut tree = self.coordinator.tree.lock();
        tree.check_session(self.session_id)?;
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClientError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        Ok(())
    }

    fn close(&self) {
        let mut fired = Vec::new();
        self.coordinator
            .tree
            .lock()
            .end_session(self.session_id, &mut fired);
        fire(fired);
    }
}
