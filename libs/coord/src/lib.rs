//! # stevedore-coord
//!
//! Thin client facade over the hierarchical coordination store that carries
//! all cluster-visible state: service mirrors, instance records, host
//! liveness, virtual-IP ownership, snapshot and action requests.
//!
//! The surface is deliberately small:
//!
//! - `create` / `create_ephemeral` — write a node with a serde payload;
//!   ephemeral nodes are tied to the session and disappear when it ends.
//! - `get_w` / `children_w` — read plus a **one-shot** watch that fires on
//!   the next data change, deletion, or child-set change. Watchers re-arm by
//!   reading again.
//! - `set` / `delete` / `children` / `exists` — the rest of the usual tree
//!   operations.
//!
//! Construction is explicit (`Client::new(config)` then `connect()`); there
//! is no hidden global. The in-process [`memory`] tree backs the client; a
//! networked store implements the same surface for multi-host deployments.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

mod error;
mod memory;
pub mod paths;

pub use error::CoordError;
pub use memory::Watch;

use memory::Directory;

/// The default session timeout: ephemeral nodes from a lost session are gone
/// within this bound.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15);

/// Event delivered by a one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    DataChanged,
    ChildrenChanged,
    Deleted,
    /// The watching session ended; the watcher restarts from the top.
    SessionLost,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub session_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

/// Handle to the coordination store. Cheap to clone; every clone shares the
/// same tree.
#[derive(Clone)]
pub struct Client {
    dir: Arc<Directory>,
    config: Config,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            dir: Arc::new(Directory::new()),
            config,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.config.session_timeout
    }

    /// Opens a new session.
    pub fn connect(&self) -> Result<Connection, CoordError> {
        let session = self.dir.open_session();
        Ok(Connection {
            inner: Arc::new(ConnInner {
                dir: Arc::clone(&self.dir),
                session,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

struct ConnInner {
    dir: Arc<Directory>,
    session: u64,
    closed: AtomicBool,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.dir.close_session(self.session);
        }
    }
}

/// One session against the coordination store. Clones share the session;
/// the session closes when the last clone drops (or on [`Connection::close`]).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    fn session(&self) -> u64 {
        self.inner.session
    }

    /// Creates a node with a serialized payload. The parent must exist.
    pub fn create<T: Serialize>(&self, path: &str, payload: &T) -> Result<(), CoordError> {
        let data = serde_json::to_vec(payload)?;
        self.inner.dir.create(self.session(), path, data, false)
    }

    /// Creates a session-bound node: it is deleted when this session ends.
    pub fn create_ephemeral<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<(), CoordError> {
        let data = serde_json::to_vec(payload)?;
        self.inner.dir.create(self.session(), path, data, true)
    }

    /// Creates any missing directories along `path`.
    pub fn ensure_path(&self, path: &str) -> Result<(), CoordError> {
        self.inner.dir.ensure_path(self.session(), path)
    }

    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CoordError> {
        let data = self.inner.dir.get(self.session(), path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Reads a node and arms a one-shot watch for its next data change or
    /// deletion.
    pub fn get_w<T: DeserializeOwned>(&self, path: &str) -> Result<(T, Watch), CoordError> {
        let (data, watch) = self.inner.dir.get_w(self.session(), path)?;
        Ok((serde_json::from_slice(&data)?, watch))
    }

    pub fn set<T: Serialize>(&self, path: &str, payload: &T) -> Result<(), CoordError> {
        let data = serde_json::to_vec(payload)?;
        self.inner.dir.set(self.session(), path, data)
    }

    /// Deletes a childless node.
    pub fn delete(&self, path: &str) -> Result<(), CoordError> {
        self.inner.dir.delete(self.session(), path)
    }

    /// Deletes a subtree; a missing target is not an error.
    pub fn delete_recursive(&self, path: &str) -> Result<(), CoordError> {
        self.inner.dir.delete_recursive(self.session(), path)
    }

    pub fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        self.inner.dir.children(self.session(), path)
    }

    /// Lists children and arms a one-shot watch for the next child-set
    /// change or deletion of the node itself.
    pub fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch), CoordError> {
        self.inner.dir.children_w(self.session(), path)
    }

    pub fn exists(&self, path: &str) -> Result<bool, CoordError> {
        self.inner.dir.exists(self.session(), path)
    }

    /// Ends the session, deleting its ephemeral nodes.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.dir.close_session(self.inner.session);
        }
    }

    /// Simulates an abrupt session loss (network partition, process death).
    /// Identical to `close` from the store's point of view; kept separate so
    /// failover tests read as what they are.
    pub fn expire(&self) {
        self.close();
    }
}
