//! In-process hierarchical node store.
//!
//! Plays the role of the coordination server for tests and single-process
//! deployments: a tree of nodes with byte payloads, per-session ephemeral
//! ownership, and one-shot watches. All cluster-visible state transits
//! through this tree.
//!
//! # Invariants
//!
//! - A node's parent exists for as long as the node does.
//! - Ephemeral nodes disappear when their owning session closes, firing the
//!   same watches an explicit delete would.
//! - Watches are one-shot: each registered watch receives exactly one event
//!   (or `SessionLost` when the registering session dies first).

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::{CoordError, WatchEvent};

/// A one-shot watch handle returned by `get_w`/`children_w`. Await it with
/// [`Watch::wait`]; re-arm by issuing the read again.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub async fn wait(self) -> WatchEvent {
        // A dropped sender means the store (and session) went away.
        self.rx.await.unwrap_or(WatchEvent::SessionLost)
    }
}

struct WatchSender {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Node {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
    data_watches: Vec<WatchSender>,
    child_watches: Vec<WatchSender>,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    sessions: Vec<u64>,
    next_session: u64,
}

/// The shared node tree. One per [`crate::Client`].
pub(crate) struct Directory {
    state: Mutex<State>,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn child_names(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter_map(|(k, _)| {
            let name = &k[prefix.len()..];
            (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
        })
        .collect()
}

fn fire(watches: &mut Vec<WatchSender>, event: WatchEvent) {
    for watch in watches.drain(..) {
        let _ = watch.tx.send(event);
    }
}

impl Directory {
    pub(crate) fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert("/".to_string(), Node::default());
        Self {
            state: Mutex::new(state),
        }
    }

    pub(crate) fn open_session(&self) -> u64 {
        let mut state = self.state.lock().expect("directory lock poisoned");
        state.next_session += 1;
        let session = state.next_session;
        state.sessions.push(session);
        session
    }

    /// Ends a session: every ephemeral node it owns is deleted and every
    /// watch it registered fires `SessionLost`.
    pub(crate) fn close_session(&self, session: u64) {
        let mut state = self.state.lock().expect("directory lock poisoned");
        state.sessions.retain(|s| *s != session);

        let mut ephemeral: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        // Deepest first so parents empty out before removal.
        ephemeral.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for path in ephemeral {
            Self::remove_node(&mut state, &path);
        }

        for node in state.nodes.values_mut() {
            for list in [&mut node.data_watches, &mut node.child_watches] {
                let mut kept = Vec::with_capacity(list.len());
                for watch in list.drain(..) {
                    if watch.session == session {
                        let _ = watch.tx.send(WatchEvent::SessionLost);
                    } else {
                        kept.push(watch);
                    }
                }
                *list = kept;
            }
        }
    }

    fn check_session(state: &State, session: u64) -> Result<(), CoordError> {
        if state.sessions.contains(&session) {
            Ok(())
        } else {
            Err(CoordError::ConnectionLost)
        }
    }

    fn remove_node(state: &mut State, path: &str) {
        let Some(mut node) = state.nodes.remove(path) else {
            return;
        };
        fire(&mut node.data_watches, WatchEvent::Deleted);
        fire(&mut node.child_watches, WatchEvent::Deleted);
        if let Some(parent) = state.nodes.get_mut(parent_of(path)) {
            fire(&mut parent.child_watches, WatchEvent::ChildrenChanged);
        }
    }

    pub(crate) fn create(
        &self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        ephemeral: bool,
    ) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        if state.nodes.contains_key(path) {
            return Err(CoordError::NodeExists(path.to_string()));
        }
        let parent = parent_of(path);
        if !state.nodes.contains_key(parent) {
            return Err(CoordError::NoNode(parent.to_string()));
        }
        state.nodes.insert(
            path.to_string(),
            Node {
                data,
                owner: ephemeral.then_some(session),
                ..Node::default()
            },
        );
        if let Some(parent) = state.nodes.get_mut(parent) {
            fire(&mut parent.child_watches, WatchEvent::ChildrenChanged);
        }
        Ok(())
    }

    pub(crate) fn ensure_path(&self, session: u64, path: &str) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !state.nodes.contains_key(&current) {
                state.nodes.insert(current.clone(), Node::default());
                if let Some(parent) = state.nodes.get_mut(parent_of(&current)) {
                    fire(&mut parent.child_watches, WatchEvent::ChildrenChanged);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, session: u64, path: &str) -> Result<Vec<u8>, CoordError> {
        let state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    pub(crate) fn get_w(
        &self,
        session: u64,
        path: &str,
    ) -> Result<(Vec<u8>, Watch), CoordError> {
        let mut state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        let data = node.data.clone();
        let (tx, rx) = oneshot::channel();
        node.data_watches.push(WatchSender { session, tx });
        Ok((data, Watch { rx }))
    }

    pub(crate) fn set(&self, session: u64, path: &str, data: Vec<u8>) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        node.data = data;
        fire(&mut node.data_watches, WatchEvent::DataChanged);
        Ok(())
    }

    pub(crate) fn delete(&self, session: u64, path: &str) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        if !child_names(&state.nodes, path).is_empty() {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        Self::remove_node(&mut state, path);
        Ok(())
    }

    /// Deletes a subtree, leaves first. Missing nodes are fine.
    pub(crate) fn delete_recursive(&self, session: u64, path: &str) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        let prefix = format!("{path}/");
        let mut doomed: Vec<String> = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if state.nodes.contains_key(path) {
            doomed.push(path.to_string());
        }
        doomed.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for path in doomed {
            Self::remove_node(&mut state, &path);
        }
        Ok(())
    }

    pub(crate) fn children(&self, session: u64, path: &str) -> Result<Vec<String>, CoordError> {
        let state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        Ok(child_names(&state.nodes, path))
    }

    pub(crate) fn children_w(
        &self,
        session: u64,
        path: &str,
    ) -> Result<(Vec<String>, Watch), CoordError> {
        let mut state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        if !state.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        let names = child_names(&state.nodes, path);
        let (tx, rx) = oneshot::channel();
        let node = state.nodes.get_mut(path).expect("node checked above");
        node.child_watches.push(WatchSender { session, tx });
        Ok((names, Watch { rx }))
    }

    pub(crate) fn exists(&self, session: u64, path: &str) -> Result<bool, CoordError> {
        let state = self.state.lock().expect("directory lock poisoned");
        Self::check_session(&state, session)?;
        Ok(state.nodes.contains_key(path))
    }
}
