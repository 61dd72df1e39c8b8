//! Ad-hoc container action listener.
//!
//! Request nodes under `/docker/actions/{host}` carry a container id and a
//! command. The agent runs the command inside the container under a wall
//! clock; success writes the output and deletes the node, failure records
//! the error and leaves the node for inspection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use stevedore_coord::{paths, Connection, WatchEvent};
use stevedore_domain::{Action, ActionId};

use crate::engine::ContainerEngine;

pub struct ActionListener {
    conn: Connection,
    engine: Arc<dyn ContainerEngine>,
    host_id: String,
    timeout: Duration,
}

impl ActionListener {
    pub fn new(
        conn: Connection,
        engine: Arc<dyn ContainerEngine>,
        host_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            conn,
            engine,
            host_id: host_id.into(),
            timeout,
        }
    }

    pub async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let path = paths::actions_path(&self.host_id);
        if let Err(e) = self.conn.ensure_path(&path) {
            warn!(error = %e, "Could not create actions path");
            return;
        }

        let (done_tx, mut done_rx) = mpsc::channel::<ActionId>(16);
        let mut in_flight: HashSet<ActionId> = HashSet::new();

        loop {
            let (action_ids, watch) = match self.conn.children_w(&path) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Action watch failed");
                    return;
                }
            };

            for raw in action_ids {
                let Ok(action_id) = raw.parse::<ActionId>() else {
                    warn!(node = %raw, "Ignoring malformed action node");
                    continue;
                };
                if in_flight.insert(action_id) {
                    let listener = Arc::clone(&self);
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        listener.run_action(&action_id).await;
                        let _ = done.send(action_id).await;
                    });
                }
            }

            tokio::select! {
                event = watch.wait() => match event {
                    WatchEvent::Deleted | WatchEvent::SessionLost => return,
                    _ => continue,
                },
                Some(finished) = done_rx.recv() => {
                    in_flight.remove(&finished);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_action(&self, action_id: &ActionId) {
        let path = paths::action_path(&self.host_id, action_id);
        let mut action: Action = match self.conn.get(&path) {
            Ok(a) => a,
            Err(e) => {
                if !e.is_no_node() {
                    warn!(action_id = %action_id, error = %e, "Could not load action");
                }
                return;
            }
        };
        // Failed actions stay on the tree for inspection; do not re-run
        // them on every children event.
        if action.error.is_some() {
            return;
        }

        debug!(
            action_id = %action_id,
            docker_id = %action.docker_id,
            command = ?action.command,
            "Running container action"
        );
        let run = self.engine.attach_and_run(&action.docker_id, &action.command);
        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => {
                info!(action_id = %action_id, "Action succeeded");
                action.output = Some(output);
                if let Err(e) = self.conn.set(&path, &action) {
                    warn!(action_id = %action_id, error = %e, "Could not record action output");
                    return;
                }
                if let Err(e) = self.conn.delete(&path) {
                    if !e.is_no_node() {
                        warn!(action_id = %action_id, error = %e, "Could not remove action node");
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(action_id = %action_id, error = %e, "Action failed");
                action.error = Some(e.to_string());
                let _ = self.conn.set(&path, &action);
            }
            Err(_) => {
                warn!(action_id = %action_id, timeout_secs = self.timeout.as_secs(),
                    "Action timed out");
                action.error = Some(format!(
                    "action timed out after {}s",
                    self.timeout.as_secs()
                ));
                let _ = self.conn.set(&path, &action);
            }
        }
    }
}
