//! Snapshot request listener.
//!
//! Requests arrive as nodes under `/snapshots` carrying a service id. The
//! leader performs the snapshot through the facade and writes `{label,
//! error}` back onto the request node. No retries here: the requester
//! observes the result node and applies its own policy.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use stevedore_coord::{paths, Connection, WatchEvent};
use stevedore_domain::{Snapshot, SnapshotId};

use crate::facade::Facade;

pub struct SnapshotListener {
    conn: Connection,
    facade: Arc<Facade>,
}

impl SnapshotListener {
    pub fn new(conn: Connection, facade: Arc<Facade>) -> Self {
        Self { conn, facade }
    }

    pub async fn listen(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.conn.ensure_path(paths::SNAPSHOTS_PATH) {
            warn!(error = %e, "Could not create snapshots path");
            return;
        }
        info!("Snapshot listener started");

        loop {
            let (request_ids, watch) = match self.conn.children_w(paths::SNAPSHOTS_PATH) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Snapshot watch failed");
                    return;
                }
            };

            for id in request_ids {
                self.process(&id);
            }

            tokio::select! {
                event = watch.wait() => match event {
                    WatchEvent::Deleted | WatchEvent::SessionLost => return,
                    _ => continue,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Snapshot listener shutting down");
                        return;
                    }
                }
            }
        }
    }

    fn process(&self, request_id: &str) {
        let Ok(id) = request_id.parse::<SnapshotId>() else {
            warn!(request_id, "Ignoring malformed snapshot request id");
            return;
        };
        let path = paths::snapshot_path(&id);
        let mut request: Snapshot = match self.conn.get(&path) {
            Ok(req) => req,
            Err(e) if e.is_no_node() => return,
            Err(e) => {
                warn!(request_id, error = %e, "Could not load snapshot request");
                return;
            }
        };
        if request.is_done() {
            return;
        }

        match self.facade.take_snapshot(&request.service_id) {
            Ok(label) => {
                info!(request_id, label = %label, "Snapshot request fulfilled");
                request.label = Some(label);
            }
            Err(e) => {
                warn!(request_id, error = %e, "Snapshot request failed");
                request.error = Some(e.to_string());
            }
        }
        if let Err(e) = self.conn.set(&path, &request) {
            warn!(request_id, error = %e, "Could not record snapshot result");
        }
    }
}
