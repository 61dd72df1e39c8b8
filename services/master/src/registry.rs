//! Host registry listener.
//!
//! Gives the leader a live view of which hosts in the pool are available to
//! receive work. Agents register ephemeral nodes under
//! `/pools/{pool}/hosts`; this listener watches the child set, resolves each
//! id through the entity store (skipping ids that no longer resolve), and
//! caches the result behind a mutex for `hosts()`.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use stevedore_coord::{paths, Connection, WatchEvent};
use stevedore_domain::Host;

use crate::store::EntityStore;

pub struct HostRegistryListener {
    conn: Connection,
    store: EntityStore,
    pool_id: String,
    hosts: Arc<Mutex<Vec<Host>>>,
}

impl HostRegistryListener {
    pub fn new(conn: Connection, store: EntityStore, pool_id: impl Into<String>) -> Self {
        Self {
            conn,
            store,
            pool_id: pool_id.into(),
            hosts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The most recently observed set of live hosts.
    pub fn hosts(&self) -> Vec<Host> {
        self.hosts.lock().expect("registry lock poisoned").clone()
    }

    /// Runs the watcher loop until shutdown or session loss.
    pub async fn listen(&self, mut shutdown: watch::Receiver<bool>) {
        let path = paths::pool_hosts_path(&self.pool_id);
        if let Err(e) = self.conn.ensure_path(&path) {
            warn!(error = %e, pool_id = %self.pool_id, "Could not create host registry path");
            return;
        }
        info!(pool_id = %self.pool_id, "Host registry listening");

        loop {
            let (host_ids, watch) = match self.conn.children_w(&path) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Host registry watch failed");
                    return;
                }
            };

            let resolved: Vec<Host> = host_ids
                .iter()
                .filter_map(|id| {
                    let host = self.store.host(id);
                    if host.is_none() {
                        debug!(host_id = %id, "Registered host has no document; skipping");
                    }
                    host
                })
                .collect();
            debug!(
                pool_id = %self.pool_id,
                live_hosts = resolved.len(),
                "Host registry updated"
            );
            *self.hosts.lock().expect("registry lock poisoned") = resolved;

            tokio::select! {
                event = watch.wait() => match event {
                    WatchEvent::ChildrenChanged => continue,
                    WatchEvent::Deleted | WatchEvent::SessionLost => return,
                    WatchEvent::DataChanged => continue,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Host registry shutting down");
                        return;
                    }
                }
            }
        }
    }
}
