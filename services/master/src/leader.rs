//! The per-pool leader.
//!
//! One leader runs per resource pool (election is a prerequisite handled
//! outside this crate). It watches `/services` and spawns one reconciler
//! task per service; each reconciler reads the service document and the
//! observed instance set *in the same iteration* and drives the delta:
//!
//! - fewer observed than declared → start the difference on selected hosts
//! - more observed than declared → stop from the highest instance id down
//! - `restartAllOnInstanceChanged` and a count mismatch → kill everything,
//!   then start fresh once the kills have drained
//!
//! Starts create the `/services/{svc}/{state}` record before the matching
//! `/hosts/{host}/{state}` command record; stops only flip the command
//! record's desired state and leave the rest to the agent. A single mutex
//! serializes placement so concurrent services see a consistent
//! committed-memory picture.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use stevedore_coord::{paths, Connection, CoordError, WatchEvent};
use stevedore_domain::{DesiredState, Host, HostState, Service, ServiceId, ServiceState, StateId};

use crate::facade::{Facade, FacadeError};
use crate::placement::{HostSelector, PlacementError};
use crate::registry::HostRegistryListener;
use crate::snapshot::SnapshotListener;
use crate::virtual_ips::sync_virtual_ips;

/// How often the declared virtual-IP set is reconciled.
pub const VIRTUAL_IP_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Backstop for the per-service loop: re-reconcile even when no watch has
/// fired, e.g. after hosts join an until-then-empty pool.
pub const RECONCILE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LeaderError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Facade(#[from] FacadeError),
}

pub struct Leader {
    conn: Connection,
    facade: Arc<Facade>,
    registry: Arc<HostRegistryListener>,
    pool_id: String,
    /// Serializes placement so concurrent starts distribute evenly.
    placement_lock: Mutex<()>,
}

impl Leader {
    pub fn new(conn: Connection, facade: Arc<Facade>, pool_id: impl Into<String>) -> Arc<Self> {
        let pool_id = pool_id.into();
        let registry = Arc::new(HostRegistryListener::new(
            conn.clone(),
            facade.store().clone(),
            pool_id.clone(),
        ));
        Arc::new(Self {
            conn,
            facade,
            registry,
            pool_id,
            placement_lock: Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &HostRegistryListener {
        &self.registry
    }

    /// Runs leader duties until shutdown: the host registry, the snapshot
    /// listener, and the service watcher.
    pub async fn lead(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(pool_id = %self.pool_id, "Assuming leader duties");

        let registry = Arc::clone(&self.registry);
        let registry_shutdown = shutdown.clone();
        let registry_task = tokio::spawn(async move {
            registry.listen(registry_shutdown).await;
        });

        let snapshots = SnapshotListener::new(self.conn.clone(), Arc::clone(&self.facade));
        let snapshot_shutdown = shutdown.clone();
        let snapshot_task = tokio::spawn(async move {
            snapshots.listen(snapshot_shutdown).await;
        });

        Arc::clone(&self).watch_services(shutdown).await;

        registry_task.abort();
        snapshot_task.abort();
        info!(pool_id = %self.pool_id, "Leader exiting");
    }

    async fn watch_services(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.conn.ensure_path(paths::SERVICES_PATH) {
            warn!(error = %e, "Could not create services path");
            return;
        }

        let (done_tx, mut done_rx) = mpsc::channel::<ServiceId>(32);
        let mut reconcilers: HashSet<ServiceId> = HashSet::new();
        let mut vip_timer = tokio::time::interval(VIRTUAL_IP_SYNC_INTERVAL);

        'watch: loop {
            let (service_ids, service_watch) = match self.conn.children_w(paths::SERVICES_PATH) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Service watch failed");
                    return;
                }
            };

            for raw in service_ids {
                let Ok(service_id) = raw.parse::<ServiceId>() else {
                    warn!(node = %raw, "Ignoring non-service node under /services");
                    continue;
                };
                if reconcilers.insert(service_id) {
                    debug!(service_id = %service_id, "Spawning service reconciler");
                    let leader = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        leader.watch_service(service_id, shutdown).await;
                        let _ = done.send(service_id).await;
                    });
                }
            }

            let fired = service_watch.wait();
            tokio::pin!(fired);
            loop {
                tokio::select! {
                    event = &mut fired => {
                        if event == WatchEvent::SessionLost {
                            return;
                        }
                        continue 'watch;
                    }
                    Some(finished) = done_rx.recv() => {
                        debug!(service_id = %finished, "Reconciler finished");
                        reconcilers.remove(&finished);
                        continue 'watch;
                    }
                    _ = vip_timer.tick() => {
                        self.sync_pool_virtual_ips();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Service watcher shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn sync_pool_virtual_ips(&self) {
        match self.facade.get_resource_pool(&self.pool_id) {
            Some(pool) => {
                if let Err(e) = sync_virtual_ips(&self.conn, &pool.virtual_ips) {
                    warn!(error = %e, "Virtual IP sync failed");
                }
            }
            None => warn!(pool_id = %self.pool_id, "Pool document missing; skipping VIP sync"),
        }
    }

    /// Per-service reconcile loop: data watch + children watch, both read in
    /// the same iteration so a stale document can never be paired with a
    /// stale instance view.
    async fn watch_service(&self, service_id: ServiceId, mut shutdown: watch::Receiver<bool>) {
        let path = paths::service_path(&service_id);
        loop {
            let (service, service_watch) = match self.conn.get_w::<Service>(&path) {
                Ok(v) => v,
                Err(e) if e.is_no_node() => {
                    debug!(service_id = %service_id, "Service node gone");
                    return;
                }
                Err(e) => {
                    warn!(service_id = %service_id, error = %e, "Could not load service");
                    return;
                }
            };
            let (state_ids, child_watch) = match self.conn.children_w(&path) {
                Ok(v) => v,
                Err(e) => {
                    if !e.is_no_node() {
                        warn!(service_id = %service_id, error = %e, "Could not watch instances");
                    }
                    return;
                }
            };

            let observed = self.load_states(&service_id, &state_ids);
            debug!(
                service = %service.name,
                desired_state = ?service.desired_state,
                declared = service.instances,
                observed = observed.len(),
                "Reconciling service"
            );

            match service.desired_state {
                DesiredState::Run => {
                    if let Err(e) = self.update_instances(&service, &observed).await {
                        warn!(service = %service.name, error = %e, "Reconciliation failed");
                    }
                }
                DesiredState::Stop => self.stop_instances(&observed, observed.len()),
                DesiredState::Restart => {
                    if observed.is_empty() {
                        // Drained; flip back to Run so the next iteration
                        // starts a fresh set.
                        let mut relaunch = service.clone();
                        relaunch.desired_state = DesiredState::Run;
                        if let Err(e) = self.facade.update_service(relaunch) {
                            warn!(service = %service.name, error = %e, "Could not relaunch");
                        }
                    } else {
                        self.stop_instances(&observed, observed.len());
                    }
                }
            }

            // Biased: a service deletion makes both watches ready at once,
            // and the drain must win over a plain re-entry.
            tokio::select! {
                biased;
                event = service_watch.wait() => match event {
                    WatchEvent::Deleted => {
                        info!(service = %service.name, "Service removed; draining instances");
                        self.stop_instances(&observed, observed.len());
                        return;
                    }
                    WatchEvent::SessionLost => return,
                    _ => continue,
                },
                event = child_watch.wait() => match event {
                    WatchEvent::SessionLost => return,
                    _ => continue,
                },
                _ = tokio::time::sleep(RECONCILE_TIMEOUT) => continue,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Instances keep running; a successor leader picks
                        // them up from the store.
                        debug!(service = %service.name, "Reconciler shutting down");
                        return;
                    }
                }
            }
        }
    }

    fn load_states(&self, service_id: &ServiceId, state_ids: &[String]) -> Vec<ServiceState> {
        state_ids
            .iter()
            .filter_map(|raw| {
                let state_id: StateId = raw.parse().ok()?;
                match self
                    .conn
                    .get::<ServiceState>(&paths::service_state_path(service_id, &state_id))
                {
                    Ok(state) if state.is_running() => Some(state),
                    Ok(_) => None,
                    Err(e) => {
                        if !e.is_no_node() {
                            warn!(state_id = %state_id, error = %e, "Could not load instance");
                        }
                        None
                    }
                }
            })
            .collect()
    }

    async fn update_instances(
        &self,
        service: &Service,
        observed: &[ServiceState],
    ) -> Result<(), LeaderError> {
        let mut to_kill = 0usize;
        let mut to_start = 0usize;

        if observed.len() != service.instances && service.restart_all_on_instance_changed() {
            to_kill = observed.len();
            to_start = service.instances;
            debug!(
                service = %service.name,
                killing = to_kill,
                starting = to_start,
                "Instance count changed with restart-all set"
            );
        } else if observed.len() < service.instances {
            to_start = service.instances - observed.len();
        } else if observed.len() > service.instances {
            to_kill = observed.len() - service.instances;
        }

        if to_kill > 0 {
            // Kills are asynchronous; starting anything now would race the
            // drain and run away with instance creation. The children watch
            // brings us back once the agents have reaped.
            self.stop_instances(observed, to_kill);
        } else if to_start > 0 {
            let hosts = self.registry.hosts();
            if hosts.is_empty() {
                warn!(pool_id = %self.pool_id, "Pool has no live hosts");
                return Ok(());
            }
            self.start_instances(service, &hosts, to_start, observed).await?;
        }
        Ok(())
    }

    /// Stops `n` instances, highest instance id first, by flipping each
    /// matching command record to `Stop`. The agent does the rest.
    fn stop_instances(&self, observed: &[ServiceState], n: usize) {
        let mut ordered: Vec<&ServiceState> = observed.iter().collect();
        ordered.sort_by(|a, b| b.instance_id.cmp(&a.instance_id));

        for state in ordered.into_iter().take(n) {
            let path = paths::host_state_path(&state.host_id, &state.id);
            let mut host_state: HostState = match self.conn.get(&path) {
                Ok(hs) => hs,
                Err(e) => {
                    warn!(state_id = %state.id, error = %e, "Could not load command record");
                    continue;
                }
            };
            debug!(
                state_id = %state.id,
                host_id = %state.host_id,
                instance_id = state.instance_id,
                "Stopping instance"
            );
            host_state.desired_state = DesiredState::Stop;
            if let Err(e) = self.conn.set(&path, &host_state) {
                warn!(state_id = %state.id, host_id = %state.host_id, error = %e,
                    "Instance would not stop");
            }
        }
    }

    /// Starts `n` instances on selected hosts, one record pair per free
    /// instance id. Runs under the placement mutex.
    async fn start_instances(
        &self,
        service: &Service,
        hosts: &[Host],
        n: usize,
        observed: &[ServiceState],
    ) -> Result<(), LeaderError> {
        let _guard = self.placement_lock.lock().await;

        let selector = HostSelector::new(&self.conn);
        for instance_id in free_instance_ids(observed, n) {
            let host = selector.select_host(service, hosts)?;
            let mut state = ServiceState::build_from(service, &host);
            state.instance_id = instance_id;

            let state_path = paths::service_state_path(&service.id, &state.id);
            self.conn.create(&state_path, &state)?;

            self.conn.ensure_path(&paths::host_path(&host.id))?;
            let host_state = HostState::from_state(&state);
            if let Err(e) = self
                .conn
                .create(&paths::host_state_path(&host.id, &state.id), &host_state)
            {
                // Keep the pair consistent: without a command record the
                // instance record is unreachable.
                if let Err(rollback) = self.conn.delete(&state_path) {
                    warn!(state_id = %state.id, error = %rollback, "Rollback failed");
                }
                return Err(e.into());
            }

            info!(
                service = %service.name,
                state_id = %state.id,
                host_id = %host.id,
                instance_id,
                "Started instance"
            );
        }
        Ok(())
    }
}

/// The first `n` naturals not already used as instance ids. Instance ids
/// stay dense in `[0, instances)` because stops always trim from the top.
fn free_instance_ids(observed: &[ServiceState], n: usize) -> Vec<usize> {
    let used: HashMap<usize, ()> = observed.iter().map(|s| (s.instance_id, ())).collect();
    let mut free = Vec::with_capacity(n);
    let mut candidate = 0usize;
    while free.len() < n {
        if !used.contains_key(&candidate) {
            free.push(candidate);
        }
        candidate += 1;
    }
    free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_instance(instance_id: usize) -> ServiceState {
        let svc = Service::new("web", "default", "img:1");
        let host = Host::new("h1", "default", "10.0.0.10", 4, 16 << 30);
        let mut state = ServiceState::build_from(&svc, &host);
        state.instance_id = instance_id;
        state
    }

    #[test]
    fn free_ids_fill_gaps_first() {
        let observed = vec![state_with_instance(0), state_with_instance(2)];
        assert_eq!(free_instance_ids(&observed, 3), vec![1, 3, 4]);
    }

    #[test]
    fn free_ids_from_empty() {
        assert_eq!(free_instance_ids(&[], 3), vec![0, 1, 2]);
    }
}
