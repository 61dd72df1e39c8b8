//! Host-state listener and per-instance supervision.
//!
//! The agent watches its own `/hosts/{host}` node; every child is a command
//! record for one instance. Each record gets a supervisor task that:
//!
//! - starts the container when commanded `Run` and none exists, waiting up
//!   to the start timeout for the engine's start event and falling back to
//!   inspect (the event is not fully reliable)
//! - publishes observed fields (container id, start time, private IP, port
//!   map) back onto the instance record, retrying on a fixed cadence
//! - reattaches to an already-running container after an agent restart
//! - kills the container when commanded `Stop`
//! - on exit: classifies the code, captures a log tail for unexpected
//!   failures, records `terminated`, and deletes the record pair so the
//!   leader can react
//!
//! A command record that arrives before its instance record is transiently
//! inconsistent and retried, never treated as an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use stevedore_coord::{paths, Connection, WatchEvent};
use stevedore_domain::{DesiredState, HostState, Service, ServiceState, StateId};

use crate::config::Config;
use crate::container::configure_container;
use crate::engine::{
    ContainerEngine, ContainerEvent, EXIT_CLEAN, EXIT_ENGINE_STOPPED, EXIT_KILLED,
};
use crate::error::AgentError;
use crate::proxy::{ProxyAddress, ProxyRegistry};

const LOAD_RETRIES: u32 = 5;
const LOAD_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Bytes of log tail captured on unexpected exits.
const LOG_TAIL_BYTES: usize = 1000;

pub struct HostStateListener {
    conn: Connection,
    engine: Arc<dyn ContainerEngine>,
    proxies: Arc<ProxyRegistry>,
    cfg: Arc<Config>,
    host_id: String,
}

impl HostStateListener {
    pub fn new(
        conn: Connection,
        engine: Arc<dyn ContainerEngine>,
        proxies: Arc<ProxyRegistry>,
        cfg: Arc<Config>,
        host_id: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            engine,
            proxies,
            cfg,
            host_id: host_id.into(),
        }
    }

    pub async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let path = paths::host_path(&self.host_id);
        if let Err(e) = self.conn.ensure_path(&path) {
            warn!(error = %e, "Could not create host path");
            return;
        }
        info!(host_id = %self.host_id, "Watching for instance commands");

        let (done_tx, mut done_rx) = mpsc::channel::<StateId>(32);
        let mut supervising: HashSet<StateId> = HashSet::new();

        loop {
            let (state_ids, watch) = match self.conn.children_w(&path) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Host state watch failed");
                    return;
                }
            };

            for raw in state_ids {
                let Ok(state_id) = raw.parse::<StateId>() else {
                    warn!(node = %raw, "Ignoring malformed state node");
                    continue;
                };
                if supervising.insert(state_id) {
                    let listener = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        listener.supervise(state_id, shutdown).await;
                        let _ = done.send(state_id).await;
                    });
                }
            }

            tokio::select! {
                event = watch.wait() => match event {
                    WatchEvent::Deleted | WatchEvent::SessionLost => return,
                    _ => continue,
                },
                Some(finished) = done_rx.recv() => {
                    debug!(state_id = %finished, "Instance supervisor finished");
                    supervising.remove(&finished);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Host state listener shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Supervises a single instance until it exits, its command record is
    /// deleted, or the agent shuts down.
    async fn supervise(&self, state_id: StateId, mut shutdown: watch::Receiver<bool>) {
        let hs_path = paths::host_state_path(&self.host_id, &state_id);
        loop {
            let (host_state, hs_watch) = match self.conn.get_w::<HostState>(&hs_path) {
                Ok(v) => v,
                // Reaped (by us or the leader); nothing left to do.
                Err(_) => return,
            };

            let state = self.load_state(&host_state).await;
            let service = self
                .conn
                .get::<Service>(&paths::service_path(&host_state.service_id))
                .ok();

            let mut state = match (host_state.desired_state, state) {
                (DesiredState::Stop | DesiredState::Restart, Some(mut state)) => {
                    self.stop_and_finalize(&mut state).await;
                    return;
                }
                (DesiredState::Stop | DesiredState::Restart, None) => {
                    // Instance record already gone (service removal deletes
                    // the whole mirror subtree); the container is named
                    // after the state id, so it can still be stopped.
                    self.stop_orphan(&host_state).await;
                    return;
                }
                (DesiredState::Run, Some(state)) => state,
                (DesiredState::Run, None) => {
                    // A command record with no instance record is an
                    // orphan; clear it so the leader's view stays clean.
                    warn!(state_id = %state_id, "Orphaned command record");
                    self.stop_orphan(&host_state).await;
                    return;
                }
            };

            match &service {
                Some(service) => {
                    if state.docker_id.is_empty() {
                        if let Err(e) = self.start_instance(service, &mut state).await {
                            error!(
                                state_id = %state_id,
                                service = %service.name,
                                error = %e,
                                "Could not start instance"
                            );
                            // Clear the pair so the leader schedules a
                            // replacement.
                            self.remove_instance(&state);
                            return;
                        }
                    } else if !self.attach_instance(&state).await {
                        // The container died while nobody was watching.
                        let code = self
                            .engine
                            .wait_container(&state.docker_id)
                            .await
                            .unwrap_or(EXIT_CLEAN);
                        self.finalize_instance(&mut state, code).await;
                        return;
                    }
                }
                None => {
                    // Commanded to run a service that no longer exists.
                    warn!(state_id = %state_id, "Service document gone; stopping instance");
                    self.stop_and_finalize(&mut state).await;
                    return;
                }
            }

            // Instance is up: wait for the container to exit or the command
            // record to change.
            let docker_id = state.docker_id.clone();
            let exit = self.engine.wait_container(&docker_id);
            tokio::pin!(exit);
            tokio::select! {
                code = &mut exit => {
                    let code = code.unwrap_or(EXIT_CLEAN);
                    self.finalize_instance(&mut state, code).await;
                    return;
                }
                event = hs_watch.wait() => match event {
                    WatchEvent::DataChanged => continue,
                    WatchEvent::Deleted => {
                        // Command record pulled out from under us; treat as
                        // a stop.
                        self.stop_and_finalize(&mut state).await;
                        return;
                    }
                    WatchEvent::SessionLost => return,
                    WatchEvent::ChildrenChanged => continue,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Leave the container running; the next agent run
                        // reattaches through the same command record.
                        debug!(state_id = %state_id, "Supervisor detaching");
                        return;
                    }
                }
            }
        }
    }

    /// Loads the instance record for a command record. The leader writes the
    /// instance record first, but a watcher can still observe the command
    /// record early; retry briefly before concluding it is really gone.
    async fn load_state(&self, host_state: &HostState) -> Option<ServiceState> {
        let path = paths::service_state_path(&host_state.service_id, &host_state.id);
        for attempt in 0..LOAD_RETRIES {
            match self.conn.get::<ServiceState>(&path) {
                Ok(state) => return Some(state),
                Err(_) => {
                    debug!(
                        state_id = %host_state.id,
                        attempt,
                        "Instance record not visible yet; retrying"
                    );
                    tokio::time::sleep(LOAD_RETRY_INTERVAL).await;
                }
            }
        }
        None
    }

    /// Tears down an instance whose records are already gone: the container
    /// is named after the state id, proxies are keyed by the service id.
    async fn stop_orphan(&self, host_state: &HostState) {
        let name = host_state.id.to_string();
        if let Err(e) = self.engine.kill_container(&name).await {
            debug!(container = %name, error = %e, "Kill failed (already dead?)");
        }
        let _ = self.engine.remove_container(&name).await;
        self.proxies
            .remove_by_prefix(&format!("{}:", host_state.service_id));
        let _ = self
            .conn
            .delete(&paths::host_state_path(&self.host_id, &host_state.id));
    }

    /// Creates and starts the container, publishes the first observation,
    /// and registers endpoint proxies.
    async fn start_instance(
        &self,
        service: &Service,
        state: &mut ServiceState,
    ) -> Result<(), AgentError> {
        info!(
            service = %service.name,
            state_id = %state.id,
            instance_id = state.instance_id,
            image = %service.image_id,
            "Starting instance"
        );

        // Start from a known good state: a container with this name may
        // linger from a previous run.
        let name = state.id.to_string();
        let _ = self.engine.kill_container(&name).await;
        let _ = self.engine.remove_container(&name).await;

        let tenant = service
            .tenant_id(|id| self.conn.get::<Service>(&paths::service_path(id)).ok())?;
        let spec = configure_container(
            &self.cfg,
            self.engine.as_ref(),
            service,
            state,
            &tenant.to_string(),
        )
        .await?;

        let container_id = self.engine.create_container(&spec).await?;
        let mut events = self.engine.subscribe(&container_id).await?;
        self.engine.start_container(&container_id).await?;

        let started = tokio::time::timeout(self.cfg.start_timeout, async {
            while let Some(event) = events.recv().await {
                if event == ContainerEvent::Start {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if !started {
            // The engine does not always deliver the start event; trust
            // inspect before declaring failure.
            match self.engine.inspect_container(&container_id).await {
                Ok(details) if details.running => {
                    warn!(
                        container = %container_id,
                        "Start event timed out but container is running"
                    );
                }
                _ => {
                    let _ = self.engine.kill_container(&container_id).await;
                    let _ = self.engine.remove_container(&container_id).await;
                    return Err(AgentError::StartTimeout);
                }
            }
        }

        state.docker_id = container_id;
        self.publish_observation(service, state).await?;
        self.register_proxies(service, state).await;
        info!(
            service = %service.name,
            state_id = %state.id,
            container = %state.docker_id,
            "Instance started"
        );
        Ok(())
    }

    /// Verifies an existing container is still running before resuming
    /// observation.
    async fn attach_instance(&self, state: &ServiceState) -> bool {
        match self.engine.inspect_container(&state.docker_id).await {
            Ok(details) => {
                if details.running {
                    debug!(
                        state_id = %state.id,
                        container = %state.docker_id,
                        "Reattached to running container"
                    );
                }
                details.running
            }
            Err(_) => false,
        }
    }

    /// Copies observed container state onto the instance record, retrying
    /// on a fixed cadence until the write sticks.
    async fn publish_observation(
        &self,
        service: &Service,
        state: &mut ServiceState,
    ) -> Result<(), AgentError> {
        let path = paths::service_state_path(&service.id, &state.id);
        let mut last = None;
        for _ in 0..self.cfg.observe_retries {
            match self.check_instance(state).await {
                Ok(()) => match self.conn.set(&path, state) {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(AgentError::from(e)),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(self.cfg.observe_interval).await;
        }
        Err(last.unwrap_or_else(|| AgentError::ObservationFailed(state.id.to_string())))
    }

    /// Refreshes the observed fields from the engine.
    async fn check_instance(&self, state: &mut ServiceState) -> Result<(), AgentError> {
        let details = self.engine.inspect_container(&state.docker_id).await?;
        state.docker_id = details.id;
        state.started = details.created.or(Some(Utc::now()));
        state.private_ip = details.private_ip;
        state.port_mapping = details.port_mapping;
        Ok(())
    }

    async fn stop_and_finalize(&self, state: &mut ServiceState) {
        if state.docker_id.is_empty() {
            self.remove_instance(state);
            return;
        }
        info!(
            service_id = %state.service_id,
            state_id = %state.id,
            container = %state.docker_id,
            "Stopping instance"
        );
        if let Err(e) = self.engine.kill_container(&state.docker_id).await {
            debug!(container = %state.docker_id, error = %e, "Kill failed (already dead?)");
        }
        let code = self
            .engine
            .wait_container(&state.docker_id)
            .await
            .unwrap_or(EXIT_KILLED);
        self.finalize_instance(state, code).await;
    }

    /// Records the exit, removes the container and its volumes, tears down
    /// proxies, and deletes the record pair.
    async fn finalize_instance(&self, state: &mut ServiceState, code: i32) {
        match code {
            EXIT_CLEAN => info!(state_id = %state.id, "Instance finished"),
            EXIT_ENGINE_STOPPED => info!(state_id = %state.id, "Engine stopped instance"),
            EXIT_KILLED => info!(state_id = %state.id, "Instance killed"),
            other => {
                warn!(state_id = %state.id, exit_code = other, "Instance exited unexpectedly");
                if let Ok(tail) = self.engine.logs_tail(&state.docker_id, LOG_TAIL_BYTES).await {
                    warn!(
                        container = %state.docker_id,
                        bytes = LOG_TAIL_BYTES,
                        logs = %tail,
                        "Last container output"
                    );
                }
            }
        }

        if let Err(e) = self.engine.remove_container(&state.docker_id).await {
            debug!(container = %state.docker_id, error = %e, "Container removal failed");
        }

        // Record the exit before the nodes disappear; the service may
        // already be gone, which is fine.
        state.terminated = Some(Utc::now());
        let _ = self
            .conn
            .set(&paths::service_state_path(&state.service_id, &state.id), state);

        self.proxies
            .remove_by_prefix(&format!("{}:", state.service_id));
        self.remove_instance(state);
    }

    fn remove_instance(&self, state: &ServiceState) {
        for (path, what) in [
            (
                paths::service_state_path(&state.service_id, &state.id),
                "instance record",
            ),
            (
                paths::host_state_path(&self.host_id, &state.id),
                "command record",
            ),
        ] {
            if let Err(e) = self.conn.delete(&path) {
                if !e.is_no_node() {
                    warn!(state_id = %state.id, error = %e, "Could not delete {what}");
                }
            }
        }
    }

    async fn register_proxies(&self, service: &Service, state: &ServiceState) {
        for endpoint in service.exports() {
            let Some(assignment) = &endpoint.address_assignment else {
                continue;
            };
            let key = proxy_key(service, &endpoint.name);
            let frontend = ProxyAddress::new(assignment.ip_addr.clone(), assignment.port);
            let backend = ProxyAddress::new(state.private_ip.clone(), endpoint.port_number);
            if let Err(e) = self
                .proxies
                .create_proxy(key.clone(), endpoint.protocol, frontend, backend)
                .await
            {
                warn!(key = %key, error = %e, "Could not start endpoint proxy");
            }
        }
    }

}

fn proxy_key(service: &Service, endpoint_name: &str) -> String {
    format!("{}:{}", service.id, endpoint_name)
}
