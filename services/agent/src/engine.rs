//! Container engine interface and mock implementation.
//!
//! The engine trait abstracts the container lifecycle operations the agent
//! needs: create/start/stop/kill/remove, inspection, exit waiting, event
//! subscription, image pulls, log tails, exec, and volume seeding.
//!
//! The mock implementation backs the test suite: failures, missing start
//! events, and external container exits are all scriptable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use stevedore_domain::{HostPort, Protocol};

/// Container exit statuses with specific meaning to the supervisor.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_ENGINE_STOPPED: i32 = 2;
pub const EXIT_KILLED: i32 = 137;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    #[error("no such image: {0}")]
    NoSuchImage(String),

    #[error("container engine error: {0}")]
    Engine(String),
}

/// A port exposed by a container, bound to an ephemeral host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    /// `"{port}/{protocol}"`, the engine's port-map key format.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol.as_str())
    }
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub dns: Vec<String>,
    pub hostname: Option<String>,
    pub exposed_ports: Vec<PortSpec>,
    /// `host_path:container_path` bind mounts.
    pub binds: Vec<String>,
    pub privileged: bool,
}

impl Default for PortSpec {
    fn default() -> Self {
        Self {
            port: 0,
            protocol: Protocol::Tcp,
        }
    }
}

/// Observed container state from inspect.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
    pub created: Option<DateTime<Utc>>,
    pub private_ip: String,
    pub port_mapping: HashMap<String, Vec<HostPort>>,
    pub exit_code: i32,
}

/// Engine event kinds the supervisor consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    Start,
    Stop,
    Die,
    Destroy,
    Kill,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates a container, pulling the image first when it is missing
    /// locally. Returns the container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    /// SIGKILL.
    async fn kill_container(&self, id: &str) -> Result<(), EngineError>;

    /// Removes the container together with its volumes.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError>;

    /// Blocks until the container exits; returns its exit code. Calling on
    /// an already-exited container returns immediately.
    async fn wait_container(&self, id: &str) -> Result<i32, EngineError>;

    /// Subscribes to lifecycle events for one container.
    async fn subscribe(&self, id: &str) -> Result<mpsc::Receiver<ContainerEvent>, EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// The last `bytes` bytes of the container's combined logs.
    async fn logs_tail(&self, id: &str, bytes: usize) -> Result<String, EngineError>;

    /// Runs a one-off command inside a running container and returns its
    /// combined output.
    async fn attach_and_run(&self, id: &str, command: &[String]) -> Result<String, EngineError>;

    /// Seeds an empty host directory from the image's content at
    /// `container_path`, applying owner and permission specs.
    async fn seed_volume(
        &self,
        image: &str,
        host_path: &Path,
        container_path: &str,
        owner: &str,
        permission: &str,
    ) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Mock engine
// ---------------------------------------------------------------------------

struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    exit: watch::Sender<Option<i32>>,
    subscribers: Vec<mpsc::Sender<ContainerEvent>>,
    private_ip: String,
    created: Option<DateTime<Utc>>,
    port_mapping: HashMap<String, Vec<HostPort>>,
    logs: String,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    names: HashMap<String, String>,
    next: u64,
    fail_starts: bool,
    suppress_start_events: bool,
    action_results: HashMap<String, Result<String, String>>,
    seeded: Vec<String>,
    pulled: Vec<String>,
}

/// Scriptable in-memory engine for tests and development.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// All starts fail until cleared.
    pub fn set_fail_starts(&self, fail: bool) {
        self.state.lock().unwrap().fail_starts = fail;
    }

    /// Swallow start events so the supervisor exercises its inspect
    /// fallback.
    pub fn set_suppress_start_events(&self, suppress: bool) {
        self.state.lock().unwrap().suppress_start_events = suppress;
    }

    /// Scripts the outcome of `attach_and_run` against a container.
    pub fn set_action_result(&self, id: &str, result: Result<&str, &str>) {
        self.state.lock().unwrap().action_results.insert(
            id.to_string(),
            result.map(str::to_string).map_err(str::to_string),
        );
    }

    /// Simulates a container dying outside the agent's control.
    pub fn trigger_exit(&self, id: &str, code: i32) {
        let mut state = self.state.lock().unwrap();
        let Some(key) = resolve(&state, id) else {
            return;
        };
        let container = state.containers.get_mut(&key).unwrap();
        container.running = false;
        container.exit.send_replace(Some(code));
        broadcast(container, ContainerEvent::Die);
    }

    pub fn running_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.containers.values().filter(|c| c.running).count()
    }

    pub fn is_running(&self, id: &str) -> bool {
        let state = self.state.lock().unwrap();
        resolve(&state, id)
            .and_then(|key| state.containers.get(&key))
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn seeded_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().seeded.clone()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }
}

fn resolve(state: &MockState, id_or_name: &str) -> Option<String> {
    if state.containers.contains_key(id_or_name) {
        return Some(id_or_name.to_string());
    }
    state.names.get(id_or_name).cloned()
}

fn broadcast(container: &mut MockContainer, event: ContainerEvent) {
    container
        .subscribers
        .retain(|tx| tx.try_send(event).is_ok());
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        let id = format!("ctr_{:08x}", state.next);
        let (exit, _) = watch::channel(None);
        debug!(id = %id, name = %spec.name, image = %spec.image, "[MOCK] Created container");
        let private_ip = format!("172.17.0.{}", state.next % 250 + 2);
        state.names.insert(spec.name.clone(), id.clone());
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                exit,
                subscribers: Vec::new(),
                private_ip,
                created: None,
                port_mapping: HashMap::new(),
                logs: format!("mock logs for {}\n", spec.name),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_starts {
            return Err(EngineError::Engine("mock engine configured to fail".into()));
        }
        let suppress = state.suppress_start_events;
        let key =
            resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        let next = state.next;
        let container = state.containers.get_mut(&key).unwrap();
        container.running = true;
        container.created = Some(Utc::now());
        container.port_mapping = container
            .spec
            .exposed_ports
            .iter()
            .enumerate()
            .map(|(i, p)| {
                (
                    p.key(),
                    vec![HostPort {
                        host_ip: "0.0.0.0".to_string(),
                        host_port: format!("{}", 49000 + next * 10 + i as u64),
                    }],
                )
            })
            .collect();
        info!(id = %key, "[MOCK] Started container");
        if !suppress {
            broadcast(container, ContainerEvent::Start);
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let key =
            resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        let container = state.containers.get_mut(&key).unwrap();
        if container.running {
            container.running = false;
            container.exit.send_replace(Some(EXIT_ENGINE_STOPPED));
            broadcast(container, ContainerEvent::Stop);
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let key =
            resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        let container = state.containers.get_mut(&key).unwrap();
        if container.running {
            container.running = false;
            container.exit.send_replace(Some(EXIT_KILLED));
            broadcast(container, ContainerEvent::Kill);
            broadcast(container, ContainerEvent::Die);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let key =
            resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        let mut container = state.containers.remove(&key).unwrap();
        state.names.remove(&container.spec.name);
        broadcast(&mut container, ContainerEvent::Destroy);
        debug!(id = %key, "[MOCK] Removed container");
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let state = self.state.lock().unwrap();
        let key =
            resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        let container = state.containers.get(&key).unwrap();
        let details = ContainerDetails {
            id: container.id.clone(),
            running: container.running,
            created: container.created,
            private_ip: container.private_ip.clone(),
            port_mapping: container.port_mapping.clone(),
            exit_code: container.exit.borrow().unwrap_or(0),
        };
        Ok(details)
    }

    async fn wait_container(&self, id: &str) -> Result<i32, EngineError> {
        let mut rx = {
            let state = self.state.lock().unwrap();
            let key =
                resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
            state.containers.get(&key).unwrap().exit.subscribe()
        };
        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                // Container removed while waiting.
                return Ok(EXIT_CLEAN);
            }
        }
    }

    async fn subscribe(&self, id: &str) -> Result<mpsc::Receiver<ContainerEvent>, EngineError> {
        let mut state = self.state.lock().unwrap();
        let key =
            resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        let (tx, rx) = mpsc::channel(16);
        state.containers.get_mut(&key).unwrap().subscribers.push(tx);
        Ok(rx)
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.state.lock().unwrap().pulled.push(image.to_string());
        Ok(())
    }

    async fn logs_tail(&self, id: &str, bytes: usize) -> Result<String, EngineError> {
        let state = self.state.lock().unwrap();
        let key =
            resolve(&state, id).ok_or_else(|| EngineError::NoSuchContainer(id.to_string()))?;
        let logs = &state.containers.get(&key).unwrap().logs;
        let start = logs.len().saturating_sub(bytes);
        Ok(logs[start..].to_string())
    }

    async fn attach_and_run(&self, id: &str, _command: &[String]) -> Result<String, EngineError> {
        let state = self.state.lock().unwrap();
        if let Some(result) = state.action_results.get(id) {
            return result.clone().map_err(EngineError::Engine);
        }
        match resolve(&state, id) {
            Some(_) => Ok(String::new()),
            None => Err(EngineError::NoSuchContainer(id.to_string())),
        }
    }

    async fn seed_volume(
        &self,
        _image: &str,
        host_path: &Path,
        _container_path: &str,
        _owner: &str,
        _permission: &str,
    ) -> Result<(), EngineError> {
        self.state
            .lock()
            .unwrap()
            .seeded
            .push(host_path.display().to_string());
        Ok(())
    }
}
