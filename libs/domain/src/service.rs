//! Service documents.
//!
//! A service is a template plus a desired-state spec that produces N
//! container instances. The document is stored in the entity store and
//! mirrored into the coordination store at `/services/{id}` for the leader
//! and agents to watch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AssignmentId, ServiceId};

/// Change option that forces a full restart whenever the observed instance
/// count differs from the declared count.
pub const RESTART_ALL_ON_INSTANCE_CHANGED: &str = "restartAllOnInstanceChanged";

/// Desired run state of a service. Serialized as the wire integers
/// `1` (run), `0` (stop), `-1` (restart).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum DesiredState {
    Run,
    #[default]
    Stop,
    Restart,
}

impl From<DesiredState> for i32 {
    fn from(state: DesiredState) -> i32 {
        match state {
            DesiredState::Run => 1,
            DesiredState::Stop => 0,
            DesiredState::Restart => -1,
        }
    }
}

impl TryFrom<i32> for DesiredState {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DesiredState::Run),
            0 => Ok(DesiredState::Stop),
            -1 => Ok(DesiredState::Restart),
            other => Err(format!("invalid desired state {other}")),
        }
    }
}

/// Placement preference when no address assignment pins the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPolicy {
    #[default]
    LeastCommitted,
    /// Spread instances of the same service across hosts when possible.
    PreferSeparate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Export,
    Import,
    ImportAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentType {
    Static,
    Virtual,
}

/// Binding of a service endpoint to a specific (host, ip, port).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssignment {
    pub id: AssignmentId,
    pub assignment_type: AssignmentType,
    pub host_id: String,
    pub ip_addr: String,
    pub port: u16,
    pub service_id: ServiceId,
    pub endpoint_name: String,
}

/// An endpoint exported or imported by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub application: String,
    pub purpose: Purpose,
    pub protocol: Protocol,
    pub port_number: u16,
    #[serde(default)]
    pub vhosts: Vec<String>,
    #[serde(default)]
    pub address_assignment: Option<AddressAssignment>,
}

/// A volume declared by a service, realized as a driver-backed subvolume on
/// the placed host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub owner: String,
    pub permission: String,
    pub resource_path: String,
    pub container_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub path: String,
    pub log_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub script: String,
    /// Interval in seconds.
    pub interval: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<ServiceId>,
    pub pool_id: String,
    pub image_id: String,
    /// Command run inside the container, proxied through the agent binary.
    pub startup: String,
    pub instances: usize,
    pub desired_state: DesiredState,
    #[serde(default)]
    pub change_options: Vec<String>,
    #[serde(default)]
    pub host_policy: HostPolicy,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub launch: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub ram_commitment: u64,
    #[serde(default)]
    pub cpu_commitment: u64,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub log_configs: Vec<LogConfig>,
    #[serde(default)]
    pub health_checks: HashMap<String, HealthCheck>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        pool_id: impl Into<String>,
        image_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ServiceId::new(),
            name: name.into(),
            parent_id: None,
            pool_id: pool_id.into(),
            image_id: image_id.into(),
            startup: String::new(),
            instances: 0,
            desired_state: DesiredState::Stop,
            change_options: Vec::new(),
            host_policy: HostPolicy::default(),
            hostname: String::new(),
            privileged: false,
            launch: String::new(),
            deployment_id: String::new(),
            ram_commitment: 0,
            cpu_commitment: 0,
            endpoints: Vec::new(),
            volumes: Vec::new(),
            log_configs: Vec::new(),
            health_checks: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Endpoints with purpose `export`.
    pub fn exports(&self) -> impl Iterator<Item = &ServiceEndpoint> {
        self.endpoints
            .iter()
            .filter(|ep| ep.purpose == Purpose::Export)
    }

    /// Endpoints with purpose `import` or `import_all`.
    pub fn imports(&self) -> impl Iterator<Item = &ServiceEndpoint> {
        self.endpoints
            .iter()
            .filter(|ep| matches!(ep.purpose, Purpose::Import | Purpose::ImportAll))
    }

    /// Endpoints carrying at least one virtual host name.
    pub fn vhost_endpoints(&self) -> impl Iterator<Item = &ServiceEndpoint> {
        self.endpoints.iter().filter(|ep| !ep.vhosts.is_empty())
    }

    /// The first address assignment across all endpoints, if any. Placement
    /// pins the host through this.
    pub fn first_assignment(&self) -> Option<&AddressAssignment> {
        self.endpoints
            .iter()
            .find_map(|ep| ep.address_assignment.as_ref())
    }

    pub fn restart_all_on_instance_changed(&self) -> bool {
        self.change_options
            .iter()
            .any(|opt| opt == RESTART_ALL_ON_INSTANCE_CHANGED)
    }

    /// Walks the parent chain to the root service id. The root service owns
    /// the tenant volume every descendant mounts under.
    pub fn tenant_id<F>(&self, mut lookup: F) -> Result<ServiceId, TenantError>
    where
        F: FnMut(&ServiceId) -> Option<Service>,
    {
        let mut current = self.id;
        let mut parent = self.parent_id;
        let mut depth = 0usize;
        while let Some(pid) = parent {
            depth += 1;
            if depth > MAX_PARENT_DEPTH {
                return Err(TenantError::CycleDetected(self.id));
            }
            match lookup(&pid) {
                Some(svc) => {
                    current = svc.id;
                    parent = svc.parent_id;
                }
                None => return Err(TenantError::MissingParent(pid)),
            }
        }
        Ok(current)
    }

    /// `/`-delimited name path derived from the parent chain, e.g.
    /// `/app/zope/zproxy`.
    pub fn path<F>(&self, mut lookup: F) -> Result<String, TenantError>
    where
        F: FnMut(&ServiceId) -> Option<Service>,
    {
        let mut segments = vec![self.name.clone()];
        let mut parent = self.parent_id;
        let mut depth = 0usize;
        while let Some(pid) = parent {
            depth += 1;
            if depth > MAX_PARENT_DEPTH {
                return Err(TenantError::CycleDetected(self.id));
            }
            match lookup(&pid) {
                Some(svc) => {
                    segments.push(svc.name.clone());
                    parent = svc.parent_id;
                }
                None => return Err(TenantError::MissingParent(pid)),
            }
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }
}

const MAX_PARENT_DEPTH: usize = 64;

/// Errors walking a service parent chain.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("parent service {0} does not exist")]
    MissingParent(ServiceId),

    #[error("parent chain for service {0} does not terminate")]
    CycleDetected(ServiceId),
}
