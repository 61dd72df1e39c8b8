//! Instance records.
//!
//! A `ServiceState` is one container realization of a service on one host,
//! created by the leader under `/services/{service}/{state}`. The matching
//! `HostState` under `/hosts/{host}/{state}` is the leader→agent command
//! record for that instance. The leader owns creation; the agent owns the
//! observed fields and deletes both nodes once the container exit has been
//! recorded.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::Host;
use crate::ids::{ServiceId, StateId};
use crate::service::{DesiredState, Service};

/// One host-side binding of an exposed container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host_ip: String,
    pub host_port: String,
}

/// One container realization of a service on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub id: StateId,
    pub service_id: ServiceId,
    pub host_id: String,
    pub host_ip: String,
    /// Instance slot, dense in `[0, Service::instances)`.
    pub instance_id: usize,

    // Observed fields, owned by the agent.
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub docker_id: String,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminated: Option<DateTime<Utc>>,
    /// `"{port}/{protocol}"` → host-side bindings.
    #[serde(default)]
    pub port_mapping: HashMap<String, Vec<HostPort>>,
}

impl ServiceState {
    /// Builds a fresh instance record for a service placed on a host. The
    /// instance slot is assigned by the caller.
    pub fn build_from(service: &Service, host: &Host) -> Self {
        Self {
            id: StateId::new(),
            service_id: service.id,
            host_id: host.id.clone(),
            host_ip: host.ip_addr.clone(),
            instance_id: 0,
            private_ip: String::new(),
            docker_id: String::new(),
            started: None,
            terminated: None,
            port_mapping: HashMap::new(),
        }
    }

    /// An instance counts as running until its exit has been recorded.
    pub fn is_running(&self) -> bool {
        self.terminated.is_none()
    }
}

/// The leader→agent per-instance command record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    /// Same id as the matching `ServiceState`.
    pub id: StateId,
    pub host_id: String,
    pub service_id: ServiceId,
    pub desired_state: DesiredState,
}

impl HostState {
    pub fn from_state(state: &ServiceState) -> Self {
        Self {
            id: state.id,
            host_id: state.host_id.clone(),
            service_id: state.service_id,
            desired_state: DesiredState::Run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_from_copies_placement() {
        let svc = Service::new("web", "default", "img:1");
        let host = Host::new("h1", "default", "10.0.0.10", 4, 16 << 30);

        let state = ServiceState::build_from(&svc, &host);
        assert_eq!(state.service_id, svc.id);
        assert_eq!(state.host_id, "h1");
        assert_eq!(state.host_ip, "10.0.0.10");
        assert!(state.is_running());
        assert!(state.docker_id.is_empty());

        let hs = HostState::from_state(&state);
        assert_eq!(hs.id, state.id);
        assert_eq!(hs.desired_state, DesiredState::Run);
    }

    #[test]
    fn terminated_instances_are_not_running() {
        let svc = Service::new("web", "default", "img:1");
        let host = Host::new("h1", "default", "10.0.0.10", 4, 16 << 30);
        let mut state = ServiceState::build_from(&svc, &host);
        state.terminated = Some(Utc::now());
        assert!(!state.is_running());
    }
}
