//! Snapshot and container-action request documents.
//!
//! Both are request/response records that live in the coordination store:
//! the requester creates the node, the responsible party fills in the result
//! fields. Neither side retries; the requester observes the node and applies
//! its own policy.

use serde::{Deserialize, Serialize};

use crate::ids::{ActionId, ServiceId, SnapshotId};

/// A snapshot request under `/snapshots/{id}`, processed by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub service_id: ServiceId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Snapshot {
    pub fn request(service_id: ServiceId) -> Self {
        Self {
            id: SnapshotId::new(),
            service_id,
            label: None,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.label.is_some() || self.error.is_some()
    }
}

/// An ad-hoc command under `/docker/actions/{host}/{id}`, executed by that
/// host's agent inside the named container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub host_id: String,
    pub docker_id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Action {
    pub fn request(
        host_id: impl Into<String>,
        docker_id: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            id: ActionId::new(),
            host_id: host_id.into(),
            docker_id: docker_id.into(),
            command,
            output: None,
            error: None,
        }
    }
}
