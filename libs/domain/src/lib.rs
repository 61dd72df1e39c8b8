//! # stevedore-domain
//!
//! Domain entities shared by the stevedore master and host agent:
//!
//! - Resource pools, hosts, and their IP resources
//! - Service documents (desired state, endpoints, address assignments)
//! - Service instance records and per-host command records
//! - Snapshot and container-action request documents
//!
//! All coordination-store payloads are plain serde documents so the wire
//! format stays self-describing.

mod ids;
mod ops;
mod pool;
mod state;

pub mod host;
pub mod service;
pub mod validation;

pub use ids::{ActionId, AssignmentId, IdError, ServiceId, SnapshotId, StateId};
pub use ops::{Action, Snapshot};
pub use pool::{ResourcePool, VirtualIp, VirtualIpOwner, DEFAULT_POOL_ID};
pub use state::{HostPort, HostState, ServiceState};

pub use host::{Host, HostIp};
pub use service::{
    AddressAssignment, AssignmentType, DesiredState, HostPolicy, LogConfig, Protocol, Purpose,
    Service, ServiceEndpoint, Volume,
};
