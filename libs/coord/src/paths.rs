//! Canonical coordination-store paths.
//!
//! ```text
//! /pools/{pool}/hosts/{host}      ephemeral; host liveness
//! /services/{service}             service document mirror
//! /services/{service}/{state}     service instance records
//! /hosts/{host}/{state}           per-host command records
//! /virtualIPs/{ip}                virtual-IP declaration
//! /virtualIPs/{ip}/owner          ephemeral; virtual-IP owner
//! /snapshots/{request}            snapshot requests & results
//! /docker/actions/{host}/{action} ad-hoc container actions
//! ```

use stevedore_domain::{ActionId, ServiceId, SnapshotId, StateId};

pub const SERVICES_PATH: &str = "/services";
pub const HOSTS_PATH: &str = "/hosts";
pub const VIRTUAL_IPS_PATH: &str = "/virtualIPs";
pub const SNAPSHOTS_PATH: &str = "/snapshots";

pub fn pool_hosts_path(pool_id: &str) -> String {
    format!("/pools/{pool_id}/hosts")
}

pub fn pool_host_path(pool_id: &str, host_id: &str) -> String {
    format!("/pools/{pool_id}/hosts/{host_id}")
}

pub fn service_path(service_id: &ServiceId) -> String {
    format!("{SERVICES_PATH}/{service_id}")
}

pub fn service_state_path(service_id: &ServiceId, state_id: &StateId) -> String {
    format!("{SERVICES_PATH}/{service_id}/{state_id}")
}

pub fn host_path(host_id: &str) -> String {
    format!("{HOSTS_PATH}/{host_id}")
}

pub fn host_state_path(host_id: &str, state_id: &StateId) -> String {
    format!("{HOSTS_PATH}/{host_id}/{state_id}")
}

pub fn virtual_ip_path(ip: &str) -> String {
    format!("{VIRTUAL_IPS_PATH}/{ip}")
}

pub fn virtual_ip_owner_path(ip: &str) -> String {
    format!("{VIRTUAL_IPS_PATH}/{ip}/owner")
}

pub fn snapshot_path(id: &SnapshotId) -> String {
    format!("{SNAPSHOTS_PATH}/{id}")
}

pub fn actions_path(host_id: &str) -> String {
    format!("/docker/actions/{host_id}")
}

pub fn action_path(host_id: &str, id: &ActionId) -> String {
    format!("/docker/actions/{host_id}/{id}")
}
