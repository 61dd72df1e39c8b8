//! Hosts and their IP resources.

use serde::{Deserialize, Serialize};

/// A machine registered in a resource pool.
///
/// Hosts are created by an administrator; liveness is advertised separately
/// by the agent as an ephemeral registration node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub pool_id: String,
    /// The address agents report for instances placed here.
    pub ip_addr: String,
    pub cores: u32,
    pub memory: u64,
    pub ips: Vec<HostIp>,
}

/// A static IP resource owned by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIp {
    pub host_id: String,
    pub ip_address: String,
    pub interface_name: String,
}

impl Host {
    pub fn new(
        id: impl Into<String>,
        pool_id: impl Into<String>,
        ip_addr: impl Into<String>,
        cores: u32,
        memory: u64,
    ) -> Self {
        let id = id.into();
        let ip_addr = ip_addr.into();
        Self {
            name: id.clone(),
            ips: vec![HostIp {
                host_id: id.clone(),
                ip_address: ip_addr.clone(),
                interface_name: String::new(),
            }],
            id,
            pool_id: pool_id.into(),
            ip_addr,
            cores,
            memory,
        }
    }
}
