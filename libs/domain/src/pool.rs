//! Resource pools and virtual IPs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The pool created on first leader boot when none exists.
pub const DEFAULT_POOL_ID: &str = "default";

/// A named collection of hosts and virtual IPs sharing a placement domain.
///
/// Capacity and commitment fields are derived by the facade on read; they are
/// never stored authoritatively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: String,
    pub description: String,
    pub priority: i32,

    /// Sum of `Host::cores` over the pool, computed on read.
    pub core_capacity: u32,
    /// Sum of `Host::memory` over the pool, computed on read.
    pub memory_capacity: u64,
    /// Sum of `Service::ram_commitment` over the pool, computed on read.
    pub memory_commitment: u64,

    pub virtual_ips: Vec<VirtualIp>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourcePool {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: String::new(),
            priority: 0,
            core_capacity: 0,
            memory_capacity: 0,
            memory_commitment: 0,
            virtual_ips: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set equality over the declared virtual IPs, keyed by address.
    pub fn virtual_ips_equal(&self, other: &ResourcePool) -> bool {
        if self.virtual_ips.len() != other.virtual_ips.len() {
            return false;
        }
        self.virtual_ips
            .iter()
            .all(|vip| other.virtual_ips.iter().any(|o| o.ip == vip.ip))
    }
}

/// A pool-declared address bound on exactly one host at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIp {
    pub pool_id: String,
    pub ip: String,
    pub netmask: String,
    pub bind_interface: String,
}

/// Payload of the ephemeral owner node under a virtual-IP declaration.
///
/// The node lives and dies with the owning agent's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIpOwner {
    pub host_id: String,
}
