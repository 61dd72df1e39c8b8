//! Host selection.
//!
//! Ordering:
//!
//! 1. An endpoint with an address assignment pins the host: virtual
//!    assignments resolve `ip → host` through the ephemeral owner node,
//!    static assignments name the host directly. The pinned host must be in
//!    the candidate set.
//! 2. Otherwise the host with the lowest committed-memory/total-memory ratio
//!    wins, tie-broken lexicographically by host id for determinism.
//!
//! Committed memory counts `ram_commitment` once per non-terminated instance
//! assigned to the host, read from the per-host command records and the
//! service document mirrors.

use std::collections::HashMap;

use tracing::{debug, info};

use stevedore_coord::{paths, Connection, CoordError};
use stevedore_domain::{
    AssignmentType, Host, HostPolicy, HostState, Service, ServiceId, StateId, VirtualIpOwner,
};

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("no hosts available")]
    NoHosts,

    #[error("virtual IP {0} has no owner")]
    NoOwner(String),

    #[error("assigned host {0} is not in the pool")]
    NotInPool(String),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

pub struct HostSelector<'a> {
    conn: &'a Connection,
}

impl<'a> HostSelector<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn select_host(&self, service: &Service, hosts: &[Host]) -> Result<Host, PlacementError> {
        if let Some(assignment) = service.first_assignment() {
            let host_id = match assignment.assignment_type {
                AssignmentType::Virtual => {
                    let host_id = self.virtual_ip_owner(&assignment.ip_addr)?;
                    info!(
                        service = %service.name,
                        ip = %assignment.ip_addr,
                        host_id = %host_id,
                        "Service address assignment pins virtual IP owner"
                    );
                    host_id
                }
                AssignmentType::Static => assignment.host_id.clone(),
            };
            return hosts
                .iter()
                .find(|h| h.id == host_id)
                .cloned()
                .ok_or(PlacementError::NotInPool(host_id));
        }

        if hosts.is_empty() {
            return Err(PlacementError::NoHosts);
        }

        let loads = self.host_loads(hosts)?;

        let candidates: Vec<&Host> = match service.host_policy {
            HostPolicy::LeastCommitted => hosts.iter().collect(),
            HostPolicy::PreferSeparate => {
                // Spread: hosts not yet running this service come first.
                let empty: Vec<&Host> = hosts
                    .iter()
                    .filter(|h| {
                        loads
                            .get(h.id.as_str())
                            .map(|l| l.instances_of(&service.id) == 0)
                            .unwrap_or(true)
                    })
                    .collect();
                if empty.is_empty() {
                    hosts.iter().collect()
                } else {
                    empty
                }
            }
        };

        let selected = candidates
            .into_iter()
            .min_by(|a, b| {
                let ra = commitment_ratio(&loads, a);
                let rb = commitment_ratio(&loads, b);
                ra.partial_cmp(&rb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .ok_or(PlacementError::NoHosts)?;

        debug!(
            host_id = %selected.id,
            service = %service.name,
            "Selected host by committed memory"
        );
        Ok(selected.clone())
    }

    /// Resolves the owner of a bound virtual IP via its ephemeral owner node.
    fn virtual_ip_owner(&self, ip: &str) -> Result<String, PlacementError> {
        match self
            .conn
            .get::<VirtualIpOwner>(&paths::virtual_ip_owner_path(ip))
        {
            Ok(owner) => Ok(owner.host_id),
            Err(e) if e.is_no_node() => Err(PlacementError::NoOwner(ip.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads each host's command records and sums the ram commitments of the
    /// services running on it.
    fn host_loads(&self, hosts: &[Host]) -> Result<HashMap<String, HostLoad>, PlacementError> {
        let mut ram_by_service: HashMap<ServiceId, u64> = HashMap::new();
        let mut loads = HashMap::new();

        for host in hosts {
            let mut load = HostLoad::default();
            let state_ids = match self.conn.children(&paths::host_path(&host.id)) {
                Ok(ids) => ids,
                Err(e) if e.is_no_node() => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            for state_id in state_ids {
                let Ok(parsed) = state_id.parse::<StateId>() else {
                    continue;
                };
                let hs: HostState =
                    match self.conn.get(&paths::host_state_path(&host.id, &parsed)) {
                        Ok(hs) => hs,
                        Err(e) if e.is_no_node() => continue,
                        Err(e) => return Err(e.into()),
                    };
                let ram = match ram_by_service.get(&hs.service_id) {
                    Some(ram) => *ram,
                    None => {
                        let ram = match self
                            .conn
                            .get::<Service>(&paths::service_path(&hs.service_id))
                        {
                            Ok(svc) => svc.ram_commitment,
                            Err(e) if e.is_no_node() => 0,
                            Err(e) => return Err(e.into()),
                        };
                        ram_by_service.insert(hs.service_id, ram);
                        ram
                    }
                };
                load.committed += ram;
                *load.instance_counts.entry(hs.service_id).or_default() += 1;
            }
            loads.insert(host.id.clone(), load);
        }
        Ok(loads)
    }
}

#[derive(Debug, Default)]
struct HostLoad {
    committed: u64,
    instance_counts: HashMap<ServiceId, usize>,
}

impl HostLoad {
    fn instances_of(&self, service_id: &ServiceId) -> usize {
        self.instance_counts.get(service_id).copied().unwrap_or(0)
    }
}

fn commitment_ratio(loads: &HashMap<String, HostLoad>, host: &Host) -> f64 {
    let committed = loads.get(host.id.as_str()).map(|l| l.committed).unwrap_or(0);
    if host.memory == 0 {
        return f64::INFINITY;
    }
    committed as f64 / host.memory as f64
}
