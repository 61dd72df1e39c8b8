//! Virtual-IP declaration sync.
//!
//! The pool's declared virtual-IP set is mirrored as persistent declaration
//! nodes under `/virtualIPs`. Agents watch the child set and race to create
//! the ephemeral `owner` child for each declaration; the leader's job here
//! is only to keep the declaration set in step with the pool document:
//! declare what the pool declares, and remove orphaned declarations (their
//! owner nodes die with the removal or the owning session).

use tracing::{debug, info, warn};

use stevedore_coord::{paths, Connection, CoordError};
use stevedore_domain::VirtualIp;

/// Reconciles `/virtualIPs/*` against the pool's declared set.
pub fn sync_virtual_ips(conn: &Connection, declared: &[VirtualIp]) -> Result<(), CoordError> {
    conn.ensure_path(paths::VIRTUAL_IPS_PATH)?;
    let current = conn.children(paths::VIRTUAL_IPS_PATH)?;

    for ip in &current {
        if !declared.iter().any(|vip| &vip.ip == ip) {
            info!(ip = %ip, "Removing orphaned virtual IP declaration");
            conn.delete_recursive(&paths::virtual_ip_path(ip))?;
        }
    }

    for vip in declared {
        let path = paths::virtual_ip_path(&vip.ip);
        if !current.contains(&vip.ip) {
            info!(ip = %vip.ip, pool_id = %vip.pool_id, "Declaring virtual IP");
            if let Err(e) = conn.create(&path, vip) {
                if !e.is_node_exists() {
                    return Err(e);
                }
            }
            continue;
        }
        // Refresh the payload when the declaration changed (netmask or
        // interface edits reach agents through their data watches).
        match conn.get::<VirtualIp>(&path) {
            Ok(existing) if &existing == vip => {}
            Ok(_) => {
                debug!(ip = %vip.ip, "Updating virtual IP declaration");
                conn.set(&path, vip)?;
            }
            Err(e) if e.is_no_node() => {
                warn!(ip = %vip.ip, "Virtual IP declaration vanished mid-sync");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
