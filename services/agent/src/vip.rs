//! Virtual-IP binding.
//!
//! The leader declares virtual IPs as nodes under `/virtualIPs`; agents
//! watch the declarations and race to create the ephemeral `owner` child.
//! The winner binds the address on an alias sub-interface
//! (`<bind_interface>:sv<index>`). When the owner's session dies the node
//! disappears and the survivors race again, so failover needs no
//! coordination beyond the store.
//!
//! Kernel state is authoritative: before binding, the agent asks `ip` which
//! addresses are already present on the host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use stevedore_coord::{paths, Connection, WatchEvent};
use stevedore_domain::{VirtualIp, VirtualIpOwner};

/// Alias prefix: addresses land on `<iface>:sv<n>`.
pub const VIP_ALIAS_PREFIX: &str = "sv";

const IP_BINARY: &str = "/sbin/ip";

#[derive(Debug, thiserror::Error)]
pub enum VipError {
    #[error("requested virtual ip {0} already on this host")]
    AlreadyBound(String),

    #[error("ip command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Kernel IP alias management.
#[async_trait]
pub trait IpManager: Send + Sync {
    async fn bind(&self, vip: &VirtualIp, alias: &str) -> Result<(), VipError>;

    async fn unbind(&self, vip: &VirtualIp, alias: &str) -> Result<(), VipError>;

    /// Addresses currently present on this host, `ip → interface label`.
    async fn mapped(&self) -> Result<HashMap<String, String>, VipError>;
}

/// Shells out to the platform `ip` utility.
pub struct SysIpManager;

#[async_trait]
impl IpManager for SysIpManager {
    async fn bind(&self, vip: &VirtualIp, alias: &str) -> Result<(), VipError> {
        let cidr = format!("{}/{}", vip.ip, netmask_prefix(&vip.netmask));
        run_ip(&[
            "addr",
            "add",
            &cidr,
            "dev",
            &vip.bind_interface,
            "label",
            alias,
        ])
        .await
    }

    async fn unbind(&self, vip: &VirtualIp, _alias: &str) -> Result<(), VipError> {
        let cidr = format!("{}/{}", vip.ip, netmask_prefix(&vip.netmask));
        run_ip(&["addr", "del", &cidr, "dev", &vip.bind_interface]).await
    }

    async fn mapped(&self) -> Result<HashMap<String, String>, VipError> {
        let output = tokio::process::Command::new(IP_BINARY)
            .args(["-4", "-o", "addr"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(VipError::Command(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(parse_addr_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

async fn run_ip(args: &[&str]) -> Result<(), VipError> {
    let output = tokio::process::Command::new(IP_BINARY)
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(VipError::Command(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Parses `ip -4 -o addr` one-line output into `ip → interface label`.
fn parse_addr_output(output: &str) -> HashMap<String, String> {
    let mut mapped = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        if let Some(ip) = fields[3].split('/').next() {
            mapped.insert(ip.to_string(), fields[1].to_string());
        }
    }
    mapped
}

/// Prefix length for a dotted netmask; falls back to /32 on garbage (the
/// facade validated it on the way in).
fn netmask_prefix(netmask: &str) -> u32 {
    netmask
        .parse::<std::net::Ipv4Addr>()
        .map(|m| u32::from(m).count_ones())
        .unwrap_or(32)
}

/// Records binds in memory; the test stand-in for [`SysIpManager`].
#[derive(Default)]
pub struct MockIpManager {
    bound: Mutex<HashMap<String, String>>,
}

impl MockIpManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.bound.lock().unwrap().keys().cloned().collect();
        ips.sort();
        ips
    }
}

#[async_trait]
impl IpManager for MockIpManager {
    async fn bind(&self, vip: &VirtualIp, alias: &str) -> Result<(), VipError> {
        let mut bound = self.bound.lock().unwrap();
        if bound.contains_key(&vip.ip) {
            return Err(VipError::AlreadyBound(vip.ip.clone()));
        }
        bound.insert(vip.ip.clone(), alias.to_string());
        Ok(())
    }

    async fn unbind(&self, vip: &VirtualIp, _alias: &str) -> Result<(), VipError> {
        self.bound.lock().unwrap().remove(&vip.ip);
        Ok(())
    }

    async fn mapped(&self) -> Result<HashMap<String, String>, VipError> {
        Ok(self.bound.lock().unwrap().clone())
    }
}

/// Watches virtual-IP declarations and maintains this host's bindings.
pub struct VirtualIpListener {
    conn: Connection,
    manager: Arc<dyn IpManager>,
    host_id: String,
    /// ip → alias index for addresses this agent bound.
    indices: Mutex<HashMap<String, usize>>,
    /// Serializes kernel bind/unbind operations.
    bind_lock: tokio::sync::Mutex<()>,
}

impl VirtualIpListener {
    pub fn new(conn: Connection, manager: Arc<dyn IpManager>, host_id: impl Into<String>) -> Self {
        Self {
            conn,
            manager,
            host_id: host_id.into(),
            indices: Mutex::new(HashMap::new()),
            bind_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.conn.ensure_path(paths::VIRTUAL_IPS_PATH) {
            warn!(error = %e, "Could not create virtual IP path");
            return;
        }

        let (done_tx, mut done_rx) = mpsc::channel::<String>(16);
        let mut watching: std::collections::HashSet<String> = Default::default();

        loop {
            let (ips, watch) = match self.conn.children_w(paths::VIRTUAL_IPS_PATH) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Virtual IP watch failed");
                    return;
                }
            };

            for ip in ips {
                if watching.insert(ip.clone()) {
                    let listener = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        listener.watch_virtual_ip(&ip, shutdown).await;
                        let _ = done.send(ip).await;
                    });
                }
            }

            tokio::select! {
                event = watch.wait() => match event {
                    WatchEvent::Deleted | WatchEvent::SessionLost => return,
                    _ => continue,
                },
                Some(finished) = done_rx.recv() => {
                    watching.remove(&finished);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Tracks one declaration: acquire ownership when unowned, bind on
    /// acquisition, release when the declaration goes away.
    async fn watch_virtual_ip(&self, ip: &str, mut shutdown: watch::Receiver<bool>) {
        let decl_path = paths::virtual_ip_path(ip);
        // Remembered so the address can still be unbound once the
        // declaration node is gone.
        let mut known: Option<VirtualIp> = None;
        loop {
            let (vip, decl_watch) = match self.conn.get_w::<VirtualIp>(&decl_path) {
                Ok(v) => v,
                Err(e) => {
                    if e.is_no_node() {
                        if let Some(vip) = &known {
                            self.release_ip(vip).await;
                        }
                    } else {
                        warn!(ip = %ip, error = %e, "Could not load virtual IP declaration");
                    }
                    return;
                }
            };
            known = Some(vip.clone());
            let (children, owner_watch) = match self.conn.children_w(&decl_path) {
                Ok(v) => v,
                Err(_) => return,
            };

            if !children.iter().any(|c| c == "owner") {
                match self.conn.create_ephemeral(
                    &paths::virtual_ip_owner_path(ip),
                    &VirtualIpOwner {
                        host_id: self.host_id.clone(),
                    },
                ) {
                    Ok(()) => {
                        info!(ip = %ip, host_id = %self.host_id, "Acquired virtual IP");
                        if let Err(e) = self.bind_ip(&vip).await {
                            warn!(ip = %ip, error = %e, "Bind failed; releasing ownership");
                            let _ = self.conn.delete(&paths::virtual_ip_owner_path(ip));
                        }
                    }
                    Err(e) if e.is_node_exists() => {
                        debug!(ip = %ip, "Lost virtual IP race");
                    }
                    Err(_) => return,
                }
            }

            tokio::select! {
                biased;
                event = decl_watch.wait() => match event {
                    WatchEvent::Deleted => {
                        self.release_ip(&vip).await;
                        return;
                    }
                    WatchEvent::SessionLost => return,
                    _ => continue,
                },
                event = owner_watch.wait() => match event {
                    // Owner appeared or vanished; re-evaluate from the top.
                    WatchEvent::ChildrenChanged => continue,
                    WatchEvent::Deleted | WatchEvent::SessionLost => return,
                    _ => continue,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.release_ip(&vip).await;
                        return;
                    }
                }
            }
        }
    }

    async fn bind_ip(&self, vip: &VirtualIp) -> Result<(), VipError> {
        let _guard = self.bind_lock.lock().await;
        let mapped = self.manager.mapped().await?;
        if mapped.contains_key(&vip.ip) {
            debug!(ip = %vip.ip, "Address already present on this host");
            return Ok(());
        }

        let index = {
            let mut indices = self.indices.lock().expect("vip indices poisoned");
            let index = next_free_index(&indices);
            indices.insert(vip.ip.clone(), index);
            index
        };
        let alias = format!("{}:{VIP_ALIAS_PREFIX}{index}", vip.bind_interface);
        match self.manager.bind(vip, &alias).await {
            Ok(()) => {
                info!(ip = %vip.ip, alias = %alias, "Bound virtual IP");
                Ok(())
            }
            Err(e) => {
                self.indices
                    .lock()
                    .expect("vip indices poisoned")
                    .remove(&vip.ip);
                Err(e)
            }
        }
    }

    async fn release_ip(&self, vip: &VirtualIp) {
        let _guard = self.bind_lock.lock().await;
        let index = {
            let mut indices = self.indices.lock().expect("vip indices poisoned");
            indices.remove(&vip.ip)
        };
        let Some(index) = index else {
            return;
        };
        let alias = format!("{}:{VIP_ALIAS_PREFIX}{index}", vip.bind_interface);
        if let Err(e) = self.manager.unbind(vip, &alias).await {
            warn!(ip = %vip.ip, error = %e, "Unbind failed");
        } else {
            info!(ip = %vip.ip, alias = %alias, "Unbound virtual IP");
        }
        // Drop the ownership record if it is still ours to drop.
        match self
            .conn
            .get::<VirtualIpOwner>(&paths::virtual_ip_owner_path(&vip.ip))
        {
            Ok(owner) if owner.host_id == self.host_id => {
                let _ = self.conn.delete(&paths::virtual_ip_owner_path(&vip.ip));
            }
            _ => {}
        }
    }
}

fn next_free_index(indices: &HashMap<String, usize>) -> usize {
    let mut index = 0;
    while indices.values().any(|i| *i == index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_addr_output() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 10.0.0.10/24 brd 10.0.0.255 scope global eth0\\       valid_lft forever preferred_lft forever
2: eth0    inet 10.0.0.50/24 scope global secondary eth0:sv0\\       valid_lft forever preferred_lft forever
";
        let mapped = parse_addr_output(output);
        assert_eq!(mapped.get("127.0.0.1").map(String::as_str), Some("lo"));
        assert_eq!(mapped.get("10.0.0.10").map(String::as_str), Some("eth0"));
        assert_eq!(mapped.get("10.0.0.50").map(String::as_str), Some("eth0"));
    }

    #[test]
    fn netmask_prefixes() {
        assert_eq!(netmask_prefix("255.255.255.0"), 24);
        assert_eq!(netmask_prefix("255.255.240.0"), 20);
        assert_eq!(netmask_prefix("255.255.255.255"), 32);
    }

    #[test]
    fn alias_indices_fill_gaps() {
        let mut indices = HashMap::new();
        indices.insert("10.0.0.1".to_string(), 0);
        indices.insert("10.0.0.3".to_string(), 2);
        assert_eq!(next_free_index(&indices), 1);
    }
}
