//! The host agent.
//!
//! One per machine. Establishes a coordination session, registers this
//! host's liveness as an ephemeral node under its pool, and runs the three
//! listeners that share the session: instance commands, virtual IPs, and
//! ad-hoc container actions. Session loss tears everything down and
//! restarts the listeners from the top with a fresh session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use stevedore_coord::{paths, Client, Connection};
use stevedore_domain::Host;

use crate::action::ActionListener;
use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::error::AgentError;
use crate::listener::HostStateListener;
use crate::proxy::ProxyRegistry;
use crate::vip::{IpManager, VirtualIpListener};

pub struct HostAgent {
    client: Client,
    cfg: Arc<Config>,
    engine: Arc<dyn ContainerEngine>,
    ip_manager: Arc<dyn IpManager>,
    proxies: Arc<ProxyRegistry>,
    host_id: String,
    host_ip: String,
}

impl HostAgent {
    /// Fails fatally when the host id cannot be determined; an agent
    /// without a stable identity must not join the pool.
    pub fn new(
        client: Client,
        cfg: Config,
        engine: Arc<dyn ContainerEngine>,
        ip_manager: Arc<dyn IpManager>,
    ) -> Result<Self, AgentError> {
        let host_id = match &cfg.host_id {
            Some(id) => id.clone(),
            None => read_machine_id()?,
        };
        let host_ip = match &cfg.host_ip {
            Some(ip) => ip.clone(),
            None => default_outbound_ip()?,
        };
        Ok(Self {
            client,
            cfg: Arc::new(cfg),
            engine,
            ip_manager,
            proxies: Arc::new(ProxyRegistry::new()),
            host_id,
            host_ip,
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn host_ip(&self) -> &str {
        &self.host_ip
    }

    /// Runs until shutdown, re-establishing the session and restarting the
    /// listeners whenever it is lost.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            host_id = %self.host_id,
            host_ip = %self.host_ip,
            pool_id = %self.cfg.pool_id,
            "Starting host agent"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.client.connect() {
                Ok(conn) => {
                    self.serve(conn.clone(), shutdown.clone()).await;
                    conn.close();
                }
                Err(e) => warn!(error = %e, "Could not establish coordination session"),
            }
            if *shutdown.borrow() {
                break;
            }
            warn!(host_id = %self.host_id, "Session ended; reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(host_id = %self.host_id, "Host agent stopped");
    }

    /// One session's worth of work: register liveness, run the listeners
    /// until the session dies or shutdown arrives.
    async fn serve(&self, conn: Connection, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.register(&conn) {
            warn!(error = %e, "Host registration failed");
            return;
        }

        let vips = Arc::new(VirtualIpListener::new(
            conn.clone(),
            Arc::clone(&self.ip_manager),
            self.host_id.clone(),
        ));
        let vip_task = tokio::spawn(vips.listen(shutdown.clone()));

        let actions = Arc::new(ActionListener::new(
            conn.clone(),
            Arc::clone(&self.engine),
            self.host_id.clone(),
            self.cfg.action_timeout,
        ));
        let action_task = tokio::spawn(actions.listen(shutdown.clone()));

        let states = Arc::new(HostStateListener::new(
            conn,
            Arc::clone(&self.engine),
            Arc::clone(&self.proxies),
            Arc::clone(&self.cfg),
            self.host_id.clone(),
        ));
        states.listen(shutdown).await;

        vip_task.abort();
        action_task.abort();
    }

    /// Advertises liveness: an ephemeral node carrying this host's document
    /// under the pool registry. A leftover node from a previous session is
    /// replaced.
    fn register(&self, conn: &Connection) -> Result<(), AgentError> {
        conn.ensure_path(&paths::pool_hosts_path(&self.cfg.pool_id))?;
        let host = self.build_host();
        let path = paths::pool_host_path(&self.cfg.pool_id, &self.host_id);
        match conn.create_ephemeral(&path, &host) {
            Ok(()) => {}
            Err(e) if e.is_node_exists() => {
                conn.delete(&path)?;
                conn.create_ephemeral(&path, &host)?;
            }
            Err(e) => return Err(e.into()),
        }
        info!(host_id = %self.host_id, pool_id = %self.cfg.pool_id, "Host registered");
        Ok(())
    }

    fn build_host(&self) -> Host {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Host::new(
            &self.host_id,
            &self.cfg.pool_id,
            &self.host_ip,
            cores,
            total_memory(),
        )
    }
}

/// Stable host fingerprint from the machine id.
pub fn read_machine_id() -> Result<String, AgentError> {
    let raw = std::fs::read_to_string("/etc/machine-id")
        .map_err(|e| AgentError::HostId(e.to_string()))?;
    let id = raw.trim().to_string();
    if id.is_empty() {
        return Err(AgentError::HostId("/etc/machine-id is empty".to_string()));
    }
    Ok(id)
}

/// The address bound to the interface that carries default-route traffic.
pub fn default_outbound_ip() -> Result<String, AgentError> {
    let socket =
        std::net::UdpSocket::bind("0.0.0.0:0").map_err(|e| AgentError::HostIp(e.to_string()))?;
    socket
        .connect("8.8.8.8:53")
        .map_err(|e| AgentError::HostIp(e.to_string()))?;
    let addr = socket
        .local_addr()
        .map_err(|e| AgentError::HostIp(e.to_string()))?;
    Ok(addr.ip().to_string())
}

fn total_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|contents| parse_mem_total(&contents))
        .unwrap_or(0)
}

/// Parses the `MemTotal:` line of /proc/meminfo into bytes.
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parsing() {
        let meminfo = "MemTotal:       16326428 kB\nMemFree:         1024 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16326428 * 1024));
        assert_eq!(parse_mem_total("garbage"), None);
    }
}
