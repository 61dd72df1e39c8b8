//! Per-agent registry of L4 forwarders.
//!
//! Each export endpoint with a public address assignment gets a forwarder
//! from `(assignment.ip, assignment.port)` to the instance's
//! `(private_ip, port)`. Registered under `"{service}:{endpoint}"`;
//! lifetimes are bound to the instance: created after a successful start,
//! removed on exit.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stevedore_domain::Protocol;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy already registered for {0}")]
    Conflict(String),

    #[error("invalid proxy address {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An IP and port grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub ip: String,
    pub port: u16,
}

impl ProxyAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr, ProxyError> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(format!("{}:{}", self.ip, self.port)))
    }
}

/// A running forwarder. Dropping the handle does not stop it; removal
/// through the registry does.
pub struct ProxyHandle {
    pub frontend: ProxyAddress,
    pub backend: ProxyAddress,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    fn close(self) {
        self.task.abort();
    }
}

/// Map of active forwarders keyed by `"{service}:{endpoint}"`.
#[derive(Default)]
pub struct ProxyRegistry {
    registry: Mutex<HashMap<String, ProxyHandle>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates, registers, and starts a forwarder. Fails `Conflict` when the
    /// key is already registered.
    pub async fn create_proxy(
        &self,
        key: impl Into<String>,
        protocol: Protocol,
        frontend: ProxyAddress,
        backend: ProxyAddress,
    ) -> Result<(), ProxyError> {
        let key = key.into();
        {
            let registry = self.registry.lock().expect("proxy registry poisoned");
            if registry.contains_key(&key) {
                return Err(ProxyError::Conflict(key));
            }
        }

        let front_addr = frontend.socket_addr()?;
        let back_addr = backend.socket_addr()?;
        let task = match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(front_addr).await?;
                tokio::spawn(run_tcp_proxy(listener, back_addr))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(front_addr).await?;
                tokio::spawn(run_udp_proxy(socket, back_addr))
            }
        };
        info!(
            key = %key,
            frontend = %front_addr,
            backend = %back_addr,
            protocol = protocol.as_str(),
            "Proxy registered"
        );

        let mut registry = self.registry.lock().expect("proxy registry poisoned");
        if registry.contains_key(&key) {
            task.abort();
            return Err(ProxyError::Conflict(key));
        }
        registry.insert(
            key,
            ProxyHandle {
                frontend,
                backend,
                task,
            },
        );
        Ok(())
    }

    /// Stops and removes a forwarder, returning its addresses. Unknown keys
    /// return `None`.
    pub fn remove_proxy(&self, key: &str) -> Option<(ProxyAddress, ProxyAddress)> {
        let handle = self
            .registry
            .lock()
            .expect("proxy registry poisoned")
            .remove(key)?;
        let addresses = (handle.frontend.clone(), handle.backend.clone());
        debug!(key = %key, "Proxy removed");
        handle.close();
        Some(addresses)
    }

    /// Stops and removes every forwarder whose key starts with `prefix`.
    /// Instance teardown uses this with the `"{service}:"` prefix so proxies
    /// die even when the service document is already gone.
    pub fn remove_by_prefix(&self, prefix: &str) {
        let removed: Vec<ProxyHandle> = {
            let mut registry = self.registry.lock().expect("proxy registry poisoned");
            let keys: Vec<String> = registry
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| registry.remove(&k))
                .collect()
        };
        for handle in removed {
            handle.close();
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().expect("proxy registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_tcp_proxy(listener: TcpListener, backend: SocketAddr) {
    loop {
        match listener.accept().await {
            Ok((mut client, peer)) => {
                tokio::spawn(async move {
                    match TcpStream::connect(backend).await {
                        Ok(mut upstream) => {
                            if let Err(e) = copy_bidirectional(&mut client, &mut upstream).await {
                                debug!(peer = %peer, error = %e, "Proxy connection ended");
                            }
                        }
                        Err(e) => {
                            warn!(backend = %backend, error = %e, "Backend connect failed");
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Proxy accept error");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Naive datagram relay: one upstream socket per client, return traffic
/// routed back by peer address.
async fn run_udp_proxy(socket: UdpSocket, backend: SocketAddr) {
    let socket = std::sync::Arc::new(socket);
    let mut upstreams: HashMap<SocketAddr, std::sync::Arc<UdpSocket>> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "UDP proxy recv error");
                continue;
            }
        };

        let upstream = match upstreams.get(&peer) {
            Some(upstream) => upstream.clone(),
            None => {
                let Ok(upstream) = UdpSocket::bind("0.0.0.0:0").await else {
                    continue;
                };
                if upstream.connect(backend).await.is_err() {
                    continue;
                }
                let upstream = std::sync::Arc::new(upstream);
                upstreams.insert(peer, upstream.clone());

                // Return path for this client.
                let downstream = socket.clone();
                let from_backend = upstream.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    while let Ok(len) = from_backend.recv(&mut buf).await {
                        if downstream.send_to(&buf[..len], peer).await.is_err() {
                            break;
                        }
                    }
                });
                upstream
            }
        };

        if let Err(e) = upstream.send(&buf[..len]).await {
            debug!(peer = %peer, error = %e, "UDP forward failed");
            upstreams.remove(&peer);
        }
    }
}
