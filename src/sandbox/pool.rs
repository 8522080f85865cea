//! Sandbox pool
//!
//! Maps peer fingerprints to sandboxes and bridges inbound connections into
//! them. Entries are never evicted: a returning peer always lands in the
//! same sandbox for the lifetime of the pool.

use moka::future::Cache;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::core::{EventSink, RuntimeState, SandboxBackend};
use crate::error::{Error, Result};
use crate::sandbox::conn::{ActivityTrackingConn, Transport};
use crate::sandbox::fingerprint::Fingerprint;
use crate::sandbox::instance::{Sandbox, SandboxDetail, Shared};

/// Address of one side of an inbound connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    /// Any other address family, described for error reporting
    Other(String),
}

/// An accepted connection the pool can route into a sandbox
pub trait Inbound {
    fn local_endpoint(&self) -> io::Result<Endpoint>;
    fn remote_endpoint(&self) -> io::Result<Endpoint>;
}

impl Inbound for tokio::net::TcpStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr().map(Endpoint::Tcp)
    }

    fn remote_endpoint(&self) -> io::Result<Endpoint> {
        self.peer_addr().map(Endpoint::Tcp)
    }
}

#[cfg(unix)]
impl Inbound for tokio::net::UnixStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        Ok(Endpoint::Other("unix".to_string()))
    }

    fn remote_endpoint(&self) -> io::Result<Endpoint> {
        Ok(Endpoint::Other("unix".to_string()))
    }
}

/// One UDP session, identified by the datagram's addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPeer {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Inbound for UdpPeer {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        Ok(Endpoint::Udp(self.local))
    }

    fn remote_endpoint(&self) -> io::Result<Endpoint> {
        Ok(Endpoint::Udp(self.remote))
    }
}

/// Per-peer sandbox pool
pub struct SandboxPool {
    shared: Arc<Shared>,
    sandboxes: Cache<Fingerprint, Arc<Sandbox>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SandboxPool {
    /// Create a pool; fails if the idle thresholds are inconsistent
    pub fn new(
        config: SandboxConfig,
        backend: Arc<dyn SandboxBackend>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.idle.check()?;

        let (shutdown_tx, shutdown) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            backend,
            events,
            shutdown,
        });

        info!(
            "Sandbox pool ready (backend: {}, template: {})",
            shared.backend.name(),
            shared.config.template
        );

        Ok(Self {
            shared,
            sandboxes: Cache::builder().build(),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.shared.config
    }

    /// Route an inbound connection into the sandbox of its peer.
    ///
    /// The target port and transport are taken from the local endpoint,
    /// the sandbox from the remote host. The returned connection keeps the
    /// sandbox's idle clock fresh and reactivates it on traffic.
    pub async fn dial<I: Inbound + ?Sized>(&self, inbound: &I) -> Result<ActivityTrackingConn> {
        let (transport, port) = match inbound.local_endpoint()? {
            Endpoint::Tcp(addr) => (Transport::Tcp, addr.port()),
            Endpoint::Udp(addr) => (Transport::Udp, addr.port()),
            Endpoint::Other(family) => return Err(Error::UnsupportedAddressFamily(family)),
        };

        let remote = match inbound.remote_endpoint()? {
            Endpoint::Tcp(addr) | Endpoint::Udp(addr) => addr,
            Endpoint::Other(family) => return Err(Error::UnsupportedAddressFamily(family)),
        };

        if self.shared.is_shutting_down() {
            return Err(Error::Cancelled("sandbox pool is shutting down".to_string()));
        }

        let sandbox = self.sandbox_for(Fingerprint::from_peer(remote)).await;
        debug!(
            "Connection from {} to {}/{} routed to {}",
            remote,
            port,
            transport,
            sandbox.name()
        );

        sandbox.ensure_ready().await?;
        let conn = sandbox.dial(transport, port).await?;

        Ok(ActivityTrackingConn::new(conn, sandbox))
    }

    /// Get or create the sandbox of `fingerprint`
    pub async fn sandbox_for(&self, fingerprint: Fingerprint) -> Arc<Sandbox> {
        let shared = Arc::clone(&self.shared);
        let entry = self
            .sandboxes
            .entry(fingerprint)
            .or_insert_with(async move { Arc::new(Sandbox::new(fingerprint, shared)) })
            .await;

        if entry.is_fresh() {
            debug!("New sandbox entry {}", entry.value().name());
        }
        entry.into_value()
    }

    pub async fn get(&self, fingerprint: Fingerprint) -> Option<Arc<Sandbox>> {
        self.sandboxes.get(&fingerprint).await
    }

    /// Number of sandboxes in the pool
    pub fn len(&self) -> usize {
        self.sandboxes.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every pooled sandbox, ordered by name
    pub async fn sandboxes(&self) -> Vec<SandboxDetail> {
        let sandboxes: Vec<Arc<Sandbox>> = self.sandboxes.iter().map(|(_, s)| s).collect();

        let mut details = Vec::with_capacity(sandboxes.len());
        for sandbox in sandboxes {
            details.push(sandbox.detail().await);
        }
        details.sort_by(|a, b| a.name.cmp(&b.name));
        details
    }

    /// Register instances left behind by a previous run.
    ///
    /// Only instances named with the pool's prefix and not stopped are
    /// adopted; each gets a housekeeper. Returns the number adopted.
    pub async fn adopt_existing(&self) -> Result<usize> {
        let backend = &self.shared.backend;
        let prefix = &self.shared.config.name_prefix;
        let mut adopted = 0;

        for name in backend.list().await? {
            let Some(fingerprint) = Fingerprint::from_sandbox_name(&name, prefix) else {
                continue;
            };
            if self.sandboxes.contains_key(&fingerprint) {
                continue;
            }

            let handle = match backend.lookup(&name).await {
                Ok(Some(handle)) => handle,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Could not open existing sandbox {}: {}", name, e);
                    continue;
                }
            };

            let state = match handle.state().await {
                Ok(RuntimeState::Stopped) => {
                    debug!("Leaving stopped sandbox {} alone", name);
                    continue;
                }
                Ok(state) => state,
                Err(e) => {
                    warn!("Could not query state of sandbox {}: {}", name, e);
                    continue;
                }
            };

            let shared = Arc::clone(&self.shared);
            let entry = self
                .sandboxes
                .entry(fingerprint)
                .or_insert_with(async move {
                    Arc::new(Sandbox::adopted(fingerprint, shared, handle, state))
                })
                .await;
            if !entry.is_fresh() {
                continue;
            }

            info!("Adopted {} sandbox {}", state, name);
            entry.into_value().arm().await;
            adopted += 1;
        }

        Ok(adopted)
    }

    /// Signal every housekeeper and in-flight settle or dial to stop.
    ///
    /// Sandboxes are left in whatever state they are in.
    pub fn shutdown(&self) {
        info!("Shutting down sandbox pool");
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("backend", &self.shared.backend.name())
            .field("template", &self.shared.config.template)
            .field("sandboxes", &self.len())
            .finish()
    }
}
