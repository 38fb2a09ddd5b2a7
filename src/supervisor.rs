//! Connection supervisor
//!
//! Owns every session of one node. Inbound connections get a host-side
//! [`ServiceManager`]; `connect_to_host` creates initiator sessions. The
//! poll loop accepts, then reaps sessions that stopped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::PrimaryCache;
use crate::config::Config;
use crate::crypto_manager::CryptoStandard;
use crate::error::{ProtocolError, ProtocolResult};
use crate::service::{ServiceCatalog, ServiceHandle};
use crate::service_manager::ServiceManager;

struct SupervisorInner {
    catalog: ServiceCatalog,
    cache: Arc<PrimaryCache>,
    config: Config,
    sessions: Mutex<HashMap<SocketAddr, ServiceManager>>,
    hosting: AtomicBool,
    /// Bumped on every start/stop so a stale accept loop exits
    listener_generation: AtomicU64,
    listen_addr: Mutex<Option<SocketAddr>>,
}

/// Node-level owner of all sessions
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(catalog: ServiceCatalog, cache: Arc<PrimaryCache>, config: Config) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                catalog,
                cache,
                config,
                sessions: Mutex::new(HashMap::new()),
                hosting: AtomicBool::new(false),
                listener_generation: AtomicU64::new(0),
                listen_addr: Mutex::new(None),
            }),
        }
    }

    pub fn cache(&self) -> Arc<PrimaryCache> {
        self.inner.cache.clone()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Listen on `addr` and return the bound address
    ///
    /// Calling it while already hosting returns the current address.
    pub async fn start_hosting(&self, addr: SocketAddr) -> ProtocolResult<SocketAddr> {
        if let Some(bound) = *self.inner.listen_addr.lock() {
            if self.is_hosting() {
                return Ok(bound);
            }
        }

        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let generation = self.inner.listener_generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.inner.listen_addr.lock() = Some(bound);
        self.inner.hosting.store(true, Ordering::SeqCst);
        info!(addr = %bound, "hosting started");

        tokio::spawn(run_supervisor(self.inner.clone(), listener, generation));
        Ok(bound)
    }

    /// Stop the listener and every session
    pub fn stop_hosting(&self) {
        if self.inner.hosting.swap(false, Ordering::SeqCst) {
            self.inner.listener_generation.fetch_add(1, Ordering::SeqCst);
            *self.inner.listen_addr.lock() = None;
            info!("hosting stopped");
        }
        self.inner.stop_sessions();
    }

    pub fn stop(&self) {
        self.stop_hosting();
        self.inner.sessions.lock().clear();
    }

    pub fn is_hosting(&self) -> bool {
        self.inner.hosting.load(Ordering::SeqCst)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock()
    }

    /// Open an initiator session to `addr`
    pub async fn connect_to_host(
        &self,
        addr: SocketAddr,
        standard: CryptoStandard,
    ) -> ProtocolResult<ServiceManager> {
        let mut config = self.inner.config.clone();
        config.crypto.standard = standard;

        let session = ServiceManager::connect(
            addr,
            self.inner.catalog.clone(),
            self.inner.cache.clone(),
            &config,
        )
        .await?;

        if let Some(previous) = self.inner.sessions.lock().insert(addr, session.clone()) {
            previous.stop();
        }
        info!(peer = %addr, "connected to host");
        Ok(session)
    }

    /// Addresses of live sessions, reaping dead ones first
    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.inner.reap();
        let mut peers: Vec<_> = self.inner.sessions.lock().keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn session(&self, addr: SocketAddr) -> Option<ServiceManager> {
        self.inner
            .sessions
            .lock()
            .get(&addr)
            .filter(|session| session.is_running())
            .cloned()
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.session(addr).is_some()
    }

    /// Add a service to the session with `addr`
    pub fn add_service_to_node(
        &self,
        addr: SocketAddr,
        service: ServiceHandle,
    ) -> ProtocolResult<u64> {
        self.session(addr)
            .ok_or(ProtocolError::ConnectionClosed)?
            .add_service(service)
    }
}

impl SupervisorInner {
    fn accept(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        match ServiceManager::accept(stream, self.catalog.clone(), self.cache.clone(), &self.config) {
            Ok(session) => {
                info!(peer = %peer, "session accepted");
                if let Some(previous) = self.sessions.lock().insert(peer, session) {
                    previous.stop();
                }
            }
            Err(e) => warn!(peer = %peer, error = %e, "failed to start session"),
        }
    }

    fn reap(&self) {
        self.sessions.lock().retain(|peer, session| {
            let alive = session.is_running();
            if !alive {
                debug!(peer = %peer, "session reaped");
            }
            alive
        });
    }

    fn stop_sessions(&self) {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.stop();
        }
    }
}

async fn run_supervisor(inner: Arc<SupervisorInner>, listener: TcpListener, generation: u64) {
    let interval = inner.config.supervisor.poll_interval();

    while inner.listener_generation.load(Ordering::SeqCst) == generation {
        match timeout(interval, listener.accept()).await {
            Ok(Ok((stream, peer))) => inner.accept(stream, peer),
            Ok(Err(e)) => warn!(error = %e, "accept failed"),
            Err(_) => {}
        }
        inner.reap();
    }
    debug!("accept loop finished");
}
