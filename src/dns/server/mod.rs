//! DNS forwarder: listeners and the query pipeline
//!
//! The forwarder owns up to three listen endpoints (plain UDP+TCP, DoT,
//! DoH), accepts client queries, rewrites each query with an EDNS
//! Client-Subnet option reflecting the configured public IP, dispatches
//! it to the resolver chosen by the zone router, and returns the
//! upstream response unchanged.
//!
//! # Query pipeline
//!
//! ```text
//! client -> listener -> handle_query
//!             parse -> route -> inject ECS -> repack -> resolver.query
//!           reply (upstream response, or ServFail-patched query) -> client
//! ```
//!
//! Malformed input is dropped without a reply so the forwarder cannot be
//! used for amplification; once a query parses, every downstream failure
//! maps onto a ServFail built from the original bytes, which clients
//! handle better than silence.
//!
//! # Lifecycle
//!
//! ```text
//! Unstarted --start()--> Running --stop()--> Stopped
//! ```
//!
//! `start()` binds every configured socket before spawning any accept
//! task; a bind failure closes the sockets bound so far and surfaces the
//! error. `stop()` is a no-op once stopped.

pub mod doh;
mod tcp;
mod udp;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::error::{DnsError, DnsResult};
use super::message::{self, QueryMsg, RCODE_SERVFAIL, TYPE_AAAA};
use super::router::{RouteMatch, Router};
use crate::config::myip::MyIp;

/// Largest accepted client query (bytes).
pub const MAX_QUERY_SIZE: usize = 512;
/// Smallest accepted client query: anything not longer than a bare
/// header carries no question.
pub const MIN_QUERY_SIZE: usize = 12;

/// Per-query upstream deadline. Deliberately below the 5 s default of
/// stub resolvers like `dig`, so clients see a ServFail instead of their
/// own timeout firing.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(4);

/// TLS certificate and key for a TLS-terminating listener.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Create an identity from parsed certificate chain and key.
    #[must_use]
    pub fn new(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { certs, key }
    }

    /// Load a PEM certificate chain and private key from files.
    ///
    /// # Errors
    ///
    /// Fails when either file is unreadable or contains no usable PEM
    /// material.
    pub fn load(cert_file: &std::path::Path, key_file: &std::path::Path) -> DnsResult<Self> {
        let cert_data = std::fs::read(cert_file).map_err(|e| {
            DnsError::config(format!("failed to read cert file {}: {e}", cert_file.display()))
        })?;
        let certs = rustls_pemfile::certs(&mut cert_data.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DnsError::config(format!("invalid certificate PEM: {e}")))?;
        if certs.is_empty() {
            return Err(DnsError::config(format!(
                "no certificates in {}",
                cert_file.display()
            )));
        }

        let key_data = std::fs::read(key_file).map_err(|e| {
            DnsError::config(format!("failed to read key file {}: {e}", key_file.display()))
        })?;
        let key = rustls_pemfile::private_key(&mut key_data.as_slice())
            .map_err(|e| DnsError::config(format!("invalid key PEM: {e}")))?
            .ok_or_else(|| {
                DnsError::config(format!("no private key in {}", key_file.display()))
            })?;

        Ok(Self { certs, key })
    }

    /// Build a server-side TLS config with the given ALPN preference.
    fn server_config(&self, alpn: &[&[u8]]) -> DnsResult<Arc<rustls::ServerConfig>> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| DnsError::config(format!("invalid certificate/key pair: {e}")))?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }
}

/// One listen endpoint; TLS-terminating protocols carry an identity.
pub struct ListenConfig {
    /// Address to bind.
    pub addr: SocketAddr,
    /// TLS identity; required for DoT and DoH.
    pub tls: Option<TlsIdentity>,
}

impl ListenConfig {
    /// Plaintext endpoint.
    #[must_use]
    pub fn plain(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }

    /// TLS-terminating endpoint.
    #[must_use]
    pub fn with_tls(addr: SocketAddr, identity: TlsIdentity) -> Self {
        Self {
            addr,
            tls: Some(identity),
        }
    }
}

/// Addresses actually bound by a running forwarder. With port 0 in the
/// listen config these carry the kernel-assigned ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundAddrs {
    /// UDP socket address.
    pub udp: Option<SocketAddr>,
    /// TCP listener address.
    pub tcp: Option<SocketAddr>,
    /// DoT listener address.
    pub dot: Option<SocketAddr>,
    /// DoH listener address.
    pub doh: Option<SocketAddr>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    bound: BoundAddrs,
}

/// The query pipeline shared by every listener.
///
/// Holds what one query needs end to end: the router that picks the
/// resolver and the public-IP store feeding the client-subnet option.
pub struct DnsHandler {
    router: Arc<Router>,
    myip: Arc<MyIp>,
}

impl DnsHandler {
    /// Create a handler over a router and public-IP store.
    #[must_use]
    pub fn new(router: Arc<Router>, myip: Arc<MyIp>) -> Self {
        Self { router, myip }
    }

    /// Process one client query and produce the reply, if any.
    ///
    /// Returns `None` for input that must be dropped without an answer
    /// (length out of bounds, unparsable query); otherwise returns
    /// either the upstream response unchanged or the ServFail-patched
    /// copy of the original query.
    pub async fn handle_query(&self, query: &[u8], from_udp: bool) -> Option<Vec<u8>> {
        let n = query.len();
        if n <= MIN_QUERY_SIZE || n > MAX_QUERY_SIZE {
            debug!(len = n, "malformatted query dropped");
            return None;
        }

        let mut parsed = match QueryMsg::parse(query) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "invalid query packet dropped");
                return None;
            }
        };

        // ServFail fallback, patched from the original bytes.
        let mut fallback = query.to_vec();
        if message::set_rcode(&mut fallback, RCODE_SERVFAIL).is_err() {
            return None;
        }

        // The first matching route owns the query even while a partial
        // update has left it without a resolver; routing-absent means
        // ServFail, never a silent detour to another upstream.
        let (resolver, route_index) = match self.router.resolver_for(parsed.qname()).await {
            RouteMatch::Resolver(resolver, index) => (resolver, index),
            RouteMatch::NoResolver(index) => {
                debug!(qname = %parsed.qname_lossy(), route = index, "matched route has no resolver");
                return Some(fallback);
            }
            RouteMatch::None => {
                debug!(qname = %parsed.qname_lossy(), "no resolver available");
                return Some(fallback);
            }
        };

        // AAAA queries get the IPv6 subnet, everything else IPv4; with
        // no valid public IP the query is forwarded unmodified.
        let subnet = if parsed.qtype() == TYPE_AAAA {
            self.myip.v6().map(IpAddr::V6)
        } else {
            self.myip.v4().map(IpAddr::V4)
        };
        if let Some(addr) = subnet {
            if let Err(e) = parsed.set_ecs(addr, 0) {
                warn!(error = %e, "failed to set client subnet");
            }
        }

        let msg = match parsed.build() {
            Ok(msg) => msg,
            Err(e) => {
                error!(error = %e, "failed to build query");
                return Some(fallback);
            }
        };

        match timeout(QUERY_TIMEOUT, resolver.query(&msg, from_udp)).await {
            Ok(Ok(resp)) => Some(resp),
            Ok(Err(e)) => {
                warn!(qname = %parsed.qname_lossy(), route = route_index, error = %e, "upstream query failed");
                Some(fallback)
            }
            Err(_) => {
                warn!(qname = %parsed.qname_lossy(), route = route_index, "query timed out");
                Some(fallback)
            }
        }
    }
}

/// Multi-protocol DNS forwarder.
pub struct Forwarder {
    listen: Option<ListenConfig>,
    listen_dot: Option<ListenConfig>,
    listen_doh: Option<ListenConfig>,
    router: Arc<Router>,
    handler: Arc<DnsHandler>,
    state: Mutex<Option<Running>>,
}

impl Forwarder {
    /// Create a forwarder with no listeners configured.
    #[must_use]
    pub fn new(router: Arc<Router>, myip: Arc<MyIp>) -> Self {
        let handler = Arc::new(DnsHandler::new(Arc::clone(&router), myip));
        Self {
            listen: None,
            listen_dot: None,
            listen_doh: None,
            router,
            handler,
            state: Mutex::new(None),
        }
    }

    /// Configure the plain UDP+TCP endpoint.
    #[must_use]
    pub fn with_listen(mut self, listen: Option<ListenConfig>) -> Self {
        self.listen = listen;
        self
    }

    /// Configure the DoT endpoint.
    #[must_use]
    pub fn with_listen_dot(mut self, listen: Option<ListenConfig>) -> Self {
        self.listen_dot = listen;
        self
    }

    /// Configure the DoH endpoint.
    #[must_use]
    pub fn with_listen_doh(mut self, listen: Option<ListenConfig>) -> Self {
        self.listen_doh = listen;
        self
    }

    /// The router serving this forwarder.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The query pipeline shared by the listeners.
    #[must_use]
    pub fn handler(&self) -> &Arc<DnsHandler> {
        &self.handler
    }

    /// Bind all configured sockets and spawn the accept tasks.
    ///
    /// # Errors
    ///
    /// Fails when no listener is configured, when already running, when
    /// a TLS endpoint lacks a certificate, or when any bind fails (in
    /// which case sockets bound so far are closed again).
    pub async fn start(&self) -> DnsResult<BoundAddrs> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(DnsError::internal("forwarder already started"));
        }
        if self.listen.is_none() && self.listen_dot.is_none() && self.listen_doh.is_none() {
            return Err(DnsError::config("no listen address configured"));
        }

        let mut bound = BoundAddrs::default();

        // Bind phase: everything binds before anything serves. An early
        // return drops (closes) the sockets bound so far.
        let plain = match &self.listen {
            Some(lc) => {
                let udp = UdpSocket::bind(lc.addr).await.map_err(|e| {
                    DnsError::network_io(format!("failed to listen UDP at {}", lc.addr), e)
                })?;
                let tcp = TcpListener::bind(lc.addr).await.map_err(|e| {
                    DnsError::network_io(format!("failed to listen TCP at {}", lc.addr), e)
                })?;
                bound.udp = Some(udp.local_addr()?);
                bound.tcp = Some(tcp.local_addr()?);
                info!(addr = %lc.addr, "bound UDP+TCP forwarder");
                Some((udp, tcp))
            }
            None => None,
        };

        let dot = match &self.listen_dot {
            Some(lc) => {
                let identity = lc.tls.as_ref().ok_or_else(|| {
                    DnsError::config("DoT listener requires a certificate")
                })?;
                let acceptor = TlsAcceptor::from(identity.server_config(&[])?);
                let listener = TcpListener::bind(lc.addr).await.map_err(|e| {
                    DnsError::network_io(format!("failed to listen DoT at {}", lc.addr), e)
                })?;
                bound.dot = Some(listener.local_addr()?);
                info!(addr = %lc.addr, "bound DoT forwarder");
                Some((listener, acceptor))
            }
            None => None,
        };

        let doh = match &self.listen_doh {
            Some(lc) => {
                let identity = lc.tls.as_ref().ok_or_else(|| {
                    DnsError::config("DoH listener requires a certificate")
                })?;
                // HTTP/2 via ALPN, with HTTP/1.1 as fallback.
                let acceptor = TlsAcceptor::from(identity.server_config(&[b"h2", b"http/1.1"])?);
                let listener = TcpListener::bind(lc.addr).await.map_err(|e| {
                    DnsError::network_io(format!("failed to listen DoH at {}", lc.addr), e)
                })?;
                bound.doh = Some(listener.local_addr()?);
                info!(addr = %lc.addr, "bound DoH forwarder");
                Some((listener, acceptor))
            }
            None => None,
        };

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        if let Some((udp_socket, tcp_listener)) = plain {
            tasks.push(tokio::spawn(udp::serve_udp(
                Arc::clone(&self.handler),
                udp_socket,
                shutdown.subscribe(),
            )));
            tasks.push(tokio::spawn(tcp::serve_tcp(
                Arc::clone(&self.handler),
                tcp_listener,
                None,
                shutdown.subscribe(),
            )));
        }
        if let Some((listener, acceptor)) = dot {
            tasks.push(tokio::spawn(tcp::serve_tcp(
                Arc::clone(&self.handler),
                listener,
                Some(acceptor),
                shutdown.subscribe(),
            )));
        }
        if let Some((listener, acceptor)) = doh {
            tasks.push(tokio::spawn(doh::serve_doh(
                Arc::clone(&self.handler),
                listener,
                acceptor,
                shutdown.subscribe(),
            )));
        }

        *state = Some(Running {
            shutdown,
            tasks,
            bound,
        });
        Ok(bound)
    }

    /// Stop the listeners, wait for the accept tasks to drain, and close
    /// the router. A second call that observes the stopped state is a
    /// no-op.
    pub async fn stop(&self) {
        let running = self.state.lock().await.take();
        let Some(running) = running else { return };

        let _ = running.shutdown.send(true);
        for task in running.tasks {
            let _ = task.await;
        }
        self.router.close().await;
        info!("forwarder stopped");
    }

    /// Addresses bound by the running forwarder, if running.
    pub async fn bound_addrs(&self) -> Option<BoundAddrs> {
        self.state.lock().await.as_ref().map(|r| r.bound)
    }

    /// Process one client query through the pipeline; see
    /// [`DnsHandler::handle_query`].
    pub async fn handle_query(&self, query: &[u8], from_udp: bool) -> Option<Vec<u8>> {
        self.handler.handle_query(query, from_udp).await
    }
}
