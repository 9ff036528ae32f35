//! Upstream connection pooling
//!
//! Managed pools of keep-alive TCP connections to one upstream, with a
//! TLS variant for DoT. Pool mechanics come from deadpool: the pool
//! bounds checked-out plus idle connections at `max_size`, blocks a
//! saturated `get()` until a connection is returned, and health-checks
//! idle connections on checkout via the managers' `recycle` hooks.
//!
//! The health check is a 1 ms zero-byte-deadline read probe: a timeout
//! means the connection is idle and healthy, EOF means the peer closed
//! it, and stray bytes on an idle DNS connection violate the protocol.
//! The probe is best-effort; callers still retry once over a fresh
//! connection when an idle one turns out to be broken.
//!
//! Broken connections are discarded with [`discard`] instead of being
//! returned to the pool.

use std::net::SocketAddr;
use std::time::Duration;

use deadpool::managed::{self, Manager, Metrics, Object, RecycleError, RecycleResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::dns::error::DnsError;

/// Deadline for the idle-connection read probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

/// Kernel TCP keep-alive settings applied to pooled connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Number of unanswered probes before the peer counts as dead.
    pub count: u32,
}

/// Pool of plain TCP connections to one upstream address.
pub type TcpPool = managed::Pool<TcpConnectionManager>;

/// Pool of TLS connections to one upstream address.
pub type TlsPool = managed::Pool<TlsConnectionManager>;

/// Drop a checked-out connection without returning it to the pool.
pub fn discard<M: Manager>(conn: Object<M>) {
    let _ = Object::take(conn);
}

/// Dial the upstream with a deadline and configure the socket.
async fn dial(
    addr: SocketAddr,
    dial_timeout: Duration,
    keepalive: Option<&KeepaliveConfig>,
) -> Result<TcpStream, DnsError> {
    let stream = timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| DnsError::timeout(format!("TCP connection to {addr}"), dial_timeout))?
        .map_err(|e| DnsError::network_io(format!("failed to connect to {addr}"), e))?;

    stream.set_nodelay(true).ok();

    if let Some(ka) = keepalive {
        if let Err(e) = apply_keepalive(&stream, ka) {
            debug!(addr = %addr, error = %e, "failed to set TCP keepalive");
        }
    }

    Ok(stream)
}

fn apply_keepalive(stream: &TcpStream, ka: &KeepaliveConfig) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    let mut params = socket2::TcpKeepalive::new()
        .with_time(ka.idle)
        .with_interval(ka.interval);
    #[cfg(not(windows))]
    {
        params = params.with_retries(ka.count);
    }
    sock.set_tcp_keepalive(&params)
}

/// Zero-byte-deadline read probe over an idle connection.
async fn probe_idle<S>(conn: &mut S) -> RecycleResult<DnsError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    match timeout(PROBE_TIMEOUT, conn.read(&mut buf)).await {
        // Timeout: no pending data, connection is idle and alive.
        Err(_) => Ok(()),
        Ok(Ok(0)) => Err(RecycleError::Backend(DnsError::network(
            "connection closed by upstream",
        ))),
        Ok(Ok(_)) => Err(RecycleError::Backend(DnsError::network(
            "unexpected data on idle connection",
        ))),
        Ok(Err(e)) => Err(RecycleError::Backend(DnsError::network_io(
            "idle connection check failed",
            e,
        ))),
    }
}

/// Connection manager for plain TCP upstreams.
pub struct TcpConnectionManager {
    addr: SocketAddr,
    dial_timeout: Duration,
    keepalive: Option<KeepaliveConfig>,
}

impl TcpConnectionManager {
    /// Create a manager dialing `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr, dial_timeout: Duration, keepalive: Option<KeepaliveConfig>) -> Self {
        Self {
            addr,
            dial_timeout,
            keepalive,
        }
    }
}

impl Manager for TcpConnectionManager {
    type Type = TcpStream;
    type Error = DnsError;

    async fn create(&self) -> Result<TcpStream, DnsError> {
        let stream = dial(self.addr, self.dial_timeout, self.keepalive.as_ref()).await?;
        debug!(addr = %self.addr, "created new upstream TCP connection");
        Ok(stream)
    }

    async fn recycle(&self, conn: &mut TcpStream, _: &Metrics) -> RecycleResult<DnsError> {
        probe_idle(conn).await
    }
}

/// Connection manager for TLS (DoT) upstreams.
///
/// The TLS handshake happens during `create`, bounded by the handshake
/// timeout; pooled connections are always post-handshake, so a checkout
/// never pays the handshake again.
pub struct TlsConnectionManager {
    addr: SocketAddr,
    dial_timeout: Duration,
    keepalive: Option<KeepaliveConfig>,
    connector: TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
    handshake_timeout: Duration,
}

impl TlsConnectionManager {
    /// Create a manager performing TLS to `addr` with SNI `server_name`.
    ///
    /// # Errors
    ///
    /// Fails when `server_name` is not a valid SNI name.
    pub fn new(
        addr: SocketAddr,
        dial_timeout: Duration,
        keepalive: Option<KeepaliveConfig>,
        tls_config: std::sync::Arc<rustls::ClientConfig>,
        server_name: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, DnsError> {
        let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|_| {
                DnsError::config_field(
                    format!("invalid server name for SNI: {server_name}"),
                    "resolver.server_name",
                )
            })?;

        Ok(Self {
            addr,
            dial_timeout,
            keepalive,
            connector: TlsConnector::from(tls_config),
            server_name,
            handshake_timeout,
        })
    }
}

impl Manager for TlsConnectionManager {
    type Type = TlsStream<TcpStream>;
    type Error = DnsError;

    async fn create(&self) -> Result<TlsStream<TcpStream>, DnsError> {
        let stream = dial(self.addr, self.dial_timeout, self.keepalive.as_ref()).await?;

        let connect = self.connector.connect(self.server_name.clone(), stream);
        let tls_stream = timeout(self.handshake_timeout, connect)
            .await
            .map_err(|_| DnsError::timeout("TLS handshake", self.handshake_timeout))?
            .map_err(|e| DnsError::network(format!("TLS handshake failed: {e}")))?;

        let (_, session) = tls_stream.get_ref();
        debug!(
            addr = %self.addr,
            version = ?session.protocol_version(),
            cipher = ?session.negotiated_cipher_suite(),
            "TLS connected"
        );
        Ok(tls_stream)
    }

    async fn recycle(
        &self,
        conn: &mut TlsStream<TcpStream>,
        _: &Metrics,
    ) -> RecycleResult<DnsError> {
        probe_idle(conn).await
    }
}
