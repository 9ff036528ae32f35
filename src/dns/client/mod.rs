//! Upstream resolvers
//!
//! A resolver accepts a packed DNS query and returns the upstream's raw
//! response. Four shapes share the [`Resolver`] trait:
//!
//! - [`UdpResolver`]: one connected UDP socket multiplexing all clients,
//!   with query-ID remapping
//! - [`TcpResolver`]: pooled keep-alive TCP connections, length-prefixed
//!   framing
//! - [`DotResolver`]: the TCP shape over pooled TLS connections (RFC 7858)
//! - [`UdpTcpResolver`] (protocol `default`): UDP for queries that
//!   arrived over UDP, TCP otherwise
//!
//! Resolvers are constructed from their JSON-shaped [`ResolverExport`]
//! via [`resolver_from_export`], which is also what the router and the
//! management API exchange.

mod dot;
mod pool;
mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{DnsError, DnsResult};

pub use dot::DotResolver;
pub use pool::{KeepaliveConfig, TcpConnectionManager, TlsConnectionManager};
pub use tcp::TcpResolver;
pub use udp::UdpResolver;

/// Default TCP pool size: total connections.
pub const DEFAULT_POOL_MAX_CONNS: usize = 20;
/// Default TCP pool size: idle connections.
pub const DEFAULT_POOL_IDLE_CONNS: usize = 10;
/// Default TCP dial timeout (seconds).
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;
/// Default TLS handshake timeout (seconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;
/// Default read deadline on an upstream connection.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Default write deadline on an upstream connection.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default keep-alive idle time (seconds).
pub const DEFAULT_KEEPALIVE_IDLE_SECS: u64 = 15;
/// Default keep-alive probe interval (seconds).
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 15;
/// Default keep-alive probe count.
pub const DEFAULT_KEEPALIVE_COUNT: u32 = 3;

/// Maximum upstream response size read over UDP (EDNS0-sized).
pub const MAX_RESPONSE_SIZE: usize = 4096;

/// Resolver protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverProtocol {
    /// UDP+TCP composite, dispatched by the inbound transport.
    #[default]
    #[serde(alias = "")]
    Default,
    /// Plain UDP.
    Udp,
    /// Plain TCP.
    Tcp,
    /// DNS-over-TLS.
    Dot,
}

impl ResolverProtocol {
    /// String form as used in logs and exports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Dot => "dot",
        }
    }
}

/// Export/import form of a resolver, exchanged as JSON with the
/// management API and the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverExport {
    /// Name to identify the resolver in log messages.
    #[serde(default)]
    pub name: String,
    /// Resolver protocol.
    #[serde(default)]
    pub protocol: ResolverProtocol,
    /// Resolver address: `ip:port` (IPv6 in brackets).
    #[serde(default)]
    pub address: String,
    /// Server name (SNI) to verify the TLS certificate; DoT only.
    #[serde(default)]
    pub server_name: String,

    /// TCP pool size: max total connections.
    #[serde(default)]
    pub pool_max_conns: usize,
    /// TCP pool size: max idle connections.
    #[serde(default)]
    pub pool_idle_conns: usize,

    /// TCP dial timeout (seconds).
    #[serde(default)]
    pub dial_timeout: u64,
    /// TLS handshake timeout (seconds).
    #[serde(default)]
    pub handshake_timeout: u64,

    /// Whether to enable kernel TCP keep-alive on pooled connections.
    #[serde(default)]
    pub keepalive_enable: bool,
    /// Keep-alive idle time (seconds).
    #[serde(default)]
    pub keepalive_idle: u64,
    /// Keep-alive probe interval (seconds).
    #[serde(default)]
    pub keepalive_interval: u64,
    /// Keep-alive probe count.
    #[serde(default)]
    pub keepalive_count: u32,
}

impl ResolverExport {
    /// Validate and normalize the fields in place.
    ///
    /// Fills the documented defaults for zero-valued sizes and timeouts,
    /// derives `name` from `server_name` or `address`, and requires the
    /// address to parse as `ip:port`. DoT additionally requires a server
    /// name.
    ///
    /// # Errors
    ///
    /// Fails on an unparsable address or a missing DoT server name.
    pub fn validate(&mut self) -> DnsResult<()> {
        let addr = self.socket_addr()?;

        if self.name.is_empty() {
            self.name = if self.server_name.is_empty() {
                addr.to_string()
            } else {
                self.server_name.clone()
            };
        }

        if self.protocol == ResolverProtocol::Dot && self.server_name.is_empty() {
            return Err(DnsError::config_field(
                "server_name is required for DoT",
                "resolver.server_name",
            ));
        }

        if self.pool_max_conns == 0 {
            self.pool_max_conns = DEFAULT_POOL_MAX_CONNS;
        }
        if self.pool_idle_conns == 0 {
            self.pool_idle_conns = DEFAULT_POOL_IDLE_CONNS;
        }
        self.pool_idle_conns = self.pool_idle_conns.min(self.pool_max_conns);

        if self.dial_timeout == 0 {
            self.dial_timeout = DEFAULT_DIAL_TIMEOUT_SECS;
        }
        if self.handshake_timeout == 0 {
            self.handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT_SECS;
        }

        if self.keepalive_enable {
            if self.keepalive_idle == 0 {
                self.keepalive_idle = DEFAULT_KEEPALIVE_IDLE_SECS;
            }
            if self.keepalive_interval == 0 {
                self.keepalive_interval = DEFAULT_KEEPALIVE_INTERVAL_SECS;
            }
            if self.keepalive_count == 0 {
                self.keepalive_count = DEFAULT_KEEPALIVE_COUNT;
            }
        }

        Ok(())
    }

    /// Parse the address field.
    ///
    /// # Errors
    ///
    /// Fails when the address is not `ip:port`.
    pub fn socket_addr(&self) -> DnsResult<SocketAddr> {
        self.address.parse().map_err(|e| {
            DnsError::config_field(
                format!("invalid resolver address '{}': {e}", self.address),
                "resolver.address",
            )
        })
    }

    /// Keep-alive settings, when enabled.
    #[must_use]
    pub fn keepalive(&self) -> Option<KeepaliveConfig> {
        self.keepalive_enable.then(|| KeepaliveConfig {
            idle: Duration::from_secs(self.keepalive_idle),
            interval: Duration::from_secs(self.keepalive_interval),
            count: self.keepalive_count,
        })
    }
}

/// One upstream resolver behind a narrow query interface.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Send a packed query and await the raw response.
    ///
    /// `from_udp` reports which transport the query arrived on; the
    /// composite resolver uses it to pick a backend.
    ///
    /// # Errors
    ///
    /// Returns a [`DnsError`] on any transport or upstream failure; the
    /// caller maps every failure onto a ServFail reply.
    async fn query(&self, msg: &[u8], from_udp: bool) -> DnsResult<Vec<u8>>;

    /// Export/import form of this resolver.
    fn export(&self) -> ResolverExport;

    /// Shut down, draining in-flight work.
    async fn close(&self);
}

/// UDP+TCP composite resolver (protocol `default`).
///
/// Queries that arrived over UDP go to the UDP backend; everything else
/// (TCP/DoT/DoH inbound) goes straight to TCP, avoiding the truncation
/// dance for replies that exceed the UDP payload size.
pub struct UdpTcpResolver {
    tcp: TcpResolver,
    udp: UdpResolver,
}

impl UdpTcpResolver {
    /// Create the composite resolver from an export.
    ///
    /// # Errors
    ///
    /// Fails when the export does not validate.
    pub fn new(export: &ResolverExport) -> DnsResult<Self> {
        Ok(Self {
            tcp: TcpResolver::new(export)?,
            udp: UdpResolver::new(export)?,
        })
    }
}

#[async_trait]
impl Resolver for UdpTcpResolver {
    async fn query(&self, msg: &[u8], from_udp: bool) -> DnsResult<Vec<u8>> {
        if from_udp {
            self.udp.query(msg, true).await
        } else {
            self.tcp.query(msg, false).await
        }
    }

    fn export(&self) -> ResolverExport {
        let mut export = self.tcp.export();
        export.protocol = ResolverProtocol::Default;
        export
    }

    async fn close(&self) {
        self.tcp.close().await;
        self.udp.close().await;
    }
}

/// Build a resolver from its export form.
///
/// `roots` is the trust-anchor store used by TLS-based protocols.
///
/// # Errors
///
/// Fails when the export does not validate.
pub fn resolver_from_export(
    export: &ResolverExport,
    roots: &Arc<rustls::RootCertStore>,
) -> DnsResult<Arc<dyn Resolver>> {
    let mut export = export.clone();
    export.validate()?;

    Ok(match export.protocol {
        ResolverProtocol::Default => Arc::new(UdpTcpResolver::new(&export)?),
        ResolverProtocol::Udp => Arc::new(UdpResolver::new(&export)?),
        ResolverProtocol::Tcp => Arc::new(TcpResolver::new(&export)?),
        ResolverProtocol::Dot => Arc::new(DotResolver::new(&export, roots)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(protocol: ResolverProtocol, address: &str) -> ResolverExport {
        ResolverExport {
            protocol,
            address: address.to_string(),
            ..ResolverExport::default()
        }
    }

    // ========================================================================
    // Export Validation
    // ========================================================================

    #[test]
    fn test_validate_fills_defaults() {
        let mut e = export(ResolverProtocol::Tcp, "8.8.8.8:53");
        e.validate().unwrap();

        assert_eq!(e.name, "8.8.8.8:53");
        assert_eq!(e.pool_max_conns, DEFAULT_POOL_MAX_CONNS);
        assert_eq!(e.pool_idle_conns, DEFAULT_POOL_IDLE_CONNS);
        assert_eq!(e.dial_timeout, DEFAULT_DIAL_TIMEOUT_SECS);
        assert_eq!(e.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT_SECS);
        // Keep-alive stays off unless enabled.
        assert!(e.keepalive().is_none());
    }

    #[test]
    fn test_validate_name_prefers_server_name() {
        let mut e = export(ResolverProtocol::Dot, "1.1.1.1:853");
        e.server_name = "cloudflare-dns.com".to_string();
        e.validate().unwrap();
        assert_eq!(e.name, "cloudflare-dns.com");
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        assert!(export(ResolverProtocol::Udp, "not-an-address").validate().is_err());
        assert!(export(ResolverProtocol::Udp, "8.8.8.8").validate().is_err());
        assert!(export(ResolverProtocol::Udp, "dns.google:53").validate().is_err());
    }

    #[test]
    fn test_validate_accepts_ipv6() {
        let mut e = export(ResolverProtocol::Udp, "[2001:4860:4860::8888]:53");
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_validate_dot_requires_server_name() {
        let mut e = export(ResolverProtocol::Dot, "1.1.1.1:853");
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_validate_keepalive_defaults() {
        let mut e = export(ResolverProtocol::Tcp, "8.8.8.8:53");
        e.keepalive_enable = true;
        e.validate().unwrap();

        let ka = e.keepalive().unwrap();
        assert_eq!(ka.idle, Duration::from_secs(DEFAULT_KEEPALIVE_IDLE_SECS));
        assert_eq!(
            ka.interval,
            Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS)
        );
        assert_eq!(ka.count, DEFAULT_KEEPALIVE_COUNT);
    }

    #[test]
    fn test_validate_clamps_idle_to_max() {
        let mut e = export(ResolverProtocol::Tcp, "8.8.8.8:53");
        e.pool_max_conns = 4;
        e.pool_idle_conns = 100;
        e.validate().unwrap();
        assert_eq!(e.pool_idle_conns, 4);
    }

    // ========================================================================
    // Serde Shape
    // ========================================================================

    #[test]
    fn test_export_json_round_trip() {
        let mut e = export(ResolverProtocol::Dot, "1.1.1.1:853");
        e.server_name = "cloudflare-dns.com".to_string();
        e.validate().unwrap();

        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"protocol\":\"dot\""));
        assert!(json.contains("\"server_name\":\"cloudflare-dns.com\""));

        let back: ResolverExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_export_json_defaults_missing_fields() {
        let e: ResolverExport =
            serde_json::from_str(r#"{"address": "9.9.9.9:53"}"#).unwrap();
        assert_eq!(e.protocol, ResolverProtocol::Default);
        assert_eq!(e.address, "9.9.9.9:53");
        assert!(e.name.is_empty());
    }

    // ========================================================================
    // Factory
    // ========================================================================

    #[tokio::test]
    async fn test_factory_builds_each_protocol() {
        let roots = Arc::new(rustls::RootCertStore::empty());

        for (protocol, expect) in [
            (ResolverProtocol::Default, "default"),
            (ResolverProtocol::Udp, "udp"),
            (ResolverProtocol::Tcp, "tcp"),
        ] {
            let e = export(protocol, "127.0.0.1:5353");
            let resolver = resolver_from_export(&e, &roots).unwrap();
            assert_eq!(resolver.export().protocol.as_str(), expect);
            resolver.close().await;
        }

        let mut e = export(ResolverProtocol::Dot, "127.0.0.1:8853");
        e.server_name = "dns.example".to_string();
        let resolver = resolver_from_export(&e, &roots).unwrap();
        assert_eq!(resolver.export().protocol, ResolverProtocol::Dot);
        resolver.close().await;
    }
}
