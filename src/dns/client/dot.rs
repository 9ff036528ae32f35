//! DNS-over-TLS upstream resolver (RFC 7858)
//!
//! The TCP resolver shape over a pool of TLS connections: the same
//! 2-byte length framing and the same one-retry-before-length contract,
//! with the TLS handshake paid once per pooled connection during pool
//! `create` (bounded by the handshake timeout). The upstream certificate
//! is verified against the configured trust anchors with `server_name`
//! as SNI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::Pool;
use tracing::{debug, info};

use super::pool::{discard, TlsConnectionManager, TlsPool};
use super::tcp::{exchange_framed, frame_query, map_pool_error, ExchangeFailure};
use super::{
    Resolver, ResolverExport, ResolverProtocol, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
use crate::dns::error::{DnsError, DnsResult};

/// DoT upstream resolver with pooled TLS connections.
pub struct DotResolver {
    export: ResolverExport,
    pool: TlsPool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl DotResolver {
    /// Create the resolver and its TLS connection pool.
    ///
    /// `roots` holds the trust anchors used to verify the upstream
    /// certificate against `server_name`.
    ///
    /// # Errors
    ///
    /// Fails when the export does not validate (a DoT export requires a
    /// server name) or the pool cannot be built.
    pub fn new(export: &ResolverExport, roots: &Arc<rustls::RootCertStore>) -> DnsResult<Self> {
        let mut export = export.clone();
        export.protocol = ResolverProtocol::Dot;
        export.validate()?;
        let address = export.socket_addr()?;

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(Arc::clone(roots))
            .with_no_client_auth();

        let manager = TlsConnectionManager::new(
            address,
            Duration::from_secs(export.dial_timeout),
            export.keepalive(),
            Arc::new(tls_config),
            &export.server_name,
            Duration::from_secs(export.handshake_timeout),
        )?;
        let pool = Pool::builder(manager)
            .max_size(export.pool_max_conns)
            .build()
            .map_err(|e| DnsError::config(format!("failed to create TLS connection pool: {e}")))?;

        Ok(Self {
            export,
            pool,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    fn name(&self) -> &str {
        &self.export.name
    }
}

#[async_trait]
impl Resolver for DotResolver {
    async fn query(&self, msg: &[u8], _from_udp: bool) -> DnsResult<Vec<u8>> {
        let frame = frame_query(msg)?;

        let mut last_error = None;
        for attempt in 0..2 {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| map_pool_error(e, self.name()))?;

            match exchange_framed(
                &mut *conn,
                &frame,
                self.name(),
                self.read_timeout,
                self.write_timeout,
            )
            .await
            {
                Ok(resp) => {
                    debug!(resolver = %self.name(), len = resp.len(), "received response");
                    return Ok(resp);
                }
                Err(ExchangeFailure::BeforeLength(e)) => {
                    debug!(resolver = %self.name(), attempt, error = %e, "exchange failed; retrying on a fresh connection");
                    discard(conn);
                    last_error = Some(e);
                }
                Err(failure @ ExchangeFailure::AfterLength(_)) => {
                    discard(conn);
                    return Err(failure.into_error());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DnsError::upstream(self.name(), "query failed")))
    }

    fn export(&self) -> ResolverExport {
        self.export.clone()
    }

    async fn close(&self) {
        self.pool.close();
        info!(resolver = %self.name(), "closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(address: &str, server_name: &str) -> ResolverExport {
        ResolverExport {
            address: address.to_string(),
            server_name: server_name.to_string(),
            protocol: ResolverProtocol::Dot,
            ..ResolverExport::default()
        }
    }

    fn empty_roots() -> Arc<rustls::RootCertStore> {
        Arc::new(rustls::RootCertStore::empty())
    }

    // ========================================================================
    // Construction
    // ========================================================================

    #[test]
    fn test_new_requires_server_name() {
        let result = DotResolver::new(&export("1.1.1.1:853", ""), &empty_roots());
        assert!(result.is_err());
    }

    #[test]
    fn test_new_with_server_name() {
        let resolver =
            DotResolver::new(&export("1.1.1.1:853", "cloudflare-dns.com"), &empty_roots())
                .unwrap();
        let e = resolver.export();
        assert_eq!(e.protocol, ResolverProtocol::Dot);
        assert_eq!(e.server_name, "cloudflare-dns.com");
        assert_eq!(e.name, "cloudflare-dns.com");
        assert_eq!(e.handshake_timeout, super::super::DEFAULT_HANDSHAKE_TIMEOUT_SECS);
    }

    #[test]
    fn test_new_rejects_invalid_sni() {
        let result = DotResolver::new(&export("1.1.1.1:853", "bad name!"), &empty_roots());
        assert!(result.is_err());
    }

    // ========================================================================
    // Handshake Failure Path
    // ========================================================================

    #[tokio::test]
    async fn test_query_fails_against_non_tls_peer() {
        // A plain TCP listener cannot complete a TLS handshake; the
        // checkout fails and surfaces as an error, not a hang.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                drop(conn);
            }
        });

        let mut e = export(&addr.to_string(), "dns.example");
        e.handshake_timeout = 1;
        let resolver = DotResolver::new(&e, &empty_roots()).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            resolver.query(&[0u8; 16], false),
        )
        .await
        .expect("bounded by handshake timeout")
        .unwrap_err();
        assert!(err.is_recoverable() || matches!(err, DnsError::UpstreamError { .. }));

        resolver.close().await;
    }
}
