//! TCP upstream resolver
//!
//! Queries are sent length-prefixed (big-endian 16-bit, RFC 1035) over
//! pooled keep-alive connections. The retry contract is asymmetric: a
//! failure before the response length prefix has been read is retried
//! exactly once on a fresh pooled connection (the idle-health probe is
//! best-effort, so a just-checked-out connection can still be dead); a
//! failure after the length has been read is not retried, because the
//! payload may be partially consumed and cannot be reassembled.
//!
//! Broken connections never go back to the pool.

use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{Pool, PoolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

use super::pool::{discard, TcpConnectionManager, TcpPool};
use super::{
    Resolver, ResolverExport, ResolverProtocol, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
use crate::dns::error::{DnsError, DnsResult};

/// Outcome of one framed exchange attempt, split at the retry boundary.
pub(super) enum ExchangeFailure {
    /// Failed before the response length prefix was read; retryable.
    BeforeLength(DnsError),
    /// Failed while reading the response payload; not retryable.
    AfterLength(DnsError),
}

impl ExchangeFailure {
    pub(super) fn into_error(self) -> DnsError {
        match self {
            Self::BeforeLength(e) | Self::AfterLength(e) => e,
        }
    }
}

/// Write one length-prefixed query and read one length-prefixed response.
pub(super) async fn exchange_framed<S>(
    conn: &mut S,
    frame: &[u8],
    upstream: &str,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Vec<u8>, ExchangeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(write_timeout, conn.write_all(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(ExchangeFailure::BeforeLength(DnsError::network_io(
                format!("failed to send query to {upstream}"),
                e,
            )));
        }
        Err(_) => {
            return Err(ExchangeFailure::BeforeLength(DnsError::timeout(
                format!("query write to {upstream}"),
                write_timeout,
            )));
        }
    }

    let mut lbuf = [0u8; 2];
    match timeout(read_timeout, conn.read_exact(&mut lbuf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            return Err(ExchangeFailure::BeforeLength(DnsError::network_io(
                format!("failed to read response length from {upstream}"),
                e,
            )));
        }
        Err(_) => {
            return Err(ExchangeFailure::BeforeLength(DnsError::timeout(
                format!("response from {upstream}"),
                read_timeout,
            )));
        }
    }

    let rlength = usize::from(u16::from_be_bytes(lbuf));
    let mut resp = vec![0u8; rlength];
    match timeout(read_timeout, conn.read_exact(&mut resp)).await {
        Ok(Ok(_)) => Ok(resp),
        Ok(Err(e)) => Err(ExchangeFailure::AfterLength(DnsError::network_io(
            format!("failed to read response content from {upstream}"),
            e,
        ))),
        Err(_) => Err(ExchangeFailure::AfterLength(DnsError::timeout(
            format!("response content from {upstream}"),
            read_timeout,
        ))),
    }
}

/// Frame a query with its 2-byte length prefix.
pub(super) fn frame_query(msg: &[u8]) -> DnsResult<Vec<u8>> {
    let len = u16::try_from(msg.len())
        .map_err(|_| DnsError::build("query exceeds TCP message size"))?;
    let mut frame = Vec::with_capacity(2 + msg.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg);
    Ok(frame)
}

/// Map a pool checkout failure onto the DNS error taxonomy.
pub(super) fn map_pool_error(err: PoolError<DnsError>, upstream: &str) -> DnsError {
    match err {
        PoolError::Backend(e) => e,
        PoolError::Closed => DnsError::upstream(upstream, "connection pool closed"),
        other => DnsError::upstream(upstream, format!("connection pool failure: {other}")),
    }
}

/// TCP upstream resolver with pooled connections.
pub struct TcpResolver {
    export: ResolverExport,
    pool: TcpPool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TcpResolver {
    /// Create the resolver and its connection pool.
    ///
    /// # Errors
    ///
    /// Fails when the export does not validate or the pool cannot be
    /// built.
    pub fn new(export: &ResolverExport) -> DnsResult<Self> {
        let mut export = export.clone();
        export.validate()?;
        let address = export.socket_addr()?;

        let manager = TcpConnectionManager::new(
            address,
            Duration::from_secs(export.dial_timeout),
            export.keepalive(),
        );
        let pool = Pool::builder(manager)
            .max_size(export.pool_max_conns)
            .build()
            .map_err(|e| DnsError::config(format!("failed to create connection pool: {e}")))?;

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
impl Resolver for TcpResolver {
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
                    // Length already read; the stream position is lost.
                    discard(conn);
                    return Err(failure.into_error());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DnsError::upstream(self.name(), "query failed")))
    }

    fn export(&self) -> ResolverExport {
        let mut export = self.export.clone();
        export.protocol = ResolverProtocol::Tcp;
        export
    }

    async fn close(&self) {
        self.pool.close();
        info!(resolver = %self.name(), "closed");
    }
}
