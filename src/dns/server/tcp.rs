//! TCP and DoT accept loops
//!
//! Both protocols speak length-prefixed DNS over a byte stream; DoT just
//! terminates TLS first. Each accepted connection gets its own task that
//! serves requests sequentially: read the 2-byte length prefix and the
//! exact payload under a 5 s read deadline, run the query pipeline, and
//! write the length-prefixed reply under a 5 s write deadline. The
//! connection ends on EOF, any framing error, an elapsed deadline, or
//! forwarder shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::DnsHandler;

/// Per-request read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-reply write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) async fn serve_tcp(
    handler: Arc<DnsHandler>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let proto = if acceptor.is_some() { "DoT" } else { "TCP" };

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let handler = Arc::clone(&handler);
                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(conn).await {
                            Ok(tls_conn) => {
                                serve_connection(handler, tls_conn, peer, "DoT", shutdown).await;
                            }
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "TLS accept failed");
                            }
                        },
                        None => serve_connection(handler, conn, peer, "TCP", shutdown).await,
                    }
                });
            }
        }
    }

    info!(proto, "stopped stream forwarder");
}

async fn serve_connection<S>(
    handler: Arc<DnsHandler>,
    mut conn: S,
    peer: SocketAddr,
    proto: &'static str,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        debug!(peer = %peer, proto, "handle stream query");

        // Read query length.
        let mut lbuf = [0u8; 2];
        let read = tokio::select! {
            _ = shutdown.changed() => return,
            read = timeout(READ_TIMEOUT, conn.read_exact(&mut lbuf)) => read,
        };
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(peer = %peer, "remote closed connection");
                return;
            }
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "failed to read query length");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "connection idle past read deadline");
                return;
            }
        }

        // Read query content.
        let length = usize::from(u16::from_be_bytes(lbuf));
        let mut query = vec![0u8; length];
        match timeout(READ_TIMEOUT, conn.read_exact(&mut query)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "failed to read query content");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "query content past read deadline");
                return;
            }
        }

        // A dropped query produces no reply but keeps the connection.
        let Some(reply) = handler.handle_query(&query, false).await else {
            continue;
        };

        let Ok(reply_len) = u16::try_from(reply.len()) else {
            warn!(peer = %peer, len = reply.len(), "oversized reply dropped");
            continue;
        };
        let mut frame = Vec::with_capacity(2 + reply.len());
        frame.extend_from_slice(&reply_len.to_be_bytes());
        frame.extend_from_slice(&reply);

        match timeout(WRITE_TIMEOUT, conn.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "failed to send reply");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "reply write past deadline");
                return;
            }
        }
    }
}
