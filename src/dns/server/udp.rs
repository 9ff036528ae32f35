//! UDP accept loop
//!
//! Reads datagrams into a buffer sized one byte above the query limit so
//! oversized packets are detectable (and then dropped by the length
//! gate) instead of being silently truncated. Each datagram is handled
//! on its own task; the reply goes back out through the shared socket.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{DnsHandler, MAX_QUERY_SIZE};

pub(super) async fn serve_udp(
    handler: Arc<DnsHandler>,
    socket: UdpSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_QUERY_SIZE + 1];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "failed to read packet");
                        continue;
                    }
                };

                debug!(peer = %peer, len = n, "handle UDP query");
                let query = buf[..n].to_vec();
                let handler = Arc::clone(&handler);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(reply) = handler.handle_query(&query, true).await {
                        if let Err(e) = socket.send_to(&reply, peer).await {
                            // The client will time out on its own.
                            warn!(peer = %peer, error = %e, "failed to send reply");
                        }
                    }
                });
            }
        }
    }

    info!("stopped UDP forwarder");
}
