//! UDP upstream resolver
//!
//! One long-lived worker owns a single connected UDP socket to the
//! upstream; all client queries are multiplexed over it. Because the
//! socket is shared, the client's 16-bit message ID cannot be trusted to
//! be unique, so every outbound query gets a fresh ID drawn from a PRNG
//! and the original ID is restored on the response before delivery.
//!
//! In-flight queries live in a TTL cache keyed by the upstream ID. The
//! receive loop looks the sender up and try-sends the response (dropped
//! when no one is waiting); the query future removes its own entry on
//! completion or cancellation, and the cache sweeper collects entries
//! whose query timed out without ever being answered.
//!
//! Dial failures back off exponentially (100 ms doubling to a 1 s cap)
//! and requeue the query for one more attempt.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Resolver, ResolverExport, ResolverProtocol, MAX_RESPONSE_SIZE};
use crate::dns::error::{DnsError, DnsResult};
use crate::dns::message;
use crate::util::ttlcache::{Ttl, TtlCache};

/// Max number of in-flight UDP queries buffered towards the worker.
const QUERY_CHANNEL_SIZE: usize = 1024;

/// Lifetime of an in-flight entry that never sees a response.
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial back-off bounds.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

type InflightCache = TtlCache<mpsc::Sender<Vec<u8>>>;

fn inflight_key(id: u16) -> String {
    id.to_string()
}

/// Removes the in-flight entry when the query future finishes, whether
/// it resolved, errored, or was cancelled by the caller's deadline.
struct InflightGuard {
    inflight: Arc<InflightCache>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // pop() keeps the eviction callback out of the way; the channel
        // sender is simply dropped.
        let _ = self.inflight.pop(&self.key);
    }
}

/// UDP upstream resolver.
pub struct UdpResolver {
    name: String,
    address: SocketAddr,
    queries: mpsc::Sender<Vec<u8>>,
    inflight: Arc<InflightCache>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UdpResolver {
    /// Create the resolver and start its worker task.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the export does not validate.
    pub fn new(export: &ResolverExport) -> DnsResult<Self> {
        let mut export = export.clone();
        export.validate()?;
        let address = export.socket_addr()?;

        let name = export.name.clone();
        let (queries_tx, queries_rx) = mpsc::channel(QUERY_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let evict_name = name.clone();
        let inflight: Arc<InflightCache> = Arc::new(TtlCache::new(
            SESSION_TIMEOUT,
            None,
            Some(Box::new(move |key, _| {
                warn!(resolver = %evict_name, id = %key, "in-flight query expired without response");
            })),
        ));

        let worker = tokio::spawn(worker_loop(
            name.clone(),
            address,
            queries_rx,
            queries_tx.clone(),
            Arc::clone(&inflight),
            shutdown_rx,
        ));

        Ok(Self {
            name,
            address,
            queries: queries_tx,
            inflight,
            shutdown: shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn query(&self, msg: &[u8], _from_udp: bool) -> DnsResult<Vec<u8>> {
        let old_id = message::get_id(msg)?;
        let mut qmsg = msg.to_vec();

        // Draw an upstream ID no other in-flight query is using; a
        // colliding draw is regenerated rather than overwriting the
        // existing session.
        let (new_id, mut response_rx) = loop {
            let id: u16 = rand::thread_rng().gen();
            let (tx, rx) = mpsc::channel(1);
            if self.inflight.add(&inflight_key(id), tx, Ttl::Default).is_ok() {
                break (id, rx);
            }
        };
        let _guard = InflightGuard {
            inflight: Arc::clone(&self.inflight),
            key: inflight_key(new_id),
        };

        message::set_id(&mut qmsg, new_id)?;
        self.queries
            .send(qmsg)
            .await
            .map_err(|_| DnsError::upstream(&self.name, "resolver closed"))?;

        let mut resp = response_rx
            .recv()
            .await
            .ok_or_else(|| DnsError::upstream(&self.name, "session expired before response"))?;

        // Recover the client's query ID.
        message::set_id(&mut resp, old_id)?;
        Ok(resp)
    }

    fn export(&self) -> ResolverExport {
        ResolverExport {
            name: self.name.clone(),
            protocol: ResolverProtocol::Udp,
            address: self.address.to_string(),
            ..ResolverExport::default()
        }
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.inflight.close().await;
        info!(resolver = %self.name, "closed");
    }
}

impl Drop for UdpResolver {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn worker_loop(
    name: String,
    address: SocketAddr,
    mut queries: mpsc::Receiver<Vec<u8>>,
    requeue: mpsc::Sender<Vec<u8>>,
    inflight: Arc<InflightCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut socket: Option<Arc<UdpSocket>> = None;
    let mut recv_task: Option<JoinHandle<()>> = None;
    let mut backoff = BACKOFF_BASE;

    loop {
        let query = tokio::select! {
            _ = shutdown.changed() => break,
            query = queries.recv() => match query {
                Some(query) => query,
                None => break,
            },
        };

        if socket.is_none() {
            match connect(address).await {
                Ok(s) => {
                    debug!(resolver = %name, addr = %address, "UDP connected");
                    backoff = BACKOFF_BASE;
                    let s = Arc::new(s);
                    recv_task = Some(tokio::spawn(receive_loop(
                        name.clone(),
                        Arc::clone(&s),
                        Arc::clone(&inflight),
                    )));
                    socket = Some(s);
                }
                Err(e) => {
                    error!(resolver = %name, addr = %address, error = %e, "failed to dial UDP");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    requeue_query(&requeue, query);
                    continue;
                }
            }
        }

        let Some(sock) = socket.clone() else { continue };
        if let Err(e) = sock.send(&query).await {
            error!(resolver = %name, error = %e, "failed to send query");
            if let Some(task) = recv_task.take() {
                task.abort();
            }
            socket = None;
            requeue_query(&requeue, query);
        }
    }

    if let Some(task) = recv_task.take() {
        task.abort();
    }
    info!(resolver = %name, "stopped worker");
}

async fn connect(address: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr: SocketAddr = if address.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid bind address")
    } else {
        "[::]:0".parse().expect("valid bind address")
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(address).await?;
    Ok(socket)
}

/// Requeue a query after a transient send/dial failure. Spawned so a
/// full channel does not wedge the worker.
fn requeue_query(requeue: &mpsc::Sender<Vec<u8>>, query: Vec<u8>) {
    let requeue = requeue.clone();
    tokio::spawn(async move {
        let _ = requeue.send(query).await;
    });
}

async fn receive_loop(name: String, socket: Arc<UdpSocket>, inflight: Arc<InflightCache>) {
    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                let resp = buf[..n].to_vec();
                let Ok(id) = message::get_id(&resp) else {
                    debug!(resolver = %name, len = n, "runt response dropped");
                    continue;
                };
                if let Some(tx) = inflight.get(&inflight_key(id)) {
                    // Exactly one delivery; dropped when no one waits.
                    let _ = tx.try_send(resp);
                }
            }
            Err(e) => {
                debug!(resolver = %name, error = %e, "stop receiving");
                return;
            }
        }
    }
}
