use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, warn};

const POOL_SIZE: usize = 8;
const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;

struct InflightQuery {
    original_id: u16,
    upstream: SocketAddr,
    tx: oneshot::Sender<Bytes>,
}

struct PooledSocket {
    socket: Arc<UdpSocket>,
    inflight: Arc<DashMap<u16, InflightQuery, FxBuildHasher>>,
    next_id: AtomicU16,
}

/// UDP 上游客户端池：共享 socket 上用改写的事务 ID 区分并发查询
/// 每个 socket 配一个后台读取任务，按 ID 匹配在途查询并还原原始 ID
pub struct UpstreamClient {
    pool: Vec<PooledSocket>,
    next_idx: AtomicUsize,
}

impl UpstreamClient {
    /// Must be called from within a tokio runtime; each pooled socket gets
    /// its own reader task.
    pub fn new() -> Result<Self> {
        let mut pool = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            let socket = Arc::new(bind_client_socket(Domain::IPV4)?);
            let inflight: Arc<DashMap<u16, InflightQuery, FxBuildHasher>> =
                Arc::new(DashMap::with_hasher(FxBuildHasher::default()));

            spawn_reader(Arc::clone(&socket), Arc::clone(&inflight));

            pool.push(PooledSocket {
                socket,
                inflight,
                next_id: AtomicU16::new(0),
            });
        }
        Ok(Self {
            pool,
            next_idx: AtomicUsize::new(0),
        })
    }

    /// Send `packet` to `upstream` and wait for the matching response. The
    /// returned bytes carry the packet's original transaction id.
    pub async fn exchange(
        &self,
        packet: &[u8],
        upstream: &str,
        timeout_dur: Duration,
    ) -> Result<Bytes> {
        if packet.len() < 12 {
            bail!("dns packet too short");
        }
        let addr: SocketAddr = upstream
            .parse()
            .with_context(|| format!("invalid upstream address: {upstream:?}"))?;

        // The pool sockets are IPv4-bound; v6 upstreams get a one-shot socket.
        if addr.is_ipv6() {
            return exchange_direct(packet, addr, timeout_dur).await;
        }

        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let state = &self.pool[idx];
        let original_id = u16::from_be_bytes([packet[0], packet[1]]);

        // Allocate an upstream-side id not currently in flight on this socket.
        let mut attempts = 0;
        let new_id = loop {
            let candidate = state.next_id.fetch_add(1, Ordering::Relaxed);
            if !state.inflight.contains_key(&candidate) {
                break candidate;
            }
            attempts += 1;
            if attempts > 100 {
                warn!(
                    socket_idx = idx,
                    inflight = state.inflight.len(),
                    "upstream socket exhausted"
                );
                bail!("too many in-flight upstream queries");
            }
        };

        let (tx, rx) = oneshot::channel();
        state.inflight.insert(
            new_id,
            InflightQuery {
                original_id,
                upstream: addr,
                tx,
            },
        );

        let mut wire = packet.to_vec();
        wire[0..2].copy_from_slice(&new_id.to_be_bytes());

        if let Err(err) = state.socket.send_to(&wire, addr).await {
            state.inflight.remove(&new_id);
            return Err(err).context("send to upstream");
        }

        match timeout(timeout_dur, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => {
                state.inflight.remove(&new_id);
                bail!("upstream reader dropped the query")
            }
            Err(_) => {
                state.inflight.remove(&new_id);
                bail!("upstream timeout after {timeout_dur:?}")
            }
        }
    }
}

fn spawn_reader(
    socket: Arc<UdpSocket>,
    inflight: Arc<DashMap<u16, InflightQuery, FxBuildHasher>>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    if len < 12 {
                        continue;
                    }
                    let id = u16::from_be_bytes([buf[0], buf[1]]);
                    // Only accept the response if it comes from the upstream
                    // this id was sent to; anything else is spoofable noise.
                    if let Some((_, pending)) =
                        inflight.remove_if(&id, |_, pending| pending.upstream == src)
                    {
                        let mut data = buf[..len].to_vec();
                        data[0..2].copy_from_slice(&pending.original_id.to_be_bytes());
                        let _ = pending.tx.send(Bytes::from(data));
                    } else {
                        debug!(id, src = %src, "upstream response with no matching query");
                    }
                }
                Err(err) => {
                    error!(error = %err, "upstream pool recv error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });
}

/// One-shot connected socket exchange; the connect filters the peer so any
/// response with the right id is ours.
async fn exchange_direct(packet: &[u8], addr: SocketAddr, timeout_dur: Duration) -> Result<Bytes> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = bind_client_socket(domain)?;
    socket.connect(addr).await.context("connect upstream")?;
    socket.send(packet).await.context("send to upstream")?;

    let mut buf = [0u8; 4096];
    let recv = timeout(timeout_dur, async {
        loop {
            let len = socket.recv(&mut buf).await?;
            if len >= 2 && buf[0..2] == packet[0..2] {
                return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..len]));
            }
        }
    })
    .await;

    match recv {
        Ok(result) => result,
        Err(_) => bail!("upstream timeout after {timeout_dur:?}"),
    }
}

fn bind_client_socket(domain: Domain) -> Result<UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("create upstream socket")?;
    if let Err(err) = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!(error = %err, "failed to set upstream recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!(error = %err, "failed to set upstream send buffer size");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    let bind_addr: SocketAddr = if domain == Domain::IPV6 {
        "[::]:0".parse().expect("static addr")
    } else {
        "0.0.0.0:0".parse().expect("static addr")
    };
    socket
        .bind(&bind_addr.into())
        .context("bind upstream socket")?;
    UdpSocket::from_std(socket.into()).context("register upstream socket")
}
