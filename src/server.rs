use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ResponseCache;
use crate::engine::{servfail_for, Engine};
use crate::matcher::RuntimeConfig;
use crate::reload::ConfigChangeListener;

const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const RECV_BUFFER_BYTES: usize = 4096;

/// Listen socket with enlarged buffers so bursts do not drop packets.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create listen socket")?;
    if let Err(err) = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!(error = %err, "failed to set listen recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
        warn!(error = %err, "failed to set listen send buffer size");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    UdpSocket::from_std(socket.into()).context("register listen socket")
}

/// Serve loop: receive, spawn a handler per packet, exit when the shutdown
/// channel fires or its sender is dropped.
pub async fn run_listener(
    socket: Arc<UdpSocket>,
    engine: Engine,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(RECV_BUFFER_BYTES);
    loop {
        buf.reserve(RECV_BUFFER_BYTES);
        buf.resize(RECV_BUFFER_BYTES, 0);
        tokio::select! {
            _ = shutdown.changed() => {
                info!("listener shutting down");
                break;
            }
            result = socket.recv_from(&mut buf[..]) => {
                match result {
                    Ok((len, peer)) => {
                        buf.truncate(len);
                        let packet = buf.split().freeze();
                        let engine = engine.clone();
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            handle_request(socket, engine, packet, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "recv_from failed");
                        buf.clear();
                    }
                }
            }
        }
    }
}

/// The handler body runs in a child task so that a panic in it is confined
/// to this request; the client still gets a SERVFAIL.
async fn handle_request(socket: Arc<UdpSocket>, engine: Engine, packet: Bytes, peer: SocketAddr) {
    let handler = {
        let packet = packet.clone();
        tokio::spawn(async move { engine.handle_packet(&packet, peer).await })
    };

    let reply: Option<Bytes> = match handler.await {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(err)) => {
            debug!(client_ip = %peer.ip(), error = %err, "request dropped");
            None
        }
        Err(join_err) => {
            error!(client_ip = %peer.ip(), error = %join_err, "request handler panicked");
            servfail_for(&packet).ok()
        }
    };

    if let Some(bytes) = reply {
        if let Err(err) = socket.send_to(&bytes, peer).await {
            debug!(client_ip = %peer.ip(), error = %err, "failed to send reply");
        }
    }
}

/// The serve loop currently bound, plus the handle main awaits on shutdown.
pub struct ListenerState {
    pub addr: SocketAddr,
    pub shutdown: watch::Sender<bool>,
    pub handle: Option<JoinHandle<()>>,
}

/// Applies reloaded configuration to the running server: retunes the cache
/// and, when the listen endpoint changed, binds the new socket before
/// stopping the old serve loop (so a failed bind keeps the old listener).
pub struct ServerReloadListener {
    engine: Engine,
    cache: Arc<ResponseCache>,
    runtime: tokio::runtime::Handle,
    state: Arc<Mutex<ListenerState>>,
}

impl ServerReloadListener {
    /// Must be created on the runtime that owns the serve loop.
    pub fn new(engine: Engine, cache: Arc<ResponseCache>, state: Arc<Mutex<ListenerState>>) -> Self {
        Self {
            engine,
            cache,
            runtime: tokio::runtime::Handle::current(),
            state,
        }
    }
}

impl ConfigChangeListener for ServerReloadListener {
    fn on_config_change(&self, old: &Arc<RuntimeConfig>, new: &Arc<RuntimeConfig>) {
        self.cache.configure(new.cache_size, new.cache_ttl);

        if old.listen != new.listen {
            let engine = self.engine.clone();
            let state = Arc::clone(&self.state);
            let new_addr = new.listen;
            self.runtime.spawn(async move {
                let socket = match bind_udp(new_addr) {
                    Ok(socket) => Arc::new(socket),
                    Err(err) => {
                        error!(
                            addr = %new_addr,
                            error = %err,
                            "rebind failed, keeping previous listener"
                        );
                        return;
                    }
                };
                let (tx, rx) = watch::channel(false);
                let handle = tokio::spawn(run_listener(socket, engine, rx));
                let (old_addr, old_tx) = {
                    let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                    let old_addr = guard.addr;
                    guard.addr = new_addr;
                    guard.handle = Some(handle);
                    (old_addr, std::mem::replace(&mut guard.shutdown, tx))
                };
                // The old serve loop sees the signal and returns.
                let _ = old_tx.send(true);
                info!(old_addr = %old_addr, addr = %new_addr, "listener rebound");
            });
        }

        info!(
            upstream = %new.upstream,
            cdn_prefixes = new.cdn_ips.len(),
            domain_rules = new.domains.len(),
            cache_size = new.cache_size,
            "configuration applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{CidrSet, DomainSet};
    use arc_swap::ArcSwap;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    async fn spawn_static_upstream(ip: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = socket.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(req) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let mut resp = Message::new();
                resp.set_id(req.id());
                resp.set_message_type(hickory_proto::op::MessageType::Response);
                resp.add_queries(req.queries().to_vec());
                if let Some(q) = req.queries().first() {
                    resp.add_answer(Record::from_rdata(
                        q.name().clone(),
                        60,
                        RData::A(A(ip)),
                    ));
                }
                let Ok(bytes) = resp.to_vec() else { continue };
                let _ = socket.send_to(&bytes, peer).await;
            }
        });
        addr
    }

    fn runtime_for(upstream: SocketAddr) -> RuntimeConfig {
        let mut cdn_ips = CidrSet::new();
        cdn_ips.add("192.168.1.0/24").expect("cidr");
        RuntimeConfig {
            upstream: upstream.to_string(),
            fallback: None,
            timeout: Duration::from_secs(1),
            no_record_no_fallback: false,
            listen: "127.0.0.1:0".parse().unwrap(),
            workers: 2,
            cache_size: 16,
            cache_ttl: Duration::from_secs(60),
            cdn_ips,
            domains: DomainSet::new(),
        }
    }

    fn query_packet(name: &str, id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg.to_vec().unwrap()
    }

    #[tokio::test]
    async fn serve_loop_answers_and_shuts_down() {
        let upstream = spawn_static_upstream(Ipv4Addr::new(5, 6, 7, 8)).await;
        let cfg = runtime_for(upstream);
        let cache = Arc::new(ResponseCache::new(16, Duration::from_secs(60)));
        let engine = Engine::new(Arc::new(ArcSwap::from_pointee(cfg)), cache).expect("engine");

        let listen = bind_udp("127.0.0.1:0".parse().unwrap()).expect("bind listen");
        let listen_addr = listen.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let serve = tokio::spawn(run_listener(Arc::new(listen), engine, rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        client
            .send_to(&query_packet("anything.example.", 0x4242), listen_addr)
            .await
            .expect("send");

        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        let reply = Message::from_vec(&buf[..len]).expect("parse reply");
        assert_eq!(reply.id(), 0x4242);
        assert_eq!(reply.answers().len(), 1);

        tx.send(true).expect("signal shutdown");
        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("loop exits")
            .expect("join");
    }

    #[tokio::test]
    async fn reload_listener_rebinds_on_listen_change() {
        let upstream = spawn_static_upstream(Ipv4Addr::new(7, 7, 7, 7)).await;
        let base = runtime_for(upstream);
        let cache = Arc::new(ResponseCache::new(16, Duration::from_secs(60)));
        let engine = Engine::new(
            Arc::new(ArcSwap::from_pointee(base.clone())),
            Arc::clone(&cache),
        )
        .expect("engine");

        let first = bind_udp("127.0.0.1:0".parse().unwrap()).expect("first bind");
        let first_addr = first.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_listener(Arc::new(first), engine.clone(), rx));
        let state = Arc::new(Mutex::new(ListenerState {
            addr: first_addr,
            shutdown: tx,
            handle: Some(handle),
        }));

        let listener = ServerReloadListener::new(engine, cache, Arc::clone(&state));

        // Find a free port for the new endpoint.
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe");
        let new_addr = probe.local_addr().expect("addr");
        drop(probe);

        let mut old_rt = base.clone();
        old_rt.listen = first_addr;
        let mut new_rt = base;
        new_rt.listen = new_addr;
        listener.on_config_change(&Arc::new(old_rt), &Arc::new(new_rt));

        // The rebind happens in a background task; poll the new endpoint.
        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client");
        let packet = query_packet("rebind.example.", 0x3131);
        let mut buf = [0u8; 4096];
        let mut reply_len = None;
        for _ in 0..50 {
            let _ = client.send_to(&packet, new_addr).await;
            if let Ok(Ok((len, _))) =
                tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await
            {
                reply_len = Some(len);
                break;
            }
        }
        let len = reply_len.expect("new listener answers");
        let reply = Message::from_vec(&buf[..len]).expect("parse reply");
        assert_eq!(reply.id(), 0x3131);
        assert_eq!(
            state.lock().unwrap_or_else(PoisonError::into_inner).addr,
            new_addr
        );
    }

    #[tokio::test]
    async fn bind_udp_reports_unbindable_address() {
        // Second bind of the same port must surface the error.
        let taken = bind_udp("127.0.0.1:0".parse().unwrap()).expect("first bind");
        let addr = taken.local_addr().expect("addr");
        assert!(bind_udp(addr).is_err());
    }
}
