//! UDP frame transport.
//!
//! Datagrams arrive from any address; each source address gets its own
//! reassembler. A flow stays anonymous until the client sends a Connection
//! message carrying its TCP session id, which binds the address to that
//! session. Frames from unbound flows are dropped downstream, control from
//! them reaches the pipeline with session 0.
//!
//! The outbound side reuses the negotiated per-session packet size and is
//! freshest-wins end to end: frames go through [`UdpSender`]'s slot-and-job
//! scheme, never a queue of payloads.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::message::{Message, MessageKind, SessionId};
use crate::net::{ServerEvent, UdpAssembler, UdpSender};
use crate::processor::FrameSink;
use crate::session::SessionRegistry;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Reassembly state for an address this quiet is gone.
const PEER_IDLE_LIMIT: Duration = Duration::from_secs(60);
/// Bounds for the client-negotiated fragment payload size.
const MIN_PACKET_SIZE: i64 = 100;
const MAX_PACKET_SIZE: i64 = 2000;

struct UdpPeer {
    /// Bound source address, None when only the packet size is known yet.
    addr: Option<SocketAddr>,
    packet_size: usize,
}

struct Inner {
    port: u16,
    registry: Arc<SessionRegistry>,
    events: Sender<ServerEvent>,
    running: Arc<AtomicBool>,
    peers: Mutex<HashMap<SessionId, UdpPeer>>,
    /// Sessions with UDP frame delivery enabled. Off until requested.
    send_images: Mutex<HashSet<SessionId>>,
    default_packet_size: usize,
}

/// UDP receive loop plus the shared fragmenting sender.
pub struct UdpServer {
    inner: Arc<Inner>,
    sender: UdpSender,
    recv: Mutex<Option<JoinHandle<()>>>,
}

impl UdpServer {
    /// Bind `port` (0 picks an ephemeral one) and start receiving.
    pub fn start(
        port: u16,
        default_packet_size: usize,
        registry: Arc<SessionRegistry>,
        events: Sender<ServerEvent>,
        running: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let port = socket.local_addr()?.port();
        let inner = Arc::new(Inner {
            port,
            registry: registry.clone(),
            events,
            running: running.clone(),
            peers: Mutex::new(HashMap::new()),
            send_images: Mutex::new(HashSet::new()),
            default_packet_size,
        });
        let sender = UdpSender::start(registry, running)?;
        let recv_inner = inner.clone();
        let recv = thread::Builder::new()
            .name("udp-recv".into())
            .spawn(move || recv_loop(recv_inner, socket))?;
        Ok(Arc::new(Self {
            inner,
            sender,
            recv: Mutex::new(Some(recv)),
        }))
    }

    /// Port the receive socket actually bound. Advertised in the greeting.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Bound source address for a session, if a Connection arrived.
    pub fn peer_addr(&self, session: SessionId) -> Option<SocketAddr> {
        self.inner.peers.lock().get(&session).and_then(|p| p.addr)
    }

    /// Negotiated fragment payload size for a session.
    pub fn packet_size(&self, session: SessionId) -> Option<usize> {
        self.inner
            .peers
            .lock()
            .get(&session)
            .map(|p| p.packet_size)
    }

    /// Apply a client-requested packet size, clamped to protocol bounds.
    ///
    /// May arrive before the UDP flow binds; the size is kept either way.
    pub fn set_packet_size(&self, session: SessionId, requested: i64) {
        let clamped = requested.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE) as usize;
        if clamped as i64 != requested {
            debug!("session {session}: packet size {requested} clamped to {clamped}");
        }
        let mut peers = self.inner.peers.lock();
        peers
            .entry(session)
            .and_modify(|peer| peer.packet_size = clamped)
            .or_insert(UdpPeer {
                addr: None,
                packet_size: clamped,
            });
        info!("session {session}: UDP packet size set to {clamped}");
    }

    /// Toggle UDP frame delivery for a session.
    pub fn set_send_images(&self, session: SessionId, enabled: bool) {
        let mut set = self.inner.send_images.lock();
        if enabled {
            set.insert(session);
        } else {
            set.remove(&session);
        }
    }

    pub fn send_images(&self, session: SessionId) -> bool {
        self.inner.send_images.lock().contains(&session)
    }

    /// Send a message to a session's bound peer, freshest-wins.
    ///
    /// Image kinds respect the session's UDP toggle; unbound sessions drop.
    pub fn send_file_if_latest(&self, session: SessionId, msg: &Message) {
        if msg.kind.is_image() && !self.send_images(session) {
            return;
        }
        let (addr, packet_size) = {
            let peers = self.inner.peers.lock();
            match peers.get(&session) {
                Some(UdpPeer {
                    addr: Some(addr),
                    packet_size,
                }) => (*addr, *packet_size),
                _ => {
                    trace!("session {session}: no bound UDP peer, dropping {}", msg.id);
                    return;
                }
            }
        };
        self.sender.enqueue(session, addr, packet_size, msg);
    }

    /// Same path as [`UdpServer::send_file_if_latest`]; UDP delivery has no
    /// reliable lane.
    pub fn send_file(&self, session: SessionId, msg: &Message) {
        self.send_file_if_latest(session, msg);
    }

    /// Drop a session's peer binding and pending frames.
    pub fn forget_session(&self, session: SessionId) {
        self.inner.peers.lock().remove(&session);
        self.inner.send_images.lock().remove(&session);
        self.sender.forget_session(session);
    }

    /// Join the receive and send threads. The shared running flag must
    /// already be false.
    pub fn stop(&self) {
        if let Some(handle) = self.recv.lock().take() {
            let _ = handle.join();
        }
        self.sender.stop();
        debug!("UDP server stopped");
    }
}

impl FrameSink for UdpServer {
    fn send_if_latest(&self, session: SessionId, msg: &Message) {
        self.send_file_if_latest(session, msg);
    }
}

struct FlowState {
    assembler: UdpAssembler,
    last_seen: Instant,
}

fn recv_loop(inner: Arc<Inner>, socket: UdpSocket) {
    info!("UDP server listening on port {}", inner.port);
    let mut flows: HashMap<SocketAddr, FlowState> = HashMap::new();
    let mut last_prune = Instant::now();
    let mut buf = [0u8; 65535];
    while inner.running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                let flow = flows.entry(addr).or_insert_with(|| FlowState {
                    assembler: UdpAssembler::new(),
                    last_seen: Instant::now(),
                });
                flow.last_seen = Instant::now();
                match flow.assembler.feed(&buf[..n]) {
                    Ok(messages) => {
                        for msg in messages {
                            deliver(&inner, addr, &mut flow.assembler, msg);
                        }
                    }
                    Err(err) => warn!("bad datagram from {addr}: {err}"),
                }
            }
            Err(ref err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                warn!("UDP receive failed: {err}");
                thread::sleep(Duration::from_millis(100));
            }
        }
        if last_prune.elapsed() > PEER_IDLE_LIMIT {
            prune_idle(&mut flows);
            last_prune = Instant::now();
        }
    }
    debug!("UDP receive loop done");
}

fn prune_idle(flows: &mut HashMap<SocketAddr, FlowState>) {
    flows.retain(|addr, flow| {
        let keep = flow.last_seen.elapsed() < PEER_IDLE_LIMIT;
        if !keep {
            debug!(
                "dropping idle UDP flow from {addr} (session {})",
                flow.assembler.session()
            );
        }
        keep
    });
}

fn deliver(inner: &Inner, addr: SocketAddr, assembler: &mut UdpAssembler, msg: Message) {
    match msg.kind {
        MessageKind::Connection => bind_flow(inner, addr, assembler, &msg),
        kind if kind.is_image() => {
            // Session 0 (unbound) is dropped by the registry.
            inner.registry.offer_frame(assembler.session(), msg);
        }
        _ => {
            let _ = inner.events.send(ServerEvent::Control {
                session: assembler.session(),
                message: msg,
            });
        }
    }
}

/// Bind a datagram source address to the TCP session named in the payload.
fn bind_flow(inner: &Inner, addr: SocketAddr, assembler: &mut UdpAssembler, msg: &Message) {
    if msg.payload.len() < 4 {
        warn!("Connection message from {addr} carries {} bytes, need 4", msg.payload.len());
        return;
    }
    let session = i32::from_be_bytes([
        msg.payload[0],
        msg.payload[1],
        msg.payload[2],
        msg.payload[3],
    ]);
    if session <= 0 {
        warn!("Connection message from {addr} names invalid session {session}");
        return;
    }
    let session = session as SessionId;
    assembler.bind_session(session);
    let mut peers = inner.peers.lock();
    peers
        .entry(session)
        .and_modify(|peer| peer.addr = Some(addr))
        .or_insert(UdpPeer {
            addr: Some(addr),
            packet_size: inner.default_packet_size,
        });
    info!("session {session}: UDP flow bound to {addr}");
}
