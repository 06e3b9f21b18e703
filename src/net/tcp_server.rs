//! TCP control transport.
//!
//! One accept thread hands each client to a reader/writer thread pair. The
//! reader reassembles inbound frames and forwards them: images to the
//! session registry, everything else to the pipeline as control events.
//! The writer owns the socket's send side and serves two lanes: a FIFO
//! lane for control replies, which must all arrive, and a single-slot lane
//! for frames, where only the newest matters. A frame is released to the
//! socket only after the previous write finished, so a slow client sees
//! fewer frames rather than older ones.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;
use crate::message::{Message, SessionId};
use crate::net::{ServerEvent, TcpAssembler};
use crate::processor::FrameSink;
use crate::session::SessionRegistry;
use crate::slot::FreshestSlot;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
// A write stuck this long means the connection is gone, not slow.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_IDLE: Duration = Duration::from_millis(10);

struct ConnectionHandle {
    peer: SocketAddr,
    /// FIFO lane, every message is written in order.
    control: Sender<Message>,
    /// Wakeup for the frame lane, one pending nudge at most.
    nudges: Sender<()>,
    /// Freshest-wins lane for outbound frames.
    out_slot: Arc<FreshestSlot<Message>>,
    alive: Arc<AtomicBool>,
}

struct Inner {
    port: u16,
    registry: Arc<SessionRegistry>,
    events: Sender<ServerEvent>,
    running: Arc<AtomicBool>,
    connections: Mutex<HashMap<SessionId, ConnectionHandle>>,
    /// Sessions with still-frame delivery enabled. TCP sessions start in.
    send_images: Mutex<HashSet<SessionId>>,
}

/// TCP listener plus per-connection reader/writer threads.
pub struct TcpServer {
    inner: Arc<Inner>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Bind `port` (0 picks an ephemeral one) and start accepting.
    pub fn start(
        port: u16,
        registry: Arc<SessionRegistry>,
        events: Sender<ServerEvent>,
        running: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let inner = Arc::new(Inner {
            port,
            registry,
            events,
            running,
            connections: Mutex::new(HashMap::new()),
            send_images: Mutex::new(HashSet::new()),
        });
        let accept_inner = inner.clone();
        let accept = thread::Builder::new()
            .name("tcp-accept".into())
            .spawn(move || accept_loop(accept_inner, listener))?;
        Ok(Arc::new(Self {
            inner,
            accept: Mutex::new(Some(accept)),
        }))
    }

    /// Port the listener actually bound.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Queue a message on the reliable FIFO lane.
    ///
    /// Image kinds respect the session's still-frame toggle. Sessions
    /// without a socket (in-process clients) log and drop.
    pub fn send_file(&self, session: SessionId, msg: &Message) {
        if msg.kind.is_image() && !self.send_images(session) {
            trace!("session {session}: still frames off, dropping image {}", msg.id);
            return;
        }
        let connections = self.inner.connections.lock();
        match connections.get(&session) {
            Some(handle) => {
                let _ = handle.control.send(msg.clone());
            }
            None => debug!(
                "session {session}: no open socket for {:?} message {}",
                msg.kind, msg.id
            ),
        }
    }

    /// Offer a frame on the freshest-wins lane.
    pub fn send_file_if_latest(&self, session: SessionId, msg: &Message) {
        if msg.kind.is_image() && !self.send_images(session) {
            return;
        }
        let connections = self.inner.connections.lock();
        if let Some(handle) = connections.get(&session) {
            handle.out_slot.put(msg.clone());
            let _ = handle.nudges.try_send(());
        }
    }

    /// Toggle still-frame delivery for a session.
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

    /// Remote address of a session's control connection.
    pub fn peer_addr(&self, session: SessionId) -> Option<SocketAddr> {
        self.inner.connections.lock().get(&session).map(|h| h.peer)
    }

    /// Drop a session's connection without emitting a close event.
    ///
    /// For pipeline-initiated teardown, where the caller already knows.
    pub fn forget_session(&self, session: SessionId) {
        if let Some(handle) = self.inner.connections.lock().remove(&session) {
            handle.alive.store(false, Ordering::Relaxed);
        }
        // Socketless sessions still have a toggle entry to clear.
        self.inner.send_images.lock().remove(&session);
    }

    /// Join the accept thread and cut every connection loose.
    ///
    /// The shared running flag must already be false.
    pub fn stop(&self) {
        if let Some(handle) = self.accept.lock().take() {
            let _ = handle.join();
        }
        for (_, handle) in self.inner.connections.lock().drain() {
            handle.alive.store(false, Ordering::Relaxed);
        }
        self.inner.send_images.lock().clear();
        debug!("TCP server stopped");
    }
}

impl FrameSink for TcpServer {
    fn send_if_latest(&self, session: SessionId, msg: &Message) {
        self.send_file_if_latest(session, msg);
    }
}

fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut rng = SmallRng::from_entropy();
    info!("TCP server listening on port {}", inner.port);
    while inner.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = setup_connection(&inner, stream, peer, &mut rng) {
                    warn!("failed to set up connection from {peer}: {err}");
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(err) => {
                warn!("accept failed: {err}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    debug!("TCP accept loop done");
}

fn next_session_id(inner: &Inner, rng: &mut SmallRng) -> SessionId {
    loop {
        let id: SessionId = rng.gen_range(1..=i32::MAX as u32);
        if !inner.connections.lock().contains_key(&id) && !inner.registry.contains(id) {
            return id;
        }
    }
}

fn setup_connection(
    inner: &Arc<Inner>,
    stream: TcpStream,
    peer: SocketAddr,
    rng: &mut SmallRng,
) -> Result<()> {
    // Accepted sockets do not reliably inherit the listener's flags.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let write_half = stream.try_clone()?;

    let session = next_session_id(inner, rng);
    let alive = Arc::new(AtomicBool::new(true));
    let out_slot = Arc::new(FreshestSlot::new());
    let (control_tx, control_rx) = unbounded();
    let (nudge_tx, nudge_rx) = bounded(1);
    inner.connections.lock().insert(
        session,
        ConnectionHandle {
            peer,
            control: control_tx,
            nudges: nudge_tx,
            out_slot: out_slot.clone(),
            alive: alive.clone(),
        },
    );
    inner.send_images.lock().insert(session);
    info!("session {session}: client connected from {peer}");
    let _ = inner.events.send(ServerEvent::SessionOpened {
        session,
        peer: Some(peer),
    });

    let spawned = spawn_connection_threads(
        inner, stream, write_half, session, alive, control_rx, nudge_rx, out_slot,
    );
    if spawned.is_err() {
        connection_closed(inner, session);
    }
    spawned
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection_threads(
    inner: &Arc<Inner>,
    read_half: TcpStream,
    write_half: TcpStream,
    session: SessionId,
    alive: Arc<AtomicBool>,
    control_rx: Receiver<Message>,
    nudge_rx: Receiver<()>,
    out_slot: Arc<FreshestSlot<Message>>,
) -> Result<()> {
    let reader_inner = inner.clone();
    let reader_alive = alive.clone();
    thread::Builder::new()
        .name(format!("tcp-reader-{session}"))
        .spawn(move || reader_loop(reader_inner, read_half, session, reader_alive))?;
    let writer_inner = inner.clone();
    thread::Builder::new()
        .name(format!("tcp-writer-{session}"))
        .spawn(move || {
            writer_loop(
                writer_inner,
                write_half,
                session,
                alive,
                control_rx,
                nudge_rx,
                out_slot,
            )
        })?;
    Ok(())
}

fn reader_loop(inner: Arc<Inner>, mut stream: TcpStream, session: SessionId, alive: Arc<AtomicBool>) {
    let mut assembler = TcpAssembler::new();
    let mut buf = [0u8; 8192];
    while inner.running.load(Ordering::Relaxed) && alive.load(Ordering::Relaxed) {
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!("session {session}: client closed the connection");
                break;
            }
            Ok(n) => match assembler.feed(&buf[..n]) {
                Ok(messages) => {
                    for msg in messages {
                        dispatch(&inner, session, msg);
                    }
                }
                Err(err) => {
                    warn!("session {session}: unframeable stream, dropping connection: {err}");
                    break;
                }
            },
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                debug!("session {session}: read failed: {err}");
                break;
            }
        }
    }
    connection_closed(&inner, session);
}

fn dispatch(inner: &Inner, session: SessionId, msg: Message) {
    if msg.kind.is_image() {
        inner.registry.offer_frame(session, msg);
    } else {
        let _ = inner.events.send(ServerEvent::Control {
            session,
            message: msg,
        });
    }
}

fn writer_loop(
    inner: Arc<Inner>,
    mut stream: TcpStream,
    session: SessionId,
    alive: Arc<AtomicBool>,
    control: Receiver<Message>,
    nudges: Receiver<()>,
    out_slot: Arc<FreshestSlot<Message>>,
) {
    let mut buf = Vec::new();
    'outer: while inner.running.load(Ordering::Relaxed) && alive.load(Ordering::Relaxed) {
        // Control replies go out ahead of any pending frame.
        while let Ok(msg) = control.try_recv() {
            if !write_message(&inner, &mut stream, session, &msg, &mut buf) {
                break 'outer;
            }
        }
        select! {
            recv(control) -> msg => match msg {
                Ok(msg) => {
                    if !write_message(&inner, &mut stream, session, &msg, &mut buf) {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(nudges) -> nudge => match nudge {
                Ok(()) => {
                    if let Some(msg) = out_slot.take() {
                        if !write_message(&inner, &mut stream, session, &msg, &mut buf) {
                            break;
                        }
                    }
                }
                Err(_) => break,
            },
            default(READ_TIMEOUT) => {}
        }
    }
    alive.store(false, Ordering::Relaxed);
    let _ = stream.shutdown(Shutdown::Both);
    debug!("session {session}: writer done");
}

fn write_message(
    inner: &Inner,
    stream: &mut TcpStream,
    session: SessionId,
    msg: &Message,
    buf: &mut Vec<u8>,
) -> bool {
    crate::wire::encode_tcp_message(msg, buf);
    if let Err(err) = stream.write_all(buf) {
        debug!("session {session}: write failed: {err}");
        return false;
    }
    if msg.kind.is_image() {
        if let Some(stats) = inner.registry.stats(session) {
            stats.record_sent_tcp();
        }
    }
    true
}

/// Remove the session's connection state and tell the pipeline.
///
/// Reached from both reader and writer; whichever gets here first wins and
/// the other finds nothing to remove.
fn connection_closed(inner: &Inner, session: SessionId) {
    if let Some(handle) = inner.connections.lock().remove(&session) {
        handle.alive.store(false, Ordering::Relaxed);
        inner.send_images.lock().remove(&session);
        let _ = inner.events.send(ServerEvent::SessionClosed { session });
    }
}
