//! Server orchestration and the control pipeline.
//!
//! [`DrishtiServer`] owns both transports, the session registry and one
//! pipeline thread. The pipeline is the only place sessions are created,
//! reconfigured and torn down; the transport threads just queue
//! [`ServerEvent`]s at it. Frames never pass through here, they go straight
//! from the reader threads to the per-session workers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::{AppConfig, PipelineConfig, ProcessorKind};
use crate::error::Result;
use crate::message::{Message, MessageKind, SessionId};
use crate::mock::{MockClient, MockClientOptions};
use crate::net::{ServerEvent, TcpServer, UdpServer};
use crate::processor::{EchoProcessor, FrameProcessor, FrameSink, ProcessorWorker, WorkerCommand};
use crate::session::{SessionHandle, SessionRegistry, SessionStats};
use crate::slot::FreshestSlot;
use crate::video::{NullReceiver, NullTransmitter, StreamFormat, VideoReceiver};
use crate::writer::FrameWriter;

/// The edge server: transports, sessions and processing under one roof.
pub struct DrishtiServer {
    running: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
    tcp: Arc<TcpServer>,
    udp: Arc<UdpServer>,
    events_tx: Sender<ServerEvent>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    mocks: Mutex<Vec<MockClient>>,
    writer: Mutex<Option<FrameWriter>>,
}

impl DrishtiServer {
    /// Bind both transports and start the pipeline.
    pub fn start(config: AppConfig) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(SessionRegistry::new());
        let (events_tx, events_rx) = unbounded();

        let writer = match &config.pipeline.write_dir {
            Some(dir) => {
                let writer = FrameWriter::start(dir.clone())?;
                if let Some(tap) = writer.sender() {
                    registry.set_frame_tap(tap);
                }
                Some(writer)
            }
            None => None,
        };

        let tcp = TcpServer::start(
            config.network.tcp_port,
            registry.clone(),
            events_tx.clone(),
            running.clone(),
        )?;
        let udp = UdpServer::start(
            config.network.udp_port,
            config.network.packet_size,
            registry.clone(),
            events_tx.clone(),
            running.clone(),
        )?;

        let pipeline = Pipeline {
            registry: registry.clone(),
            tcp: tcp.clone(),
            udp: udp.clone(),
            running: running.clone(),
            config: config.pipeline.clone(),
            sessions: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || pipeline.run(events_rx))?;

        info!(
            "drishti-edge up: TCP port {}, UDP port {}",
            tcp.port(),
            udp.port()
        );
        Ok(Self {
            running,
            registry,
            tcp,
            udp,
            events_tx,
            pipeline: Mutex::new(Some(handle)),
            mocks: Mutex::new(Vec::new()),
            writer: Mutex::new(writer),
        })
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp.port()
    }

    pub fn udp_port(&self) -> u16 {
        self.udp.port()
    }

    /// Shared run flag, also usable as an external shutdown switch.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Start an in-process client replaying frames from a directory.
    pub fn add_mock_client(&self, opts: MockClientOptions) -> Result<SessionId> {
        let client = MockClient::spawn(
            opts,
            self.registry.clone(),
            self.events_tx.clone(),
            self.running.clone(),
        )?;
        let session = client.session();
        self.mocks.lock().push(client);
        Ok(session)
    }

    /// Stop everything and wait for every thread. Safe to call twice.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        info!("shutting down");
        self.tcp.stop();
        self.udp.stop();
        if let Some(handle) = self.pipeline.lock().take() {
            let _ = handle.join();
        }
        for client in self.mocks.lock().drain(..) {
            client.join();
        }
        // Tap goes first or the writer never sees its feed close.
        self.registry.clear_frame_tap();
        if let Some(writer) = self.writer.lock().take() {
            writer.stop();
        }
        info!("drishti-edge stopped");
    }
}

/// Per-session pipeline state, owned by the pipeline thread alone.
struct Session {
    worker: ProcessorWorker,
    receiver: Box<dyn VideoReceiver>,
    stats: Arc<SessionStats>,
    /// Control connection's remote address; None for in-process clients.
    peer: Option<SocketAddr>,
}

struct Pipeline {
    registry: Arc<SessionRegistry>,
    tcp: Arc<TcpServer>,
    udp: Arc<UdpServer>,
    running: Arc<AtomicBool>,
    config: PipelineConfig,
    sessions: HashMap<SessionId, Session>,
}

impl Pipeline {
    fn run(mut self, events: Receiver<ServerEvent>) {
        debug!("pipeline up");
        while self.running.load(Ordering::Relaxed) {
            match events.recv_timeout(Duration::from_millis(500)) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let open: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in open {
            self.teardown(session);
        }
        debug!("pipeline down");
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionOpened { session, peer } => self.build_session(session, peer),
            ServerEvent::Control { session, message } => self.handle_control(session, message),
            ServerEvent::SessionClosed { session } => self.teardown(session),
        }
    }

    fn build_session(&mut self, session: SessionId, peer: Option<SocketAddr>) {
        if self.sessions.contains_key(&session) {
            warn!("session {session} opened twice, keeping the first");
            return;
        }
        let stats = Arc::new(SessionStats::new());
        let slot = Arc::new(FreshestSlot::new());
        let processor: Box<dyn FrameProcessor> = match self.config.processor {
            ProcessorKind::Echo => Box::new(EchoProcessor),
        };
        let sinks: Vec<Arc<dyn FrameSink>> = vec![self.tcp.clone(), self.udp.clone()];
        let worker = match ProcessorWorker::spawn(
            session,
            processor,
            Box::new(NullTransmitter::new()),
            sinks,
            stats.clone(),
            slot.clone(),
            // Still frames over TCP until the client reconfigures.
            true,
            self.config.emit_metadata,
        ) {
            Ok(worker) => worker,
            Err(err) => {
                error!("session {session}: could not spawn a worker: {err}");
                return;
            }
        };
        self.registry.insert(
            session,
            SessionHandle {
                frame_slot: slot,
                ticks: worker.ticks(),
                stats: stats.clone(),
            },
        );
        self.tcp.set_send_images(session, true);
        self.udp.set_send_images(session, false);
        self.sessions.insert(
            session,
            Session {
                worker,
                receiver: Box::new(NullReceiver::new()),
                stats,
                peer,
            },
        );

        // The greeting tells the client where to aim UDP and which id to
        // put in its Connection message.
        let greeting = serde_json::json!({
            "UdpPort": self.udp.port(),
            "SessionId": session,
        });
        match Message::json(1, &greeting) {
            Ok(msg) => self.tcp.send_file(session, &msg),
            Err(err) => warn!("session {session}: could not build the greeting: {err}"),
        }
        info!("session {session} ready");
    }

    fn teardown(&mut self, session: SessionId) {
        let mut state = match self.sessions.remove(&session) {
            Some(state) => state,
            None => return,
        };
        self.registry.remove(session);
        self.tcp.forget_session(session);
        self.udp.forget_session(session);
        state.worker.shutdown();
        state.receiver.stop();
        state.stats.log_summary(session);
    }

    fn send_command(&self, session: SessionId, cmd: WorkerCommand) {
        if let Some(state) = self.sessions.get(&session) {
            state.worker.send(cmd);
        }
    }

    fn handle_control(&mut self, session: SessionId, message: Message) {
        if !self.sessions.contains_key(&session) {
            debug!(
                "no session {session} for a {:?} control message",
                message.kind
            );
            return;
        }
        match message.kind {
            MessageKind::Json => self.handle_json(session, &message),
            MessageKind::Calibration => {
                if message.payload.len() != 1 {
                    warn!(
                        "session {session}: calibration payload of {} bytes, treating as off",
                        message.payload.len()
                    );
                }
                self.send_command(
                    session,
                    WorkerCommand::Calibrate(calibration_enabled(&message.payload)),
                );
            }
            MessageKind::TriggerA => self.send_command(session, WorkerCommand::TriggerA),
            MessageKind::TriggerB => self.send_command(session, WorkerCommand::TriggerB),
            MessageKind::TriggerC => self.send_command(session, WorkerCommand::TriggerC),
            MessageKind::Connection => {
                debug!("session {session}: Connection on the control path, ignoring")
            }
            MessageKind::None => {
                debug!("session {session}: control message with unknown kind, ignoring")
            }
            MessageKind::Image | MessageKind::ImageWithMetadata => {
                debug!("session {session}: image on the control path, ignoring")
            }
        }
    }

    /// Apply a JSON control object. Keys are independent; one bad key never
    /// blocks the others.
    fn handle_json(&mut self, session: SessionId, message: &Message) {
        let value: Value = match serde_json::from_slice(&message.payload) {
            Ok(value) => value,
            Err(err) => {
                warn!("session {session}: unparseable JSON control: {err}");
                return;
            }
        };
        let obj = match value.as_object() {
            Some(obj) => obj.clone(),
            None => {
                warn!("session {session}: JSON control is not an object");
                return;
            }
        };
        debug!("session {session}: control {value}");

        if let Some(protocol) = obj.get("TransportProtocol").and_then(Value::as_str) {
            let (tcp_on, udp_on) = match protocol {
                "TCP" => (true, false),
                "UDP" => (false, true),
                _ => (false, false),
            };
            self.tcp.set_send_images(session, tcp_on);
            self.udp.set_send_images(session, udp_on);
            info!("session {session}: transport {protocol} (TCP {tcp_on}, UDP {udp_on})");
        }
        if let Some(enabled) = obj.get("JpegStream").and_then(Value::as_bool) {
            self.send_command(session, WorkerCommand::JpegStream(enabled));
        }
        if let Some(bps) = obj.get("VideoBitrate").and_then(Value::as_i64) {
            self.send_command(session, WorkerCommand::SetBitrate(bps.max(0) as u32));
        }
        if let Some(size) = obj.get("PacketSize").and_then(Value::as_i64) {
            self.udp.set_packet_size(session, size);
        }
        if obj.keys().any(|key| key.starts_with("Camera.")) {
            self.send_command(session, WorkerCommand::Configure(value.clone()));
            let width = obj.get("Camera.width").and_then(Value::as_u64);
            let height = obj.get("Camera.height").and_then(Value::as_u64);
            if let (Some(width), Some(height)) = (width, height) {
                self.send_command(
                    session,
                    WorkerCommand::SetFrameSize(width as u32, height as u32),
                );
            }
        }
        if let Some(enabled) = obj.get("DebugMode").and_then(Value::as_bool) {
            self.send_command(session, WorkerCommand::DebugMode(enabled));
        }
        if let Some(ui) = obj.get("UserInteractionConfiguration") {
            self.send_command(session, WorkerCommand::UserInteraction(ui.clone()));
        }
        self.handle_video_out(session, &obj);
        self.handle_video_in(session, &obj);

        for key in obj.keys() {
            if !known_control_key(key) {
                debug!("session {session}: ignoring unknown control key {key:?}");
            }
        }
    }

    /// Client told us where it listens: aim the transmitter there.
    fn handle_video_out(&mut self, session: SessionId, obj: &serde_json::Map<String, Value>) {
        let port = obj.get("VideoReceiverPort").and_then(Value::as_u64);
        let format = obj.get("VideoReceiverFormat").and_then(Value::as_str);
        let (port, format_str) = match (port, format) {
            (Some(port), Some(format)) => (port, format),
            _ => return,
        };
        let format = match StreamFormat::from_wire(format_str) {
            Some(format) => format,
            None => {
                warn!("session {session}: unknown video format {format_str:?}, not transmitting");
                return;
            }
        };
        let peer = self.sessions.get(&session).and_then(|s| s.peer);
        let host = match peer {
            Some(addr) => addr.ip(),
            None => {
                debug!("session {session}: no peer address, cannot aim the transmitter");
                return;
            }
        };
        self.send_command(
            session,
            WorkerCommand::StartVideoOut {
                format,
                host,
                port: port as u16,
            },
        );
    }

    /// Client wants to stream to us: open a receiver and report the port.
    fn handle_video_in(&mut self, session: SessionId, obj: &serde_json::Map<String, Value>) {
        let format_str = match obj.get("VideoTransmitterFormat").and_then(Value::as_str) {
            Some(format) => format,
            None => return,
        };
        let format = match StreamFormat::from_wire(format_str) {
            Some(format) => format,
            None => {
                warn!("session {session}: unknown video format {format_str:?}, not receiving");
                return;
            }
        };
        let jitter = obj
            .get("VideoTransmitterUseJitterBuffer")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let state = match self.sessions.get_mut(&session) {
            Some(state) => state,
            None => return,
        };
        match state.receiver.start(format, jitter) {
            Ok(port) => {
                let reply = serde_json::json!({
                    "VideoReceiverFormat": format.as_wire(),
                    "VideoReceiverPort": port,
                });
                match Message::json(1, &reply) {
                    Ok(msg) => self.tcp.send_file(session, &msg),
                    Err(err) => {
                        warn!("session {session}: could not build the receiver reply: {err}")
                    }
                }
            }
            Err(err) => warn!("session {session}: video receiver failed to start: {err}"),
        }
    }
}

/// A calibration toggle is one byte; any other payload reads as off.
fn calibration_enabled(payload: &[u8]) -> bool {
    payload.len() == 1 && payload[0] != 0
}

fn known_control_key(key: &str) -> bool {
    matches!(
        key,
        "TransportProtocol"
            | "JpegStream"
            | "VideoBitrate"
            | "PacketSize"
            | "DebugMode"
            | "UserInteractionConfiguration"
            | "VideoReceiverPort"
            | "VideoReceiverFormat"
            | "VideoTransmitterFormat"
            | "VideoTransmitterUseJitterBuffer"
    ) || key.starts_with("Camera.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.tcp_port = 0;
        config.network.udp_port = 0;
        config
    }

    #[test]
    fn starts_on_ephemeral_ports_and_stops_cleanly() {
        let server = DrishtiServer::start(test_config()).unwrap();
        assert_ne!(server.tcp_port(), 0);
        assert_ne!(server.udp_port(), 0);
        server.stop();
        server.stop();
    }

    #[test]
    fn mock_client_gets_a_live_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.jpg"), [1, 2, 3]).unwrap();

        let server = DrishtiServer::start(test_config()).unwrap();
        let mut opts = MockClientOptions::new(dir.path().to_path_buf());
        opts.delay = Duration::from_millis(10);
        opts.interval = Duration::from_millis(10);
        let session = server.add_mock_client(opts).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !server.registry.contains(session) {
            assert!(Instant::now() < deadline, "session never built");
            thread::sleep(Duration::from_millis(5));
        }
        // Frames flow once the session exists.
        let stats = server.registry.stats(session).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.frames_in() == 0 {
            assert!(Instant::now() < deadline, "no frames reached the session");
            thread::sleep(Duration::from_millis(5));
        }
        server.stop();
    }

    #[test]
    fn unknown_control_keys_are_recognized() {
        assert!(known_control_key("TransportProtocol"));
        assert!(known_control_key("Camera.fx"));
        assert!(!known_control_key("Bogus"));
    }

    #[test]
    fn calibration_payload_is_a_single_byte_switch() {
        assert!(calibration_enabled(&[1]));
        assert!(calibration_enabled(&[0xFF]));
        assert!(!calibration_enabled(&[0]));
        assert!(!calibration_enabled(&[]));
        assert!(!calibration_enabled(&[1, 1]));
    }
}
