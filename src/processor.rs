//! Per-session frame processing.
//!
//! Every session owns one worker thread that pulls the newest frame from
//! the session's slot, runs it through a [`FrameProcessor`], and routes the
//! results: back to the client as still frames when the JPEG stream is on,
//! or into the session's video transmitter otherwise. Control commands are
//! drained ahead of frames so a reconfiguration never waits behind video.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, warn};
use serde_json::Value;

use crate::error::Result;
use crate::message::{Message, MessageKind, SessionId};
use crate::session::SessionStats;
use crate::slot::FreshestSlot;
use crate::video::{StreamFormat, VideoTransmitter};

/// One output of a processing step.
pub struct ProcessedFrame {
    pub id: u32,
    pub data: Vec<u8>,
    /// Application tag delivered to the client alongside the frame.
    pub metadata: i32,
}

/// A frame processing algorithm plugged into a session.
///
/// `process` may emit zero or more outputs per input frame. The remaining
/// methods are configuration hooks with no-op defaults; implementations
/// override the ones they care about.
pub trait FrameProcessor: Send {
    fn process(&mut self, frame: &Message, emit: &mut dyn FnMut(ProcessedFrame));

    /// Apply a client configuration value, camera intrinsics included.
    fn configure(&mut self, _config: &Value) {}

    fn set_calibrate_mode(&mut self, _enabled: bool) {}

    fn set_debug_mode(&mut self, _enabled: bool) {}

    fn set_user_interaction(&mut self, _config: &Value) {}

    fn trigger_a(&mut self) {}

    fn trigger_b(&mut self) {}

    fn trigger_c(&mut self) {}
}

/// Loopback processor: every frame comes back unchanged.
///
/// Stands in for a real algorithm during client bring-up, when the
/// interesting question is whether frames survive the round trip at all.
pub struct EchoProcessor;

impl FrameProcessor for EchoProcessor {
    fn process(&mut self, frame: &Message, emit: &mut dyn FnMut(ProcessedFrame)) {
        emit(ProcessedFrame {
            id: frame.id,
            data: frame.payload.clone(),
            metadata: 0,
        });
    }
}

/// Outbound delivery point for processed still frames.
///
/// Implementations must be lossy: when the client cannot keep up, newer
/// frames replace queued ones instead of piling up.
pub trait FrameSink: Send + Sync {
    fn send_if_latest(&self, session: SessionId, msg: &Message);
}

/// Commands the pipeline sends into a session worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Raw configuration value for the processor.
    Configure(Value),
    UserInteraction(Value),
    Calibrate(bool),
    DebugMode(bool),
    /// Toggle still-frame delivery back to the client.
    JpegStream(bool),
    SetBitrate(u32),
    SetFrameSize(u32, u32),
    /// Aim the video transmitter at the client's receiver.
    StartVideoOut {
        format: StreamFormat,
        host: IpAddr,
        port: u16,
    },
    TriggerA,
    TriggerB,
    TriggerC,
    Shutdown,
}

struct Worker {
    session: SessionId,
    processor: Box<dyn FrameProcessor>,
    transmitter: Box<dyn VideoTransmitter>,
    sinks: Vec<Arc<dyn FrameSink>>,
    stats: Arc<SessionStats>,
    slot: Arc<FreshestSlot<Message>>,
    jpeg_stream: bool,
    emit_metadata: bool,
}

impl Worker {
    fn run(&mut self, ticks: Receiver<()>, control: Receiver<WorkerCommand>) {
        debug!("session {}: processor worker up", self.session);
        'outer: loop {
            // Drain control ahead of any frame work.
            loop {
                match control.try_recv() {
                    Ok(cmd) => {
                        if self.handle_command(cmd) {
                            break 'outer;
                        }
                    }
                    Err(_) => break,
                }
            }
            crossbeam_channel::select! {
                recv(control) -> cmd => match cmd {
                    Ok(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticks) -> tick => match tick {
                    Ok(()) => self.process_latest(),
                    Err(_) => break,
                },
            }
        }
        self.transmitter.stop();
        debug!("session {}: processor worker down", self.session);
    }

    /// Returns true when the worker should exit.
    fn handle_command(&mut self, cmd: WorkerCommand) -> bool {
        match cmd {
            WorkerCommand::Configure(value) => self.processor.configure(&value),
            WorkerCommand::UserInteraction(value) => self.processor.set_user_interaction(&value),
            WorkerCommand::Calibrate(enabled) => self.processor.set_calibrate_mode(enabled),
            WorkerCommand::DebugMode(enabled) => self.processor.set_debug_mode(enabled),
            WorkerCommand::JpegStream(enabled) => self.jpeg_stream = enabled,
            WorkerCommand::SetBitrate(bps) => self.transmitter.set_bitrate(bps),
            WorkerCommand::SetFrameSize(width, height) => {
                self.transmitter.set_frame_size(width, height)
            }
            WorkerCommand::StartVideoOut { format, host, port } => {
                if let Err(err) = self.transmitter.start(format, host, port) {
                    warn!(
                        "session {}: video transmitter failed to start: {}",
                        self.session, err
                    );
                }
            }
            WorkerCommand::TriggerA => self.processor.trigger_a(),
            WorkerCommand::TriggerB => self.processor.trigger_b(),
            WorkerCommand::TriggerC => self.processor.trigger_c(),
            WorkerCommand::Shutdown => return true,
        }
        false
    }

    fn process_latest(&mut self) {
        let frame = match self.slot.take() {
            Some(frame) => frame,
            None => return,
        };
        let session = self.session;
        let jpeg_stream = self.jpeg_stream;
        let emit_metadata = self.emit_metadata;
        let sinks = &self.sinks;
        let transmitter = &mut *self.transmitter;
        self.processor.process(&frame, &mut |out: ProcessedFrame| {
            if jpeg_stream {
                let msg = if emit_metadata {
                    Message::with_metadata(out.id, out.data, out.metadata)
                } else {
                    Message::new(MessageKind::Image, out.id, out.data)
                };
                for sink in sinks {
                    sink.send_if_latest(session, &msg);
                }
            } else {
                transmitter.push_frame(&out.data);
            }
        });
        self.stats.record_processed();
    }
}

/// Handle to a session's processing thread.
pub struct ProcessorWorker {
    ticks: Sender<()>,
    control: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl ProcessorWorker {
    /// Spawn the worker thread for `session`.
    ///
    /// `jpeg_stream` seeds the still-frame toggle; TCP sessions start with
    /// it on.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        session: SessionId,
        processor: Box<dyn FrameProcessor>,
        transmitter: Box<dyn VideoTransmitter>,
        sinks: Vec<Arc<dyn FrameSink>>,
        stats: Arc<SessionStats>,
        slot: Arc<FreshestSlot<Message>>,
        jpeg_stream: bool,
        emit_metadata: bool,
    ) -> Result<Self> {
        let (tick_tx, tick_rx) = bounded(1);
        let (control_tx, control_rx) = unbounded();
        let mut worker = Worker {
            session,
            processor,
            transmitter,
            sinks,
            stats,
            slot,
            jpeg_stream,
            emit_metadata,
        };
        let thread = thread::Builder::new()
            .name(format!("proc-{session}"))
            .spawn(move || worker.run(tick_rx, control_rx))?;
        Ok(Self {
            ticks: tick_tx,
            control: control_tx,
            thread: Some(thread),
        })
    }

    /// Wakeup sender for the session's frame slot.
    pub fn ticks(&self) -> Sender<()> {
        self.ticks.clone()
    }

    /// Queue a command; lost commands mean the worker is already gone.
    pub fn send(&self, cmd: WorkerCommand) {
        let _ = self.control.send(cmd);
    }

    /// Stop the worker and wait for it to finish.
    pub fn shutdown(&mut self) {
        let _ = self.control.send(WorkerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
