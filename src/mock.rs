//! In-process mock client.
//!
//! Replays a directory of JPEG frames into the pipeline without touching a
//! socket, so the processing path can be exercised on a machine with no
//! phone attached. The mock opens a session like a real client would,
//! sends one configuration message, then feeds frames at a fixed rate.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind, SessionId};
use crate::net::ServerEvent;
use crate::session::SessionRegistry;

pub struct MockClientOptions {
    /// Directory scanned for `*.jpg` frames, sorted by name.
    pub dir: PathBuf,
    /// Pause between the configuration message and the first frame.
    pub delay: Duration,
    /// Pause between frames.
    pub interval: Duration,
    /// Start over at the first frame after the last one.
    pub repeat: bool,
}

impl MockClientOptions {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            delay: Duration::from_millis(100),
            interval: Duration::from_millis(100),
            repeat: true,
        }
    }
}

/// Handle to a running mock client.
pub struct MockClient {
    session: SessionId,
    thread: Option<JoinHandle<()>>,
}

impl MockClient {
    /// Scan the frame directory and start replaying.
    ///
    /// Fails up front when the directory has no frames, so a typo in the
    /// path is not a silently idle server.
    pub fn spawn(
        opts: MockClientOptions,
        registry: Arc<SessionRegistry>,
        events: Sender<ServerEvent>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let frames = collect_frames(&opts.dir)?;
        let mut rng = SmallRng::from_entropy();
        let session = loop {
            let id: SessionId = rng.gen_range(1..=i32::MAX as u32);
            if !registry.contains(id) {
                break id;
            }
        };
        info!(
            "mock client session {session}: replaying {} frames from {}",
            frames.len(),
            opts.dir.display()
        );
        let thread = thread::Builder::new()
            .name("mock-client".into())
            .spawn(move || run(session, frames, opts, registry, events, running))?;
        Ok(Self {
            session,
            thread: Some(thread),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Wait for the replay thread to finish.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn collect_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_jpg = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("jpg"))
            .unwrap_or(false);
        if path.is_file() && is_jpg {
            frames.push(path);
        }
    }
    frames.sort();
    if frames.is_empty() {
        return Err(Error::Other(format!("no .jpg frames in {}", dir.display())));
    }
    Ok(frames)
}

fn run(
    session: SessionId,
    frames: Vec<PathBuf>,
    opts: MockClientOptions,
    registry: Arc<SessionRegistry>,
    events: Sender<ServerEvent>,
    running: Arc<AtomicBool>,
) {
    let _ = events.send(ServerEvent::SessionOpened {
        session,
        peer: None,
    });
    // Same opening move as the phone app: push config before any frame.
    let config = serde_json::json!({
        "JpegStream": false,
        "TransportProtocol": "NULL",
        "Camera.width": 640,
        "Camera.height": 480,
    });
    match Message::json(1, &config) {
        Ok(message) => {
            let _ = events.send(ServerEvent::Control { session, message });
        }
        Err(err) => warn!("mock client could not build its config message: {err}"),
    }
    thread::sleep(opts.delay);

    let mut frame_id = 0u32;
    'replay: loop {
        for path in &frames {
            if !running.load(Ordering::Relaxed) {
                break 'replay;
            }
            match fs::read(path) {
                Ok(bytes) => {
                    frame_id += 1;
                    registry.offer_frame(session, Message::new(MessageKind::Image, frame_id, bytes));
                }
                Err(err) => warn!("mock client skipping {}: {}", path.display(), err),
            }
            thread::sleep(opts.interval);
        }
        if !opts.repeat || !running.load(Ordering::Relaxed) {
            break;
        }
    }
    let _ = events.send(ServerEvent::SessionClosed { session });
    info!("mock client session {session} finished after {frame_id} frames");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionHandle, SessionStats};
    use crate::slot::FreshestSlot;
    use crossbeam_channel::{bounded, unbounded};
    use std::time::Instant;

    fn frame_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }
        dir
    }

    #[test]
    fn collects_jpgs_sorted_and_case_insensitive() {
        let dir = frame_dir(&["b.jpg", "a.JPG", "notes.txt"]);
        let frames = collect_frames(dir.path()).unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.jpg"]);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = frame_dir(&["readme.md"]);
        assert!(collect_frames(dir.path()).is_err());
    }

    #[test]
    fn replay_opens_configures_and_feeds_frames() {
        let dir = frame_dir(&["1.jpg", "2.jpg"]);
        let registry = Arc::new(SessionRegistry::new());
        let (events_tx, events_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let mut opts = MockClientOptions::new(dir.path().to_path_buf());
        opts.delay = Duration::from_millis(10);
        opts.interval = Duration::from_millis(5);
        let client =
            MockClient::spawn(opts, registry.clone(), events_tx, running.clone()).unwrap();
        let session = client.session();

        match events_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ServerEvent::SessionOpened { session: s, peer } => {
                assert_eq!(s, session);
                assert!(peer.is_none());
            }
            other => panic!("expected SessionOpened, got {other:?}"),
        }
        match events_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            ServerEvent::Control { message, .. } => {
                let value: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
                assert_eq!(value["TransportProtocol"], "NULL");
                assert_eq!(value["Camera.width"], 640);
            }
            other => panic!("expected Control, got {other:?}"),
        }

        // Register the session so frames have somewhere to land.
        let slot = Arc::new(FreshestSlot::new());
        let (ticks_tx, _ticks_rx) = bounded(1);
        registry.insert(
            session,
            SessionHandle {
                frame_slot: slot.clone(),
                ticks: ticks_tx,
                stats: Arc::new(SessionStats::new()),
            },
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        let frame = loop {
            if let Some(frame) = slot.take() {
                break frame;
            }
            assert!(Instant::now() < deadline, "no frame from the mock client");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(frame.kind, MessageKind::Image);
        assert!(frame.id >= 1);

        running.store(false, Ordering::Relaxed);
        client.join();
        let closed = events_rx
            .iter()
            .find(|e| matches!(e, ServerEvent::SessionClosed { .. }));
        assert!(closed.is_some());
    }
}
