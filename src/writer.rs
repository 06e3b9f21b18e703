//! Frame archiving to disk.
//!
//! When enabled, every inbound frame is mirrored to a directory, one file
//! per frame. The writer sits behind a bounded channel fed by the session
//! registry's frame tap; when disk cannot keep up the tap drops frames
//! rather than slowing ingest.

use std::fs;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::message::{Message, SessionId};

const QUEUE_DEPTH: usize = 32;

/// Background writer mirroring frames into a directory.
pub struct FrameWriter {
    tx: Mutex<Option<Sender<(SessionId, Message)>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FrameWriter {
    /// Create `dir` if needed and start the writer thread.
    pub fn start(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let thread = thread::Builder::new()
            .name("frame-writer".into())
            .spawn(move || write_loop(dir, rx))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Sender suitable for [`crate::session::SessionRegistry::set_frame_tap`].
    pub fn sender(&self) -> Option<Sender<(SessionId, Message)>> {
        self.tx.lock().clone()
    }

    /// Drop the feed and wait for queued frames to hit disk.
    pub fn stop(&self) {
        self.tx.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn write_loop(dir: PathBuf, rx: Receiver<(SessionId, Message)>) {
    info!("archiving frames to {}", dir.display());
    let mut written = 0u64;
    // Exits when every sender is gone.
    while let Ok((session, frame)) = rx.recv() {
        let name = format!("frame_{}_{}_{}.jpg", session, frame.kind.to_wire(), frame.id);
        let path = dir.join(name);
        match fs::write(&path, &frame.payload) {
            Ok(()) => written += 1,
            Err(err) => warn!("could not write {}: {}", path.display(), err),
        }
    }
    debug!("frame writer done after {written} files");
}
