//! Session registry shared by every transport thread.
//!
//! A session is created when a TCP control connection arrives and lives
//! until that connection closes. The registry maps session ids to the
//! hand-off points the transports need: the frame slot, the worker's wakeup
//! channel and the counters. Frames from any transport funnel through
//! [`SessionRegistry::offer_frame`], which never blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{debug, info};
use parking_lot::Mutex;

use crate::message::{Message, SessionId};
use crate::slot::FreshestSlot;

/// Per-session counters, updated lock-free from several threads.
pub struct SessionStats {
    started: Instant,
    frames_in: AtomicU64,
    frames_dropped: AtomicU64,
    frames_processed: AtomicU64,
    sent_tcp: AtomicU64,
    sent_udp: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            frames_in: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            sent_tcp: AtomicU64::new(0),
            sent_udp: AtomicU64::new(0),
        }
    }

    pub fn record_frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent_tcp(&self) {
        self.sent_tcp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent_udp(&self) {
        self.sent_udp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn sent_tcp(&self) -> u64 {
        self.sent_tcp.load(Ordering::Relaxed)
    }

    pub fn sent_udp(&self) -> u64 {
        self.sent_udp.load(Ordering::Relaxed)
    }

    /// One closing line per session, mirroring the startup log.
    pub fn log_summary(&self, session: SessionId) {
        info!(
            "session {} closing after {:.1}s: {} frames in, {} dropped, {} processed, {} sent over TCP, {} over UDP",
            session,
            self.started.elapsed().as_secs_f32(),
            self.frames_in(),
            self.frames_dropped(),
            self.frames_processed(),
            self.sent_tcp(),
            self.sent_udp(),
        );
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// What the transports need to deliver inbound frames to a session.
pub struct SessionHandle {
    /// Freshest-wins hand-off to the session's processor worker.
    pub frame_slot: Arc<FreshestSlot<Message>>,
    /// Wakeup for the worker, bounded at one pending tick.
    pub ticks: Sender<()>,
    pub stats: Arc<SessionStats>,
}

/// Shared map from session ids to their hand-off points.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    frame_tap: Mutex<Option<Sender<(SessionId, Message)>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            frame_tap: Mutex::new(None),
        }
    }

    pub fn insert(&self, session: SessionId, handle: SessionHandle) {
        self.sessions.lock().insert(session, handle);
    }

    pub fn remove(&self, session: SessionId) -> Option<SessionHandle> {
        self.sessions.lock().remove(&session)
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions.lock().contains_key(&session)
    }

    pub fn stats(&self, session: SessionId) -> Option<Arc<SessionStats>> {
        self.sessions.lock().get(&session).map(|h| h.stats.clone())
    }

    /// Deliver an inbound frame to its session, freshest-wins.
    ///
    /// Unknown sessions drop the frame; a frame racing a session teardown
    /// is not worth keeping. Never blocks.
    pub fn offer_frame(&self, session: SessionId, frame: Message) {
        let sessions = self.sessions.lock();
        let handle = match sessions.get(&session) {
            Some(handle) => handle,
            None => {
                debug!("dropping frame {} for unknown session {}", frame.id, session);
                return;
            }
        };
        handle.stats.record_frame_in();
        if let Some(tap) = self.frame_tap.lock().as_ref() {
            // Lossy: a slow tap consumer must not stall ingest.
            let _ = tap.try_send((session, frame.clone()));
        }
        if handle.frame_slot.put(frame) {
            handle.stats.record_dropped();
        }
        let _ = handle.ticks.try_send(());
    }

    /// Mirror every inbound frame to `tap` in addition to normal delivery.
    pub fn set_frame_tap(&self, tap: Sender<(SessionId, Message)>) {
        *self.frame_tap.lock() = Some(tap);
    }

    pub fn clear_frame_tap(&self) {
        *self.frame_tap.lock() = None;
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
