//! Outbound UDP fragmentation and send scheduling.
//!
//! One thread owns the send socket. Callers never hand it a payload
//! directly: they put the frame in a per-session slot and queue a small
//! job. When the thread gets to the job it takes whatever is newest in the
//! slot, so a burst of frames behind a slow link collapses to the latest
//! one. A job whose slot is already empty was superseded and costs
//! nothing.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::Result;
use crate::message::{Message, SessionId};
use crate::session::SessionRegistry;
use crate::slot::FreshestSlot;
use crate::wire::{build_fragment, fragment_offsets};

const SEND_QUEUE_DEPTH: usize = 64;

struct SendJob {
    session: SessionId,
    addr: SocketAddr,
    packet_size: usize,
}

/// Fragmenting sender shared by every session streaming over UDP.
pub struct UdpSender {
    jobs: Sender<SendJob>,
    slots: Arc<Mutex<HashMap<SessionId, Arc<FreshestSlot<Message>>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpSender {
    pub fn start(registry: Arc<SessionRegistry>, running: Arc<AtomicBool>) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let (jobs_tx, jobs_rx) = bounded(SEND_QUEUE_DEPTH);
        let slots: Arc<Mutex<HashMap<SessionId, Arc<FreshestSlot<Message>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let loop_slots = slots.clone();
        let thread = thread::Builder::new()
            .name("udp-send".into())
            .spawn(move || send_loop(socket, jobs_rx, loop_slots, registry, running))?;
        Ok(Self {
            jobs: jobs_tx,
            slots,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Offer a frame for delivery to `addr`, freshest-wins per session.
    pub fn enqueue(&self, session: SessionId, addr: SocketAddr, packet_size: usize, msg: &Message) {
        let slot = self.slots.lock().entry(session).or_default().clone();
        slot.put(msg.clone());
        let job = SendJob {
            session,
            addr,
            packet_size,
        };
        if self.jobs.try_send(job).is_err() {
            trace!("session {session}: send queue full, frame waits for the next job");
        }
    }

    pub fn forget_session(&self, session: SessionId) {
        self.slots.lock().remove(&session);
    }

    /// Join the send thread. The shared running flag must already be false.
    pub fn stop(&self) {
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn send_loop(
    socket: UdpSocket,
    jobs: Receiver<SendJob>,
    slots: Arc<Mutex<HashMap<SessionId, Arc<FreshestSlot<Message>>>>>,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
) {
    let mut buf = Vec::new();
    while running.load(Ordering::Relaxed) {
        let job = match jobs.recv_timeout(Duration::from_millis(500)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let slot = match slots.lock().get(&job.session) {
            Some(slot) => slot.clone(),
            None => continue,
        };
        let msg = match slot.take() {
            Some(msg) => msg,
            // An earlier job already carried the newest frame.
            None => continue,
        };
        let payload = msg.encoded_payload();
        let mut sent_all = true;
        for (offset, len) in fragment_offsets(payload.len(), job.packet_size) {
            build_fragment(
                msg.kind,
                msg.id,
                payload.len(),
                offset,
                &payload[offset..offset + len],
                &mut buf,
            );
            if let Err(err) = socket.send_to(&buf, job.addr) {
                debug!(
                    "session {}: datagram to {} failed: {}",
                    job.session, job.addr, err
                );
                sent_all = false;
                break;
            }
        }
        if sent_all {
            trace!(
                "session {}: sent frame {} ({} bytes) to {}",
                job.session,
                msg.id,
                payload.len(),
                job.addr
            );
            if let Some(stats) = registry.stats(job.session) {
                stats.record_sent_udp();
            }
        }
    }
    debug!("UDP send loop done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::net::UdpAssembler;
    use crate::wire::{decode_udp_header, UDP_HEADER_LEN};
    use std::time::Instant;

    fn receiver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn start_sender() -> (UdpSender, Arc<AtomicBool>) {
        let registry = Arc::new(SessionRegistry::new());
        let running = Arc::new(AtomicBool::new(true));
        let sender = UdpSender::start(registry, running.clone()).unwrap();
        (sender, running)
    }

    fn recv_datagrams(socket: &UdpSocket, count: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(2);
        while out.len() < count && Instant::now() < deadline {
            if let Ok((n, _)) = socket.recv_from(&mut buf) {
                out.push(buf[..n].to_vec());
            }
        }
        out
    }

    #[test]
    fn frame_is_fragmented_at_the_packet_size() {
        let (socket, addr) = receiver();
        let (sender, running) = start_sender();

        let msg = Message::new(MessageKind::Image, 3, vec![0xCD; 2000]);
        sender.enqueue(9, addr, 800, &msg);

        let datagrams = recv_datagrams(&socket, 3);
        assert_eq!(datagrams.len(), 3);
        let headers: Vec<_> = datagrams
            .iter()
            .map(|d| decode_udp_header(d).unwrap())
            .collect();
        assert_eq!(
            headers.iter().map(|h| h.offset).collect::<Vec<_>>(),
            vec![0, 800, 1600]
        );
        assert_eq!(
            headers.iter().map(|h| h.packet_size).collect::<Vec<_>>(),
            vec![800, 800, 400]
        );
        assert!(headers.iter().all(|h| h.total_size == 2000 && h.file_id == 3));

        running.store(false, Ordering::Relaxed);
        sender.stop();
    }

    #[test]
    fn empty_frame_still_sends_one_datagram() {
        let (socket, addr) = receiver();
        let (sender, running) = start_sender();

        sender.enqueue(9, addr, 512, &Message::new(MessageKind::Json, 1, Vec::new()));
        let datagrams = recv_datagrams(&socket, 1);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].len(), UDP_HEADER_LEN);
        let header = decode_udp_header(&datagrams[0]).unwrap();
        assert_eq!(header.total_size, 0);
        assert_eq!(header.packet_size, 0);

        running.store(false, Ordering::Relaxed);
        sender.stop();
    }

    #[test]
    fn newest_frame_wins_under_back_to_back_enqueues() {
        let (socket, addr) = receiver();
        let (sender, running) = start_sender();

        sender.enqueue(9, addr, 512, &Message::new(MessageKind::Image, 1, vec![1; 600]));
        sender.enqueue(9, addr, 512, &Message::new(MessageKind::Image, 2, vec![2; 600]));

        // Feed whatever arrives back through an assembler; the last
        // complete message must be the newer frame.
        let mut asm = UdpAssembler::new();
        let mut last = None;
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok((n, _)) = socket.recv_from(&mut buf) {
                for msg in asm.feed(&buf[..n]).unwrap() {
                    last = Some(msg);
                }
            }
            if last.as_ref().map(|m| m.id) == Some(2) {
                break;
            }
        }
        let last = last.expect("no complete message arrived");
        assert_eq!(last.id, 2);
        assert_eq!(last.payload, vec![2; 600]);

        running.store(false, Ordering::Relaxed);
        sender.stop();
    }
}
