//! Reassembly of offset-addressed fragments from a UDP datagram flow.
//!
//! Each datagram carries one fragment of a message, tagged with the
//! message's file id, the full payload size and the fragment's byte
//! offset. Fragments may arrive out of order or not at all. The assembler
//! builds one message at a time and applies freshest-wins rules:
//!
//! * fragments for an older file id than the current one are discarded,
//! * a fragment for a newer file id flushes the current message in its
//!   partial state before the new one starts,
//! * a fragment for an already-emitted file id reopens that file from
//!   scratch.
//!
//! One `feed` can therefore emit up to two messages: the flushed partial
//! and a completed single-fragment successor.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind, SessionId};
use crate::wire::{decode_udp_header, UdpHeader, MAX_MESSAGE_SIZE, UDP_HEADER_LEN};

/// Incremental reassembler for one UDP peer.
pub struct UdpAssembler {
    /// Session this peer is bound to, 0 until a Connection message binds it.
    session: SessionId,
    current_file: Option<u32>,
    kind: MessageKind,
    buffer: Vec<u8>,
    total_size: usize,
    /// Bytes copied into the buffer so far. Duplicate fragments count
    /// twice, so completion can fire with padding still in place.
    received: usize,
    flushed: bool,
}

impl UdpAssembler {
    pub fn new() -> Self {
        Self {
            session: 0,
            current_file: None,
            kind: MessageKind::None,
            buffer: Vec::new(),
            total_size: 0,
            received: 0,
            flushed: true,
        }
    }

    /// Session id bound to this peer, 0 if none yet.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Bind this peer's flow to a TCP session.
    pub fn bind_session(&mut self, session: SessionId) {
        self.session = session;
    }

    /// Feed one datagram and return every message it completes or flushes.
    ///
    /// An error means the datagram itself was unparseable; assembler state
    /// is unchanged and the caller can keep feeding.
    pub fn feed(&mut self, datagram: &[u8]) -> Result<Vec<Message>> {
        let header = decode_udp_header(datagram)?;
        if header.total_size > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidPacket(format!(
                "fragment declares {} byte message, limit is {}",
                header.total_size, MAX_MESSAGE_SIZE
            )));
        }
        let mut out = Vec::new();
        if header.offset > header.total_size {
            warn!(
                "discarding fragment of file {}: offset {} beyond total size {}",
                header.file_id, header.offset, header.total_size
            );
            return Ok(out);
        }
        let payload = &datagram[UDP_HEADER_LEN..];
        if payload.len() != header.packet_size {
            warn!(
                "fragment of file {} declares {} payload bytes but carries {}",
                header.file_id,
                header.packet_size,
                payload.len()
            );
        }

        if let Some(current) = self.current_file {
            if header.file_id < current {
                debug!(
                    "discarding stale fragment of file {} while building {}",
                    header.file_id, current
                );
                return Ok(out);
            }
            if header.file_id > current && !self.flushed {
                self.flush_partial(&mut out);
            }
            if header.file_id > current || self.flushed {
                self.start_file(&header);
            }
        } else {
            self.start_file(&header);
        }

        // Positional copy, clamped to the message bounds. A mid-file
        // fragment can disagree with the total recorded at rollover, so
        // both ends of the range need the clamp.
        let take = payload.len().min(header.packet_size);
        let start = header.offset.min(self.total_size);
        let end = (header.offset + take).min(self.total_size);
        let copied = end.saturating_sub(start);
        self.buffer[start..end].copy_from_slice(&payload[..copied]);
        self.received += copied;

        if self.received >= self.total_size {
            let mut data = std::mem::take(&mut self.buffer);
            data.truncate(self.total_size);
            self.flushed = true;
            out.push(Message::new(self.kind, header.file_id, data));
        }
        Ok(out)
    }

    /// Emit the current message with however many bytes have arrived.
    fn flush_partial(&mut self, out: &mut Vec<Message>) {
        let id = match self.current_file {
            Some(id) => id,
            None => return,
        };
        let len = self.received.min(self.total_size);
        debug!(
            "flushing incomplete file {} with {} of {} bytes",
            id, len, self.total_size
        );
        let mut data = std::mem::take(&mut self.buffer);
        data.truncate(len);
        self.flushed = true;
        out.push(Message::new(self.kind, id, data));
    }

    fn start_file(&mut self, header: &UdpHeader) {
        self.current_file = Some(header.file_id);
        self.kind = header.kind;
        self.total_size = header.total_size;
        self.buffer = vec![0; header.total_size];
        self.received = 0;
        self.flushed = false;
    }
}

impl Default for UdpAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build_fragment;

    fn fragment(kind: MessageKind, id: u32, total: usize, offset: usize, chunk: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        build_fragment(kind, id, total, offset, chunk, &mut buf);
        buf
    }

    #[test]
    fn single_fragment_message_completes() {
        let mut asm = UdpAssembler::new();
        let out = asm
            .feed(&fragment(MessageKind::Image, 1, 4, 0, &[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, MessageKind::Image);
        assert_eq!(out[0].id, 1);
        assert_eq!(out[0].payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn fragments_assemble_in_order() {
        let payload: Vec<u8> = (0..200).map(|n| n as u8).collect();
        let mut asm = UdpAssembler::new();
        assert!(asm
            .feed(&fragment(MessageKind::Image, 2, 200, 0, &payload[..128]))
            .unwrap()
            .is_empty());
        let out = asm
            .feed(&fragment(MessageKind::Image, 2, 200, 128, &payload[128..]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, payload);
    }

    #[test]
    fn fragments_assemble_out_of_order() {
        let payload = b"abcdefghij";
        let mut asm = UdpAssembler::new();
        assert!(asm
            .feed(&fragment(MessageKind::Image, 3, 10, 5, &payload[5..]))
            .unwrap()
            .is_empty());
        let out = asm
            .feed(&fragment(MessageKind::Image, 3, 10, 0, &payload[..5]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, payload.to_vec());
    }

    #[test]
    fn stale_file_id_is_discarded() {
        let mut asm = UdpAssembler::new();
        asm.feed(&fragment(MessageKind::Image, 5, 2, 0, &[1, 2]))
            .unwrap();
        let out = asm
            .feed(&fragment(MessageKind::Image, 3, 2, 0, &[9, 9]))
            .unwrap();
        assert!(out.is_empty());
        // A later file is still accepted.
        let out = asm
            .feed(&fragment(MessageKind::Image, 6, 1, 0, &[7]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 6);
    }

    #[test]
    fn newer_file_flushes_partial_predecessor() {
        let mut asm = UdpAssembler::new();
        assert!(asm
            .feed(&fragment(MessageKind::Image, 10, 1000, 0, &[0xAB; 400]))
            .unwrap()
            .is_empty());
        let out = asm
            .feed(&fragment(MessageKind::Image, 11, 3, 0, &[1, 2, 3]))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, 10);
        assert_eq!(out[0].payload, vec![0xAB; 400]);
        assert_eq!(out[1].id, 11);
        assert_eq!(out[1].payload, vec![1, 2, 3]);
    }

    #[test]
    fn completed_file_reopens_on_repeat_id() {
        let mut asm = UdpAssembler::new();
        let out = asm
            .feed(&fragment(MessageKind::Image, 4, 2, 0, &[1, 2]))
            .unwrap();
        assert_eq!(out.len(), 1);
        // Same id again starts the file over.
        assert!(asm
            .feed(&fragment(MessageKind::Image, 4, 4, 0, &[5, 6]))
            .unwrap()
            .is_empty());
        let out = asm
            .feed(&fragment(MessageKind::Image, 4, 4, 2, &[7, 8]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, vec![5, 6, 7, 8]);
    }

    #[test]
    fn offset_beyond_total_is_discarded() {
        let mut asm = UdpAssembler::new();
        asm.feed(&fragment(MessageKind::Image, 1, 100, 0, &[1; 50]))
            .unwrap();
        // Corrupt fragment, even for a newer file, leaves state untouched.
        let out = asm
            .feed(&fragment(MessageKind::Image, 2, 100, 150, &[9; 10]))
            .unwrap();
        assert!(out.is_empty());
        let out = asm
            .feed(&fragment(MessageKind::Image, 1, 100, 50, &[1; 50]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, vec![1; 100]);
    }

    #[test]
    fn tail_fragment_is_clamped_to_total() {
        let mut asm = UdpAssembler::new();
        assert!(asm
            .feed(&fragment(MessageKind::Image, 1, 10, 8, &[7, 7, 7, 7, 7]))
            .unwrap()
            .is_empty());
        let out = asm
            .feed(&fragment(MessageKind::Image, 1, 10, 0, &[1; 8]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, vec![1, 1, 1, 1, 1, 1, 1, 1, 7, 7]);
    }

    #[test]
    fn duplicate_fragments_inflate_the_count() {
        let mut asm = UdpAssembler::new();
        assert!(asm
            .feed(&fragment(MessageKind::Image, 1, 10, 0, &[3; 5]))
            .unwrap()
            .is_empty());
        // The repeat pushes received past total; the tail stays zeroed.
        let out = asm
            .feed(&fragment(MessageKind::Image, 1, 10, 0, &[3; 5]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, vec![3, 3, 3, 3, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn mid_file_total_change_does_not_write_out_of_bounds() {
        let mut asm = UdpAssembler::new();
        asm.feed(&fragment(MessageKind::Image, 1, 10, 0, &[1; 5]))
            .unwrap();
        // Same file id, inflated total: the copy clamps to the recorded size.
        assert!(asm
            .feed(&fragment(MessageKind::Image, 1, 100, 50, &[9; 10]))
            .unwrap()
            .is_empty());
        let out = asm
            .feed(&fragment(MessageKind::Image, 1, 10, 5, &[2; 5]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn empty_message_completes_immediately() {
        let mut asm = UdpAssembler::new();
        let out = asm
            .feed(&fragment(MessageKind::Json, 8, 0, 0, &[]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].payload.is_empty());
    }

    #[test]
    fn oversized_total_is_an_error() {
        let mut buf = vec![0u8; UDP_HEADER_LEN];
        buf[0..2].copy_from_slice(&3i16.to_be_bytes());
        buf[2..6].copy_from_slice(&1i32.to_be_bytes());
        buf[6..10].copy_from_slice(&i32::MAX.to_be_bytes());
        let mut asm = UdpAssembler::new();
        assert!(asm.feed(&buf).is_err());
    }

    #[test]
    fn session_binding_is_remembered() {
        let mut asm = UdpAssembler::new();
        assert_eq!(asm.session(), 0);
        asm.bind_session(42);
        assert_eq!(asm.session(), 42);
    }
}
