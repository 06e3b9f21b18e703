//! Wire formats for the two transports.
//!
//! All integers are big-endian. The TCP stream carries length-framed
//! messages:
//!
//! ```text
//! +-----------+-----------+---------+------------------+
//! | size: i32 | kind: i16 | id: i32 | payload (size B) |
//! +-----------+-----------+---------+------------------+
//! ```
//!
//! UDP datagrams carry one fragment of a message each, addressed by byte
//! offset into the full payload:
//!
//! ```text
//! +-----------+--------------+-----------------+-------------+------------------+---------+
//! | kind: i16 | file id: i32 | total size: i32 | offset: i32 | packet size: i16 | payload |
//! +-----------+--------------+-----------------+-------------+------------------+---------+
//! ```
//!
//! The functions here are pure: they parse and build byte slices and never
//! touch a socket.

use crate::error::{Error, Result};
use crate::message::{Message, MessageKind};

/// TCP frame header length in bytes.
pub const TCP_HEADER_LEN: usize = 10;

/// UDP fragment header length in bytes.
pub const UDP_HEADER_LEN: usize = 16;

/// Upper bound on a single message payload. Anything larger is a corrupt
/// or hostile header, not a real frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Parsed TCP frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Payload length following the header.
    pub size: usize,
    pub kind: MessageKind,
    pub id: u32,
}

/// Parsed UDP fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub kind: MessageKind,
    /// Message this fragment belongs to. Increases per sender.
    pub file_id: u32,
    /// Full payload length once every fragment has arrived.
    pub total_size: usize,
    /// Byte position of this fragment inside the full payload.
    pub offset: usize,
    /// Declared fragment payload length.
    pub packet_size: usize,
}

fn read_i16(buf: &[u8]) -> i16 {
    i16::from_be_bytes([buf[0], buf[1]])
}

fn read_i32(buf: &[u8]) -> i32 {
    i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Parse a TCP frame header from the front of `buf`.
pub fn decode_tcp_header(buf: &[u8]) -> Result<TcpHeader> {
    if buf.len() < TCP_HEADER_LEN {
        return Err(Error::MalformedHeader {
            expected: TCP_HEADER_LEN,
            actual: buf.len(),
        });
    }
    let size = read_i32(&buf[0..4]);
    let kind = read_i16(&buf[4..6]);
    let id = read_i32(&buf[6..10]);
    if size < 0 {
        return Err(Error::InvalidPacket(format!("negative frame size {size}")));
    }
    if size as usize > MAX_MESSAGE_SIZE {
        return Err(Error::InvalidPacket(format!(
            "frame size {size} exceeds {MAX_MESSAGE_SIZE} byte limit"
        )));
    }
    if id < 0 {
        return Err(Error::InvalidPacket(format!("negative message id {id}")));
    }
    Ok(TcpHeader {
        size: size as usize,
        kind: MessageKind::from_wire(kind),
        id: id as u32,
    })
}

/// Parse a UDP fragment header from the front of a datagram.
pub fn decode_udp_header(buf: &[u8]) -> Result<UdpHeader> {
    if buf.len() < UDP_HEADER_LEN {
        return Err(Error::MalformedHeader {
            expected: UDP_HEADER_LEN,
            actual: buf.len(),
        });
    }
    let kind = read_i16(&buf[0..2]);
    let file_id = read_i32(&buf[2..6]);
    let total_size = read_i32(&buf[6..10]);
    let offset = read_i32(&buf[10..14]);
    let packet_size = read_i16(&buf[14..16]);
    if file_id < 0 || total_size < 0 || offset < 0 || packet_size < 0 {
        return Err(Error::InvalidPacket(format!(
            "negative field in fragment header: file {file_id} total {total_size} offset {offset} len {packet_size}"
        )));
    }
    Ok(UdpHeader {
        kind: MessageKind::from_wire(kind),
        file_id: file_id as u32,
        total_size: total_size as usize,
        offset: offset as usize,
        packet_size: packet_size as usize,
    })
}

/// Encode a full TCP frame into `buf`, replacing its contents.
///
/// The buffer is reused across calls on the send paths to avoid an
/// allocation per frame.
pub fn encode_tcp_message(msg: &Message, buf: &mut Vec<u8>) {
    let payload = msg.encoded_payload();
    buf.clear();
    buf.reserve(TCP_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    buf.extend_from_slice(&msg.kind.to_wire().to_be_bytes());
    buf.extend_from_slice(&(msg.id as i32).to_be_bytes());
    buf.extend_from_slice(&payload);
}

/// Yield `(offset, length)` pairs that cover a payload of `total` bytes in
/// fragments of at most `packet_size` bytes.
///
/// An empty payload still yields one zero-length fragment so the receiver
/// learns the message exists.
pub fn fragment_offsets(total: usize, packet_size: usize) -> impl Iterator<Item = (usize, usize)> {
    let step = packet_size.max(1);
    let mut offset = 0usize;
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        let len = step.min(total - offset);
        let item = (offset, len);
        offset += len;
        if offset >= total {
            done = true;
        }
        Some(item)
    })
}

/// Encode one UDP fragment into `buf`, replacing its contents.
///
/// `chunk` must be the payload slice at `offset`; `total` is the length of
/// the whole payload the fragments reassemble into.
pub fn build_fragment(
    kind: MessageKind,
    id: u32,
    total: usize,
    offset: usize,
    chunk: &[u8],
    buf: &mut Vec<u8>,
) {
    buf.clear();
    buf.reserve(UDP_HEADER_LEN + chunk.len());
    buf.extend_from_slice(&kind.to_wire().to_be_bytes());
    buf.extend_from_slice(&(id as i32).to_be_bytes());
    buf.extend_from_slice(&(total as i32).to_be_bytes());
    buf.extend_from_slice(&(offset as i32).to_be_bytes());
    buf.extend_from_slice(&(chunk.len() as i16).to_be_bytes());
    buf.extend_from_slice(chunk);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_header_round_trip() {
        let msg = Message::new(MessageKind::Json, 12, b"{}".to_vec());
        let mut buf = Vec::new();
        encode_tcp_message(&msg, &mut buf);
        assert_eq!(buf.len(), TCP_HEADER_LEN + 2);

        let header = decode_tcp_header(&buf).unwrap();
        assert_eq!(header.size, 2);
        assert_eq!(header.kind, MessageKind::Json);
        assert_eq!(header.id, 12);
        assert_eq!(&buf[TCP_HEADER_LEN..], b"{}");
    }

    #[test]
    fn tcp_header_layout_is_big_endian() {
        let msg = Message::new(MessageKind::Image, 0x0102_0304, vec![0xAA]);
        let mut buf = Vec::new();
        encode_tcp_message(&msg, &mut buf);
        assert_eq!(
            buf,
            vec![0, 0, 0, 1, 0, 3, 0x01, 0x02, 0x03, 0x04, 0xAA]
        );
    }

    #[test]
    fn short_tcp_header_is_rejected() {
        let err = decode_tcp_header(&[0; 9]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::MalformedHeader {
                expected: TCP_HEADER_LEN,
                actual: 9
            }
        ));
    }

    #[test]
    fn negative_tcp_size_is_rejected() {
        let mut buf = vec![0u8; TCP_HEADER_LEN];
        buf[0..4].copy_from_slice(&(-5i32).to_be_bytes());
        assert!(decode_tcp_header(&buf).is_err());
    }

    #[test]
    fn oversized_tcp_frame_is_rejected() {
        let mut buf = vec![0u8; TCP_HEADER_LEN];
        buf[0..4].copy_from_slice(&(MAX_MESSAGE_SIZE as i32 + 1).to_be_bytes());
        assert!(decode_tcp_header(&buf).is_err());
    }

    #[test]
    fn metadata_bytes_are_encoded_after_payload() {
        let msg = Message::with_metadata(1, vec![1, 2], 0);
        let mut buf = Vec::new();
        encode_tcp_message(&msg, &mut buf);
        let header = decode_tcp_header(&buf).unwrap();
        assert_eq!(header.size, 6);
        assert_eq!(&buf[TCP_HEADER_LEN..], &[1, 2, 0, 0, 0, 0]);
    }

    #[test]
    fn udp_header_round_trip() {
        let mut buf = Vec::new();
        build_fragment(MessageKind::Image, 9, 2000, 800, &[7; 800], &mut buf);
        let header = decode_udp_header(&buf).unwrap();
        assert_eq!(header.kind, MessageKind::Image);
        assert_eq!(header.file_id, 9);
        assert_eq!(header.total_size, 2000);
        assert_eq!(header.offset, 800);
        assert_eq!(header.packet_size, 800);
        assert_eq!(buf.len(), UDP_HEADER_LEN + 800);
    }

    #[test]
    fn short_udp_header_is_rejected() {
        assert!(decode_udp_header(&[0; 15]).is_err());
    }

    #[test]
    fn negative_udp_offset_is_rejected() {
        let mut buf = vec![0u8; UDP_HEADER_LEN];
        buf[10..14].copy_from_slice(&(-1i32).to_be_bytes());
        assert!(decode_udp_header(&buf).is_err());
    }

    #[test]
    fn fragments_cover_payload_exactly() {
        let parts: Vec<_> = fragment_offsets(2000, 800).collect();
        assert_eq!(parts, vec![(0, 800), (800, 800), (1600, 400)]);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let parts: Vec<_> = fragment_offsets(1600, 800).collect();
        assert_eq!(parts, vec![(0, 800), (800, 800)]);
    }

    #[test]
    fn empty_payload_yields_one_fragment() {
        let parts: Vec<_> = fragment_offsets(0, 512).collect();
        assert_eq!(parts, vec![(0, 0)]);
    }

    #[test]
    fn zero_packet_size_does_not_spin() {
        let parts: Vec<_> = fragment_offsets(3, 0).collect();
        assert_eq!(parts, vec![(0, 1), (1, 1), (2, 1)]);
    }
}
