//! Application-level message model shared by both transports.
//!
//! A [`Message`] is what the reassembly layers produce and the send paths
//! consume: a kind tag, a sequence id and an opaque payload. Frame payloads
//! are never inspected by this crate; they pass through to the processor
//! pipeline as raw bytes.

use std::borrow::Cow;

use crate::error::Result;

/// Session identifier, generated at TCP accept time.
///
/// Always non-zero for a live session; the value 0 marks an unbound UDP
/// peer whose messages are dropped downstream.
pub type SessionId = u32;

/// Wire-level message type tags.
///
/// The numeric values are part of the protocol and shared with the mobile
/// clients; they must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum MessageKind {
    /// Unknown or absent type. Decoded for unrecognized tags.
    None = 0,
    /// UDP-only: binds a datagram source address to a TCP session.
    Connection = 1,
    /// JSON control message.
    Json = 2,
    /// Encoded video frame.
    Image = 3,
    /// Encoded video frame with a 4-byte trailing metadata tag.
    ImageWithMetadata = 4,
    /// Calibration mode toggle, single-byte boolean payload.
    Calibration = 5,
    /// Client-triggered action A.
    TriggerA = 6,
    /// Client-triggered action B.
    TriggerB = 7,
    /// Client-triggered action C.
    TriggerC = 8,
}

impl MessageKind {
    /// Decode a wire tag. Unknown tags map to [`MessageKind::None`].
    pub fn from_wire(tag: i16) -> Self {
        match tag {
            1 => MessageKind::Connection,
            2 => MessageKind::Json,
            3 => MessageKind::Image,
            4 => MessageKind::ImageWithMetadata,
            5 => MessageKind::Calibration,
            6 => MessageKind::TriggerA,
            7 => MessageKind::TriggerB,
            8 => MessageKind::TriggerC,
            _ => MessageKind::None,
        }
    }

    /// Wire tag for this kind.
    pub fn to_wire(self) -> i16 {
        self as i16
    }

    /// True for the frame kinds that travel the lossy data path.
    pub fn is_image(self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::ImageWithMetadata)
    }
}

/// A reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type tag.
    pub kind: MessageKind,
    /// Sequence id. Frame ids increase monotonically per session.
    pub id: u32,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Metadata tag, appended as four trailing bytes at encode time for
    /// [`MessageKind::ImageWithMetadata`].
    pub metadata: Option<i32>,
}

impl Message {
    /// Create a message without metadata.
    pub fn new(kind: MessageKind, id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            id,
            payload,
            metadata: None,
        }
    }

    /// Create an [`MessageKind::ImageWithMetadata`] frame carrying a tag.
    pub fn with_metadata(id: u32, payload: Vec<u8>, metadata: i32) -> Self {
        Self {
            kind: MessageKind::ImageWithMetadata,
            id,
            payload,
            metadata: Some(metadata),
        }
    }

    /// Create a JSON control message from a serializable value.
    pub fn json<T: serde::Serialize>(id: u32, value: &T) -> Result<Self> {
        Ok(Self::new(MessageKind::Json, id, serde_json::to_vec(value)?))
    }

    /// Create the UDP binding message carrying a session id.
    pub fn connection(session: SessionId) -> Self {
        Self::new(
            MessageKind::Connection,
            0,
            (session as i32).to_be_bytes().to_vec(),
        )
    }

    /// Payload as it goes on the wire.
    ///
    /// For metadata-tagged frames the tag byte is repeated four times after
    /// the payload, which is how clients locate it without a header field.
    pub fn encoded_payload(&self) -> Cow<'_, [u8]> {
        match (self.kind, self.metadata) {
            (MessageKind::ImageWithMetadata, Some(tag)) => {
                let mut bytes = Vec::with_capacity(self.payload.len() + 4);
                bytes.extend_from_slice(&self.payload);
                bytes.extend_from_slice(&[tag as u8; 4]);
                Cow::Owned(bytes)
            }
            _ => Cow::Borrowed(&self.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_tags_are_stable() {
        assert_eq!(MessageKind::None.to_wire(), 0);
        assert_eq!(MessageKind::Connection.to_wire(), 1);
        assert_eq!(MessageKind::Json.to_wire(), 2);
        assert_eq!(MessageKind::Image.to_wire(), 3);
        assert_eq!(MessageKind::ImageWithMetadata.to_wire(), 4);
        assert_eq!(MessageKind::Calibration.to_wire(), 5);
        assert_eq!(MessageKind::TriggerA.to_wire(), 6);
        assert_eq!(MessageKind::TriggerB.to_wire(), 7);
        assert_eq!(MessageKind::TriggerC.to_wire(), 8);
    }

    #[test]
    fn unknown_tag_decodes_to_none() {
        assert_eq!(MessageKind::from_wire(42), MessageKind::None);
        assert_eq!(MessageKind::from_wire(-3), MessageKind::None);
    }

    #[test]
    fn round_trip_all_tags() {
        for tag in 0..=8 {
            assert_eq!(MessageKind::from_wire(tag).to_wire(), tag);
        }
    }

    #[test]
    fn metadata_appends_four_tag_bytes() {
        let msg = Message::with_metadata(7, vec![1, 2, 3], 5);
        assert_eq!(msg.encoded_payload().as_ref(), &[1, 2, 3, 5, 5, 5, 5]);
    }

    #[test]
    fn plain_payload_is_borrowed() {
        let msg = Message::new(MessageKind::Image, 1, vec![9, 9]);
        assert!(matches!(msg.encoded_payload(), Cow::Borrowed(_)));
    }

    #[test]
    fn connection_payload_is_big_endian_session_id() {
        let msg = Message::connection(0x0102_0304);
        assert_eq!(msg.payload, vec![0x01, 0x02, 0x03, 0x04]);
    }
}
