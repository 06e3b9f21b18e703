//! Reassembly of length-framed messages from a TCP byte stream.
//!
//! TCP hands the reader arbitrary chunks with no relation to message
//! boundaries. The assembler buffers bytes until a full header is present,
//! then until the header's payload is present, and emits complete
//! [`Message`]s in arrival order. A single `feed` can complete zero, one or
//! several messages.

use crate::error::Result;
use crate::message::Message;
use crate::wire::{decode_tcp_header, TcpHeader, TCP_HEADER_LEN};

/// Incremental parser for one TCP connection's inbound stream.
pub struct TcpAssembler {
    buffer: Vec<u8>,
    pending: Option<TcpHeader>,
}

impl TcpAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            pending: None,
        }
    }

    /// Feed raw stream bytes and return every message they complete.
    ///
    /// An error means the stream is unframeable (corrupt or hostile
    /// header); the caller should drop the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            if self.pending.is_none() {
                if self.buffer.len() < TCP_HEADER_LEN {
                    break;
                }
                let header = decode_tcp_header(&self.buffer)?;
                self.buffer.drain(..TCP_HEADER_LEN);
                self.pending = Some(header);
            }
            // The pending header may date from an earlier feed.
            let header = match self.pending {
                Some(header) => header,
                None => break,
            };
            if self.buffer.len() < header.size {
                break;
            }
            let payload: Vec<u8> = self.buffer.drain(..header.size).collect();
            self.pending = None;
            out.push(Message::new(header.kind, header.id, payload));
        }
        Ok(out)
    }
}

impl Default for TcpAssembler {
    fn default() -> Self {
        Self::new()
    }
}
