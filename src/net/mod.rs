//! Transport layer: socket servers and per-flow reassembly.
//!
//! The servers own the sockets and their reader threads; everything they
//! learn flows to the pipeline as [`ServerEvent`]s on a channel, so the
//! pipeline never blocks on network I/O.

pub mod tcp_assembler;
pub mod tcp_server;
pub mod udp_assembler;
pub mod udp_sender;
pub mod udp_server;

pub use tcp_assembler::TcpAssembler;
pub use tcp_server::TcpServer;
pub use udp_assembler::UdpAssembler;
pub use udp_sender::UdpSender;
pub use udp_server::UdpServer;

use std::net::SocketAddr;

use crate::message::{Message, SessionId};

/// Notifications from the transport threads to the pipeline.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client connected and was assigned a session id.
    SessionOpened {
        session: SessionId,
        /// Remote address, absent for in-process clients.
        peer: Option<SocketAddr>,
    },
    /// A non-frame message arrived on either transport.
    Control { session: SessionId, message: Message },
    /// The client's control connection went away.
    SessionClosed { session: SessionId },
}
