//! Edge server for live video and sensor streams from mobile clients.
//!
//! Clients connect over TCP for control and session setup, then stream
//! frames over TCP or UDP. Every frame hand-off in the server is
//! freshest-wins: a single slot per stage where a new frame displaces an
//! unconsumed one, so latency stays flat when a client, a link or a
//! processor falls behind.
//!
//! ```text
//! client ──TCP──> TcpServer ──┐                    ┌──> TcpServer ──> client
//!                             ├─> SessionRegistry ──> ProcessorWorker
//! client ──UDP──> UdpServer ──┘   (slot per session) └─> UdpSender ──> client
//! ```
//!
//! A UDP flow is anonymous until the client echoes back the session id it
//! got in the TCP greeting; from then on both transports feed the same
//! session.

pub mod config;
pub mod error;
pub mod message;
pub mod mock;
pub mod net;
pub mod processor;
pub mod server;
pub mod session;
pub mod slot;
pub mod video;
pub mod wire;
pub mod writer;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use message::{Message, MessageKind, SessionId};
pub use server::DrishtiServer;
