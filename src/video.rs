//! Video stream endpoints negotiated over the control channel.
//!
//! Sessions can move from JPEG stills to a proper video stream in either
//! direction: the client tells us where to aim our transmitter, or asks us
//! to open a receiver and report the port back. The traits keep the
//! pipeline independent of any codec stack; the null implementations wire
//! the negotiation end to end without encoding anything.

use std::fmt;
use std::net::{IpAddr, UdpSocket};

use log::{debug, info, trace};

use crate::error::Result;

/// Negotiated stream container, as spelled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    H264Udp,
    H264Tcp,
}

impl StreamFormat {
    /// Parse the client's format string. Unknown formats are `None` and the
    /// request that carried them is skipped.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "H264_UDP" => Some(StreamFormat::H264Udp),
            "H264_TCP" => Some(StreamFormat::H264Tcp),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            StreamFormat::H264Udp => "H264_UDP",
            StreamFormat::H264Tcp => "H264_TCP",
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Outbound video stream to a client.
pub trait VideoTransmitter: Send {
    /// Begin streaming to `host:port`. Frames pushed before `start` are
    /// dropped.
    fn start(&mut self, format: StreamFormat, host: IpAddr, port: u16) -> Result<()>;

    fn set_bitrate(&mut self, bps: u32);

    fn set_frame_size(&mut self, width: u32, height: u32);

    /// Hand one processed frame to the encoder.
    fn push_frame(&mut self, data: &[u8]);

    fn stop(&mut self);
}

/// Inbound video stream from a client.
pub trait VideoReceiver: Send {
    /// Open the receiver and return the local port the client should
    /// stream to.
    fn start(&mut self, format: StreamFormat, use_jitter_buffer: bool) -> Result<u16>;

    fn stop(&mut self);
}

/// Transmitter that exercises the negotiation but encodes nothing.
pub struct NullTransmitter {
    target: Option<(StreamFormat, IpAddr, u16)>,
    bitrate: u32,
    frame_size: (u32, u32),
    frames: u64,
}

impl NullTransmitter {
    pub fn new() -> Self {
        Self {
            target: None,
            bitrate: 0,
            frame_size: (0, 0),
            frames: 0,
        }
    }
}

impl Default for NullTransmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoTransmitter for NullTransmitter {
    fn start(&mut self, format: StreamFormat, host: IpAddr, port: u16) -> Result<()> {
        info!("null video transmitter aimed at {host}:{port} as {format}");
        self.target = Some((format, host, port));
        Ok(())
    }

    fn set_bitrate(&mut self, bps: u32) {
        debug!("null video transmitter bitrate set to {bps}");
        self.bitrate = bps;
    }

    fn set_frame_size(&mut self, width: u32, height: u32) {
        debug!("null video transmitter frame size set to {width}x{height}");
        self.frame_size = (width, height);
    }

    fn push_frame(&mut self, data: &[u8]) {
        if self.target.is_some() {
            self.frames += 1;
            trace!("null video transmitter swallowed {} byte frame", data.len());
        }
    }

    fn stop(&mut self) {
        if let Some((format, host, port)) = self.target.take() {
            info!(
                "null video transmitter to {host}:{port} ({format}) stopped after {} frames",
                self.frames
            );
        }
    }
}

/// Receiver that binds a real port and discards whatever arrives on it.
pub struct NullReceiver {
    // Held so the advertised port stays ours until stop.
    socket: Option<UdpSocket>,
}

impl NullReceiver {
    pub fn new() -> Self {
        Self { socket: None }
    }
}

impl Default for NullReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoReceiver for NullReceiver {
    fn start(&mut self, format: StreamFormat, use_jitter_buffer: bool) -> Result<u16> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let port = socket.local_addr()?.port();
        info!(
            "null video receiver on port {port} for {format} (jitter buffer {})",
            if use_jitter_buffer { "on" } else { "off" }
        );
        self.socket = Some(socket);
        Ok(port)
    }

    fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("null video receiver stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn format_strings_round_trip() {
        for format in [StreamFormat::H264Udp, StreamFormat::H264Tcp] {
            assert_eq!(StreamFormat::from_wire(format.as_wire()), Some(format));
        }
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert_eq!(StreamFormat::from_wire("MJPEG"), None);
        assert_eq!(StreamFormat::from_wire(""), None);
    }

    #[test]
    fn null_receiver_reports_a_usable_port() {
        let mut receiver = NullReceiver::new();
        let port = receiver.start(StreamFormat::H264Udp, false).unwrap();
        assert_ne!(port, 0);

        // The port stays taken until stop.
        let mut second = NullReceiver::new();
        let other = second.start(StreamFormat::H264Udp, false).unwrap();
        assert_ne!(port, other);
        receiver.stop();
        second.stop();
    }

    #[test]
    fn null_transmitter_counts_only_after_start() {
        let mut tx = NullTransmitter::new();
        tx.push_frame(&[0; 8]);
        assert_eq!(tx.frames, 0);
        tx.start(StreamFormat::H264Tcp, IpAddr::V4(Ipv4Addr::LOCALHOST), 5000)
            .unwrap();
        tx.push_frame(&[0; 8]);
        assert_eq!(tx.frames, 1);
        tx.stop();
    }
}
