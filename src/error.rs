//! Error types for drishti-edge

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// drishti-edge error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire header shorter than the fixed header size
    #[error("Malformed header: expected {expected} bytes, got {actual}")]
    MalformedHeader {
        /// Required header length in bytes
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Invalid packet contents (bad field values, size caps exceeded)
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file parse error
    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
