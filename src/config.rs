//! TOML configuration.
//!
//! Every field has a default, so an empty file and a missing file both
//! yield a working server. Sections can be given partially; only the keys
//! present override the defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_TCP_PORT: u16 = 39200;
pub const DEFAULT_UDP_PORT: u16 = 39585;
/// Fragment payload size used until a client negotiates its own.
pub const DEFAULT_PACKET_SIZE: usize = 512;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
    /// Outbound UDP fragment payload size before negotiation.
    pub packet_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    Echo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub processor: ProcessorKind,
    /// Tag frames with metadata on the way back to the client.
    pub emit_metadata: bool,
    /// Mirror every inbound frame to this directory, off when unset.
    pub write_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorKind::Echo,
            emit_metadata: true,
            write_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter, overridable with RUST_LOG.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_the_documented_ports() {
        let config = AppConfig::default();
        assert_eq!(config.network.tcp_port, 39200);
        assert_eq!(config.network.udp_port, 39585);
        assert_eq!(config.network.packet_size, 512);
        assert_eq!(config.pipeline.processor, ProcessorKind::Echo);
        assert!(config.pipeline.emit_metadata);
        assert!(config.pipeline.write_dir.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            tcp_port = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.network.tcp_port, 5000);
        assert_eq!(config.network.udp_port, 39585);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn full_file_parses() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            tcp_port = 4000
            udp_port = 4001
            packet_size = 1400

            [pipeline]
            processor = "echo"
            emit_metadata = false
            write_dir = "/tmp/frames"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.network.packet_size, 1400);
        assert!(!config.pipeline.emit_metadata);
        assert_eq!(
            config.pipeline.write_dir,
            Some(PathBuf::from("/tmp/frames"))
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn from_file_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nudp_port = 7001").unwrap();
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network.udp_port, 7001);
        assert_eq!(config.network.tcp_port, 39200);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AppConfig::from_file(Path::new("/nonexistent/drishti.toml")).is_err());
    }
}
