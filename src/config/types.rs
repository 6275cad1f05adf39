//! Core configuration types and loading.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use weft_proto::{CompressorName, ConnectionDescription, NodeId};

use super::defaults::*;
use super::validation::{self, ValidationError};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<ValidationError>),
}

impl ConfigError {
    /// Get a static error code string for metrics labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "config_io",
            Self::Parse(_) => "config_parse",
            Self::Invalid(_) => "config_invalid",
        }
    }
}

/// Runtime configuration.
///
/// Built once at process start and shared as `Arc<Config>`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,
    /// Endpoints this node listens on.
    #[serde(default)]
    pub listen: Vec<ConnectionDescription>,
    /// Object data streaming.
    #[serde(default)]
    pub object: ObjectConfig,
    /// Instance cache and send-on-register queue.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Reliable-multicast tuning; recorded and validated only.
    #[serde(default)]
    pub rsp: RspConfig,
    /// Prometheus endpoint.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate the result.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate(self).map_err(ConfigError::Invalid)
    }

    /// The configured node id, or a fresh one.
    pub fn node_id(&self) -> NodeId {
        self.node
            .id
            .map(NodeId::from)
            .unwrap_or_else(NodeId::generate)
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Node identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Fixed node id; generated at startup when absent.
    pub id: Option<uuid::Uuid>,
    /// Node type advertised to peers.
    #[serde(default = "default_node_type")]
    pub node_type: u32,
    /// Log output format for the daemon.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            node_type: default_node_type(),
            log_format: LogFormat::default(),
        }
    }
}

/// Object data streaming configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectConfig {
    /// Bytes buffered before a data packet is sent.
    #[serde(default = "default_object_buffer_size")]
    pub buffer_size: usize,
    /// Default history retention for buffered masters, in commit incarnations.
    #[serde(default = "default_auto_obsolete")]
    pub auto_obsolete: u32,
    /// Compressor used when an object does not pick one.
    #[serde(default)]
    pub compressor: CompressorName,
}

impl Default for ObjectConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_object_buffer_size(),
            auto_obsolete: default_auto_obsolete(),
            compressor: CompressorName::None,
        }
    }
}

/// Instance cache and send-on-register configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Instance cache budget in bytes; 0 disables the cache.
    #[serde(default = "default_instance_cache_size")]
    pub instance_cache_size: usize,
    /// Registered masters queued for broadcast; 0 disables send-on-register.
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,
    /// Queued entries older than this are dropped; 0 keeps them.
    #[serde(default = "default_send_queue_age_ms")]
    pub send_queue_age_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            instance_cache_size: default_instance_cache_size(),
            send_queue_size: default_send_queue_size(),
            send_queue_age_ms: default_send_queue_age_ms(),
        }
    }
}

/// Timeout configuration, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Default for blocking operations (sync, send token, barrier).
    #[serde(default = "default_timeout_ms")]
    pub default_ms: u64,
    /// Idle time before a keepalive ping is sent.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    /// Handshake wait.
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,
    /// Receiver select timeout.
    #[serde(default = "default_select_ms")]
    pub select_ms: u64,
}

impl TimeoutsConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn select(&self) -> Duration {
        Duration::from_millis(self.select_ms)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            default_ms: default_timeout_ms(),
            keepalive_ms: default_keepalive_ms(),
            handshake_ms: default_handshake_ms(),
            select_ms: default_select_ms(),
        }
    }
}

/// Reliable stream protocol tuning.
///
/// No RSP transport is built in; the values are parsed and checked so that
/// a shared configuration file stays valid for nodes that have one.
#[derive(Debug, Clone, Deserialize)]
pub struct RspConfig {
    #[serde(default = "default_rsp_num_buffers")]
    pub num_buffers: u32,
    #[serde(default = "default_rsp_ack_timeout_ms")]
    pub ack_timeout_ms: u32,
    #[serde(default = "default_rsp_ack_frequency")]
    pub ack_frequency: u32,
    #[serde(default = "default_rsp_error_downscale")]
    pub error_downscale: u32,
    #[serde(default = "default_rsp_error_upscale")]
    pub error_upscale: u32,
    #[serde(default = "default_rsp_error_maxscale")]
    pub error_maxscale: u32,
    #[serde(default = "default_rsp_min_sendrate_shift")]
    pub min_sendrate_shift: u32,
    #[serde(default = "default_udp_mtu")]
    pub udp_mtu: u32,
    #[serde(default = "default_udp_buffer_size")]
    pub udp_buffer_size: u32,
}

impl Default for RspConfig {
    fn default() -> Self {
        Self {
            num_buffers: default_rsp_num_buffers(),
            ack_timeout_ms: default_rsp_ack_timeout_ms(),
            ack_frequency: default_rsp_ack_frequency(),
            error_downscale: default_rsp_error_downscale(),
            error_upscale: default_rsp_error_upscale(),
            error_maxscale: default_rsp_error_maxscale(),
            min_sendrate_shift: default_rsp_min_sendrate_shift(),
            udp_mtu: default_udp_mtu(),
            udp_buffer_size: default_udp_buffer_size(),
        }
    }
}

/// Prometheus endpoint configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    /// Port for `/metrics`; disabled when absent.
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use weft_proto::ConnectionType;

    // ========================================================================
    // Defaults
    // ========================================================================

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.listen.is_empty());
        assert_eq!(config.node.node_type, 1);
        assert_eq!(config.object.buffer_size, 60_000);
        assert_eq!(config.timeouts.default_ms, 300_000);
        assert_eq!(config.timeouts.keepalive_ms, 2_000);
        assert_eq!(config.timeouts.handshake_ms, 10_000);
        assert_eq!(config.timeouts.select_ms, 1_000);
        assert_eq!(config.rsp.ack_frequency, 17);
        assert!(config.metrics.port.is_none());
    }

    #[test]
    fn default_trait_matches_serde_defaults() {
        let parsed: Config = toml::from_str("").unwrap();
        let built = Config::default();
        assert_eq!(parsed.object.buffer_size, built.object.buffer_size);
        assert_eq!(parsed.cache.instance_cache_size, built.cache.instance_cache_size);
        assert_eq!(parsed.timeouts.select_ms, built.timeouts.select_ms);
    }

    // ========================================================================
    // Parsing
    // ========================================================================

    #[test]
    fn full_file_parses() {
        let toml = r#"
[node]
id = "01234567-89ab-cdef-0123-456789abcdef"
node_type = 7
log_format = "json"

[[listen]]
type = "tcp"
hostname = "0.0.0.0"
port = 4242

[[listen]]
type = "tcp"
hostname = "10.0.0.2"
port = 4243
multicast = { address = "239.255.42.43", port = 4343 }

[object]
buffer_size = 8192
auto_obsolete = 3
compressor = "rle"

[cache]
instance_cache_size = 1048576
send_queue_size = 16

[timeouts]
keepalive_ms = 500

[metrics]
port = 9100
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.node_id(),
            NodeId(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef)
        );
        assert_eq!(config.node.log_format, LogFormat::Json);
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].connection_type, ConnectionType::Tcp);
        assert_eq!(config.listen[0].port, 4242);
        assert!(config.listen[1].multicast.is_some());
        assert_eq!(config.object.compressor, CompressorName::Rle);
        assert_eq!(config.object.auto_obsolete, 3);
        assert_eq!(config.cache.send_queue_size, 16);
        assert_eq!(config.timeouts.keepalive_ms, 500);
        assert_eq!(config.timeouts.default_ms, 300_000);
        assert_eq!(config.metrics.port, Some(9100));
    }

    #[test]
    fn generated_node_id_when_absent() {
        let config = Config::default();
        assert!(config.node_id().is_generated());
    }

    #[test]
    fn load_reads_file_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[object]\nbuffer_size = 0").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert_eq!(err.error_code(), "config_invalid");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[object]\nbuffer_size = 1000").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(config.object.buffer_size > 0);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load("/nonexistent/weft.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
