//! Configuration management for the connection engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Candidate gathering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IceServer {
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Peer connection configuration handed to the peer factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfiguration {
    /// ICE servers, replaced by the server-provided list after join
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,

    /// Relay-only when the server forces it
    #[serde(default)]
    pub ice_transport_policy: IceTransportPolicy,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_transport_policy: IceTransportPolicy::All,
        }
    }
}

impl RtcConfiguration {
    /// Adopt server-provided ICE servers; an empty list keeps the current ones
    pub fn apply_ice_servers(&mut self, servers: &[IceServer]) {
        if !servers.is_empty() {
            self.ice_servers = servers.to_vec();
        }
    }
}

/// Per-connection options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Subscribe to remote tracks automatically
    #[serde(default = "default_true")]
    pub auto_subscribe: bool,

    /// Peer connection configuration
    #[serde(default)]
    pub rtc_configuration: RtcConfiguration,

    /// Signaling protocol version sent in the connect URL
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// Join as a publish-only participant under this name
    #[serde(default)]
    pub publish_only: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            rtc_configuration: RtcConfiguration::default(),
            protocol_version: default_protocol_version(),
            publish_only: None,
        }
    }
}

/// Room-level behaviour the engine consults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RoomOptions {
    /// Ask the server to adapt stream quality to rendered size
    #[serde(default)]
    pub adaptive_stream: bool,

    /// Sample transport stats every interval and publish them
    #[serde(default)]
    pub report_stats: bool,
}

/// Bounds for every suspension point, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_socket_connect_ms")]
    pub socket_connect_ms: u64,

    #[serde(default = "default_join_response_ms")]
    pub join_response_ms: u64,

    #[serde(default = "default_transport_state_ms")]
    pub transport_state_ms: u64,

    #[serde(default = "default_publisher_data_channel_open_ms")]
    pub publisher_data_channel_open_ms: u64,

    #[serde(default = "default_publish_ms")]
    pub publish_ms: u64,

    /// Delay between reconnect attempts
    #[serde(default = "default_quick_reconnect_retry_ms")]
    pub quick_reconnect_retry_ms: u64,

    #[serde(default = "default_http_validate_ms")]
    pub http_validate_ms: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: usize,

    #[serde(default = "default_negotiation_debounce_ms")]
    pub negotiation_debounce_ms: u64,

    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            socket_connect_ms: default_socket_connect_ms(),
            join_response_ms: default_join_response_ms(),
            transport_state_ms: default_transport_state_ms(),
            publisher_data_channel_open_ms: default_publisher_data_channel_open_ms(),
            publish_ms: default_publish_ms(),
            quick_reconnect_retry_ms: default_quick_reconnect_retry_ms(),
            http_validate_ms: default_http_validate_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            negotiation_debounce_ms: default_negotiation_debounce_ms(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

impl Timeouts {
    pub fn socket_connect(&self) -> Duration {
        Duration::from_millis(self.socket_connect_ms)
    }

    pub fn join_response(&self) -> Duration {
        Duration::from_millis(self.join_response_ms)
    }

    pub fn transport_state(&self) -> Duration {
        Duration::from_millis(self.transport_state_ms)
    }

    pub fn publisher_data_channel_open(&self) -> Duration {
        Duration::from_millis(self.publisher_data_channel_open_ms)
    }

    pub fn publish(&self) -> Duration {
        Duration::from_millis(self.publish_ms)
    }

    pub fn quick_reconnect_retry(&self) -> Duration {
        Duration::from_millis(self.quick_reconnect_retry_ms)
    }

    pub fn http_validate(&self) -> Duration {
        Duration::from_millis(self.http_validate_ms)
    }

    pub fn negotiation_debounce(&self) -> Duration {
        Duration::from_millis(self.negotiation_debounce_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when RTC_ENGINE_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Connect options for the first connect
    #[serde(default)]
    pub connect: ConnectOptions,

    /// Room options
    #[serde(default)]
    pub room: RoomOptions,

    /// Timeouts and retry policy
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(EngineConfig::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let t = &self.timeouts;
        let bounds = [
            ("socket_connect_ms", t.socket_connect_ms),
            ("join_response_ms", t.join_response_ms),
            ("transport_state_ms", t.transport_state_ms),
            ("publisher_data_channel_open_ms", t.publisher_data_channel_open_ms),
            ("publish_ms", t.publish_ms),
            ("http_validate_ms", t.http_validate_ms),
            ("stats_interval_ms", t.stats_interval_ms),
        ];
        for (name, value) in bounds {
            if value == 0 {
                return Err(format!("Timeout {} must be non-zero", name).into());
            }
        }

        if t.reconnect_attempts == 0 {
            return Err("Reconnect attempts must be at least 1".into());
        }

        if self.connect.protocol_version < 2 {
            return Err("Protocol version must be 2 or newer".into());
        }

        for server in &self.connect.rtc_configuration.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entries need at least one url".into());
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

fn default_protocol_version() -> u32 { 8 }
fn default_socket_connect_ms() -> u64 { 10_000 }
fn default_join_response_ms() -> u64 { 7_000 }
fn default_transport_state_ms() -> u64 { 10_000 }
fn default_publisher_data_channel_open_ms() -> u64 { 7_000 }
fn default_publish_ms() -> u64 { 10_000 }
fn default_quick_reconnect_retry_ms() -> u64 { 2_000 }
fn default_http_validate_ms() -> u64 { 5_000 }
fn default_reconnect_attempts() -> usize { 3 }
fn default_negotiation_debounce_ms() -> u64 { 100 }
fn default_stats_interval_ms() -> u64 { 1_000 }

fn default_log_level() -> String {
    "info".to_string()
}
