//! Configuration system.
//!
//! Loads server/client configuration from JSON strings/files (file IO left
//! to the app). Defaults are conservative; `validate` rejects combinations
//! the pipeline cannot honor.

use serde::{Deserialize, Serialize};

use crate::crypto::CipherKind;
use crate::error::ProtocolError;
use crate::packet::MAX_PACKET_LEN;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1`.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// Listen port (1–65535).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_true")]
    pub nodelay: bool,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    /// Socket receive buffer, bytes (≥ 64 KiB).
    #[serde(default = "default_socket_buffer")]
    pub receive_buffer_size: usize,
    /// Socket send buffer, bytes (≥ 64 KiB).
    #[serde(default = "default_socket_buffer")]
    pub send_buffer_size: usize,
    /// Frames above this size are rejected before buffering.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Concurrent connections admitted per client IP.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
    /// Requests admitted per IP inside one sliding window.
    #[serde(default = "default_max_allowed_requests")]
    pub max_allowed_requests: usize,
    /// Sliding window length, milliseconds.
    #[serde(default = "default_time_window_ms")]
    pub time_window_ms: u64,
    /// Lockout after a window overflow, seconds.
    #[serde(default = "default_lockout_seconds")]
    pub lockout_seconds: u64,
    /// Idle firewall entries older than this are swept, seconds.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,

    /// Outbound TCP payloads above this are compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    /// Outbound UDP payloads above this are compressed (600–1200).
    #[serde(default = "default_udp_compression_threshold")]
    pub udp_compression_threshold_bytes: usize,

    /// Dispatch worker tasks draining the priority queue.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    /// Bound of each priority level.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity_per_level: usize,
    /// Promote packets waiting longer than this, milliseconds.
    /// `None` disables aging.
    #[serde(default)]
    pub age_boost_threshold_ms: Option<u64>,
    /// Per-connection event channel depth (backpressure bound).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
}

fn default_bind_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    40010
}

fn default_backlog() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_socket_buffer() -> usize {
    64 * 1024
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_LEN
}

fn default_max_connections_per_ip() -> u32 {
    20
}

fn default_max_allowed_requests() -> usize {
    100
}

fn default_time_window_ms() -> u64 {
    1_000
}

fn default_lockout_seconds() -> u64 {
    30
}

fn default_inactivity_threshold_secs() -> u64 {
    300
}

fn default_compression_threshold() -> usize {
    512
}

fn default_udp_compression_threshold() -> usize {
    900
}

fn default_dispatch_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_event_channel_capacity() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_ip: default_bind_ip(),
            port: default_port(),
            backlog: default_backlog(),
            nodelay: true,
            keepalive: true,
            reuse_address: true,
            receive_buffer_size: default_socket_buffer(),
            send_buffer_size: default_socket_buffer(),
            max_packet_size: default_max_packet_size(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_allowed_requests: default_max_allowed_requests(),
            time_window_ms: default_time_window_ms(),
            lockout_seconds: default_lockout_seconds(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            compression_threshold_bytes: default_compression_threshold(),
            udp_compression_threshold_bytes: default_udp_compression_threshold(),
            dispatch_workers: default_dispatch_workers(),
            queue_capacity_per_level: default_queue_capacity(),
            age_boost_threshold_ms: None,
            event_channel_capacity: default_event_channel_capacity(),
            enable_metrics: true,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Listen address string for socket binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.port == 0 {
            return Err(ProtocolError::Config("port must be 1-65535"));
        }
        if self.receive_buffer_size < 64 * 1024 || self.send_buffer_size < 64 * 1024 {
            return Err(ProtocolError::Config("socket buffers must be >= 64 KiB"));
        }
        if self.max_packet_size < 12 || self.max_packet_size > MAX_PACKET_LEN {
            return Err(ProtocolError::Config("max packet size out of range"));
        }
        if !(600..=1200).contains(&self.udp_compression_threshold_bytes) {
            return Err(ProtocolError::Config(
                "udp compression threshold must be 600-1200",
            ));
        }
        if self.dispatch_workers == 0 {
            return Err(ProtocolError::Config("at least one dispatch worker"));
        }
        if self.queue_capacity_per_level == 0 || self.event_channel_capacity == 0 {
            return Err(ProtocolError::Config("queue capacities must be non-zero"));
        }
        if self.max_connections_per_ip == 0 || self.max_allowed_requests == 0 {
            return Err(ProtocolError::Config("firewall limits must be non-zero"));
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:40010`.
    pub server_addr: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-request reply timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Cipher negotiated for the session (must match the server default).
    #[serde(default)]
    pub cipher: CipherKind,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_addr: "127.0.0.1:40010".to_string(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            cipher: CipherKind::default(),
            compression_threshold_bytes: default_compression_threshold(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn undersized_socket_buffers_fail() {
        let cfg = ServerConfig {
            send_buffer_size: 4096,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn udp_threshold_range_is_enforced() {
        let cfg = ServerConfig {
            udp_compression_threshold_bytes: 100,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_roundtrip_with_partial_fields() {
        let cfg = ServerConfig::from_json_str(r#"{"port": 9000, "nodelay": false}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert!(!cfg.nodelay);
        // Unspecified knobs take defaults.
        assert_eq!(cfg.max_allowed_requests, 100);
        assert_eq!(cfg.age_boost_threshold_ms, None);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
    }
}
