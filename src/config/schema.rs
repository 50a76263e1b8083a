//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a transport
//! node. All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for a transport node.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Identity of the local node.
    pub node: NodeConfig,

    /// Node id to socket address map (`"ns-1" = "10.0.0.1:24400"`).
    pub nodes: BTreeMap<String, String>,

    /// Listener configuration (bind address, backlog).
    pub listener: ListenerConfig,

    /// TLS mode and certificate material.
    pub tls: TlsConfig,

    /// Connection manager and selector settings.
    pub connections: ConnectionConfig,

    /// Wire framing settings.
    pub framing: FramingConfig,

    /// Worker pool sizes.
    pub dispatch: DispatchConfig,

    /// Retransmission backoff.
    pub retransmit: RetransmitConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl TransportConfig {
    /// Resolve the configured address of `id` in the node map.
    pub fn node_address(&self, id: &str) -> Option<SocketAddr> {
        self.nodes.get(id).and_then(|addr| addr.parse().ok())
    }

    /// Parse every entry of the node map, skipping unparsable addresses.
    pub fn node_addresses(&self) -> BTreeMap<String, SocketAddr> {
        self.nodes
            .iter()
            .filter_map(|(id, addr)| addr.parse().ok().map(|a| (id.clone(), a)))
            .collect()
    }

    /// Address the listener binds to.
    ///
    /// An explicit `listener.bind_address` wins; otherwise the local node's
    /// entry in the node map; otherwise an ephemeral loopback port.
    pub fn bind_address(&self) -> Option<SocketAddr> {
        match &self.listener.bind_address {
            Some(addr) => addr.parse().ok(),
            None => Some(
                self.node_address(&self.node.id)
                    .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0))),
            ),
        }
    }
}

/// Local node identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id, looked up in the `nodes` map.
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "ns-0".to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address override (e.g., "0.0.0.0:24400").
    pub bind_address: Option<String>,

    /// Accept backlog passed to `listen(2)`.
    pub backlog: i32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            backlog: 1024,
        }
    }
}

/// TLS mode for every channel of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Clear,
    /// Servers present certificates; clients verify them.
    ServerAuth,
    /// Both ends present and verify certificates.
    MutualAuth,
}

/// TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Channel security mode.
    pub mode: TlsMode,

    /// Path to this node's certificate chain (PEM).
    pub cert_path: Option<String>,

    /// Path to this node's private key (PEM).
    pub key_path: Option<String>,

    /// Path to the trusted CA bundle (PEM).
    pub ca_path: Option<String>,

    /// Server name presented by clients; defaults to the peer IP.
    pub server_name: Option<String>,

    /// Starting size of the wrap/unwrap destination buffers.
    pub initial_buffer_size: usize,

    /// Hard cap for destination buffer growth on overflow.
    pub max_buffer_size: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::Clear,
            cert_path: None,
            key_path: None,
            ca_path: None,
            server_name: None,
            // One maximal TLS record plus header and AEAD overhead.
            initial_buffer_size: 16_709,
            max_buffer_size: 1024 * 1024,
        }
    }
}

/// Connection manager and selector configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum queued sends per destination before new sends are dropped.
    pub max_queued_sends: usize,

    /// Minimum interval between connection attempts to one address.
    pub min_reconnect_interval_ms: u64,

    /// Reuse accepted channels for outbound writes to the same peer.
    pub duplex_reuse: bool,

    /// SO_SNDBUF hint.
    pub send_buffer_size: Option<usize>,

    /// SO_RCVBUF hint.
    pub recv_buffer_size: Option<usize>,

    /// Size of the selector's reusable read buffer.
    pub read_buffer_size: usize,

    /// Upper bound on one blocking poll.
    pub select_timeout_ms: u64,

    /// Disable Nagle on every channel.
    pub nodelay: bool,
}

impl ConnectionConfig {
    pub fn min_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.min_reconnect_interval_ms)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_queued_sends: 8192,
            min_reconnect_interval_ms: 5000,
            duplex_reuse: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            read_buffer_size: 64 * 1024,
            select_timeout_ms: 500,
            nodelay: true,
        }
    }
}

/// Wire framing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Header delimiter; must be non-empty and digit-free.
    pub delimiter: String,

    /// Largest accepted frame payload in bytes.
    pub max_frame_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            delimiter: "&".to_string(),
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

/// Worker pool sizes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Packet handler threads; 0 runs handlers inline on the selector thread.
    pub worker_threads: usize,

    /// TLS delegated-task threads; 0 runs tasks inline.
    pub tls_task_threads: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            tls_task_threads: 2,
        }
    }
}

/// Retransmission configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetransmitConfig {
    /// Delay before the first retransmission in milliseconds.
    pub base_delay_ms: u64,

    /// Multiplier applied to the delay after each failed retry.
    pub factor: u32,

    /// Ceiling for the retransmission delay in milliseconds.
    pub max_delay_ms: u64,

    /// Random extra delay as a fraction of the computed delay (0.0 = none).
    pub jitter_ratio: f64,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            factor: 2,
            max_delay_ms: 3_600_000,
            jitter_ratio: 0.0,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
