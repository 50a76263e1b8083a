//! Error types shared across the transport.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;
use crate::net::framing::FramingError;
use crate::net::tls::TlsError;

/// Errors surfaced to callers of the transport and messenger.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure (bind, register, connect setup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The destination has no live channel and its write queue is full.
    #[error("destination {0} is unreachable")]
    Unreachable(SocketAddr),

    /// The node id could not be resolved to an address.
    #[error("unknown node id '{0}'")]
    UnknownNode(String),

    /// A structured message could not be serialized.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// TLS context could not be built.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// The framing settings cannot produce a working codec.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The transport has been stopped.
    #[error("transport stopped")]
    Stopped,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
