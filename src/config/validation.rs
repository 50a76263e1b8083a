//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (TLS modes reference certificate material)
//! - Validate value ranges (queue depth > 0, backoff factor >= 1)
//! - Reject delimiters the frame decoder cannot resynchronize on
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{TlsMode, TransportConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("node '{id}' has invalid address '{address}'")]
    InvalidNodeAddress { id: String, address: String },

    #[error("listener bind address '{0}' is invalid")]
    InvalidBindAddress(String),

    #[error("framing delimiter must be non-empty and must not contain digits")]
    InvalidDelimiter,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("retransmit factor must be at least 1")]
    InvalidFactor,

    #[error("retransmit jitter_ratio must be within 0.0..=1.0")]
    InvalidJitter,

    #[error("TLS mode {mode:?} requires {field}")]
    MissingTlsMaterial { mode: TlsMode, field: &'static str },

    #[error("tls max_buffer_size must be >= initial_buffer_size")]
    TlsBufferBounds,

    #[error("metrics address '{0}' is invalid")]
    InvalidMetricsAddress(String),
}

/// Validate a configuration, collecting every violation.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (id, address) in &config.nodes {
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidNodeAddress {
                id: id.clone(),
                address: address.clone(),
            });
        }
    }

    if let Some(bind) = &config.listener.bind_address {
        if bind.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidBindAddress(bind.clone()));
        }
    }

    let delimiter = &config.framing.delimiter;
    if delimiter.is_empty() || delimiter.bytes().any(|b| b.is_ascii_digit()) {
        errors.push(ValidationError::InvalidDelimiter);
    }

    let positive = [
        ("connections.max_queued_sends", config.connections.max_queued_sends),
        ("connections.read_buffer_size", config.connections.read_buffer_size),
        ("framing.max_frame_size", config.framing.max_frame_size),
        ("tls.initial_buffer_size", config.tls.initial_buffer_size),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }
    if config.connections.select_timeout_ms == 0 {
        errors.push(ValidationError::Zero { field: "connections.select_timeout_ms" });
    }
    if config.retransmit.base_delay_ms == 0 {
        errors.push(ValidationError::Zero { field: "retransmit.base_delay_ms" });
    }
    if config.retransmit.factor == 0 {
        errors.push(ValidationError::InvalidFactor);
    }
    if !(0.0..=1.0).contains(&config.retransmit.jitter_ratio) {
        errors.push(ValidationError::InvalidJitter);
    }

    if config.tls.max_buffer_size < config.tls.initial_buffer_size {
        errors.push(ValidationError::TlsBufferBounds);
    }

    let mode = config.tls.mode;
    if mode != TlsMode::Clear {
        if config.tls.cert_path.is_none() {
            errors.push(ValidationError::MissingTlsMaterial { mode, field: "cert_path" });
        }
        if config.tls.key_path.is_none() {
            errors.push(ValidationError::MissingTlsMaterial { mode, field: "key_path" });
        }
        if config.tls.ca_path.is_none() {
            errors.push(ValidationError::MissingTlsMaterial { mode, field: "ca_path" });
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
