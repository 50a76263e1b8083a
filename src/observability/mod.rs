//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Selector, dispatcher and messenger produce:
//!     → tracing events (structured fields: peer, token, packet_type)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metrics are cheap (atomic increments)
//! - Per-message events log at debug/trace only

pub mod logging;
pub mod metrics;
