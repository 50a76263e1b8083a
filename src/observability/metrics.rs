//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define transport metrics (bytes, frames, connections, retransmissions)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-direction and per-outcome counts
//!
//! # Metrics
//! - `transport_bytes_sent_total` / `transport_bytes_received_total` (counter)
//! - `transport_frames_decoded_total` (counter)
//! - `transport_malformed_headers_total` (counter)
//! - `transport_connections_total` (counter): by direction (inbound, outbound)
//! - `transport_active_connections` (gauge)
//! - `transport_connect_attempts_total` (counter)
//! - `transport_sends_dropped_total` (counter): by reason
//! - `transport_retransmissions_total` (counter)
//! - `transport_tls_handshakes_total` (counter): by outcome
//! - `transport_packets_total` (counter): by outcome (dispatched, local, unregistered, invalid, stopped)
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Labels are low-cardinality enums, never addresses

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_bytes_sent(bytes: usize) {
    counter!("transport_bytes_sent_total").increment(bytes as u64);
}

pub fn record_bytes_received(bytes: usize) {
    counter!("transport_bytes_received_total").increment(bytes as u64);
}

pub fn record_frames_decoded(frames: usize) {
    counter!("transport_frames_decoded_total").increment(frames as u64);
}

pub fn record_malformed_header() {
    counter!("transport_malformed_headers_total").increment(1);
}

pub fn record_connection_opened(direction: &'static str) {
    counter!("transport_connections_total", "direction" => direction).increment(1);
    gauge!("transport_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("transport_active_connections").decrement(1.0);
}

pub fn record_connect_attempt() {
    counter!("transport_connect_attempts_total").increment(1);
}

pub fn record_send_dropped(reason: &'static str) {
    counter!("transport_sends_dropped_total", "reason" => reason).increment(1);
}

pub fn record_retransmission() {
    counter!("transport_retransmissions_total").increment(1);
}

pub fn record_tls_handshake(outcome: &'static str) {
    counter!("transport_tls_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_packet(outcome: &'static str) {
    counter!("transport_packets_total", "outcome" => outcome).increment(1);
}
