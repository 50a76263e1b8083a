//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ns_transport::config::{TlsConfig, TlsMode, TransportConfig};
use ns_transport::{Packet, PacketDemultiplexer};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// Clear-text config for node `id` on an ephemeral loopback port.
pub fn clear_config(id: &str) -> TransportConfig {
    let mut config = TransportConfig::default();
    config.node.id = id.to_string();
    config.dispatch.worker_threads = 2;
    config.dispatch.tls_task_threads = 1;
    config
}

/// TLS config presenting the `identity` certificate from the fixtures.
pub fn tls_config(id: &str, mode: TlsMode, identity: &str) -> TransportConfig {
    let mut config = clear_config(id);
    config.tls = TlsConfig {
        mode,
        cert_path: Some(fixture(&format!("{identity}.pem"))),
        key_path: Some(fixture(&format!("{identity}.key"))),
        ca_path: Some(fixture("ca.pem")),
        ..TlsConfig::default()
    };
    config
}

/// A demultiplexer that forwards every packet to the returned receiver.
pub fn collector() -> (Arc<dyn PacketDemultiplexer>, mpsc::Receiver<Packet>) {
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    let handler = Arc::new(move |packet: &Packet| tx.lock().send(packet.clone()).is_ok());
    (handler, rx)
}

pub fn recv(rx: &mpsc::Receiver<Packet>) -> Packet {
    rx.recv_timeout(TIMEOUT).expect("packet not delivered in time")
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> SocketAddr {
    let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    scratch.local_addr().unwrap()
}
