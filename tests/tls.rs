//! Message exchange over TLS channels.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ns_transport::config::TlsMode;
use ns_transport::dispatch::tagged;
use ns_transport::{Messenger, Packet, PacketDemultiplexer, StaticResolver};

mod common;

#[test]
fn test_server_auth_exchange() {
    let a = Messenger::start(&common::tls_config("a", TlsMode::ServerAuth, "server"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::tls_config("b", TlsMode::ServerAuth, "server"), StaticResolver::default()).unwrap();
    let (handler, rx) = common::collector();
    b.register_packet_type(20, handler);

    for seq in 0..50 {
        a.send_to_address(b.local_addr(), &json!({ "type": 20, "seq": seq })).unwrap();
    }

    let mut seen: Vec<i64> = (0..50)
        .map(|_| common::recv(&rx).body["seq"].as_i64().unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());

    a.stop();
    b.stop();
}

#[test]
fn test_mutual_auth_duplex_reply() {
    let a = Messenger::start(&common::tls_config("a", TlsMode::MutualAuth, "client"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::tls_config("b", TlsMode::MutualAuth, "server"), StaticResolver::default()).unwrap();

    let replier = b.clone();
    b.register_packet_type(
        1,
        Arc::new(move |packet: &Packet| {
            let echo = tagged(2, json!({ "echo": packet.body["n"] }));
            replier.send_to_address(packet.sender, &echo).is_ok()
        }),
    );
    let (handler, rx) = common::collector();
    a.register_packet_type(2, handler);

    a.send_to_address(b.local_addr(), &json!({ "type": 1, "n": 42 })).unwrap();
    let echo = common::recv(&rx);
    assert_eq!(echo.body["echo"], 42);
    assert_eq!(echo.sender, b.local_addr());

    a.stop();
    b.stop();
}

#[test]
fn test_large_payload_over_tls() {
    let a = Messenger::start(&common::tls_config("a", TlsMode::MutualAuth, "client"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::tls_config("b", TlsMode::MutualAuth, "server"), StaticResolver::default()).unwrap();
    let (handler, rx) = common::collector();
    b.register_packet_type(21, handler);

    // Several records wide on both the wrap and unwrap side.
    let message = json!({ "type": 21, "blob": "y".repeat(256 * 1024) });
    a.send_to_address(b.local_addr(), &message).unwrap();
    assert_eq!(common::recv(&rx).body, message);

    a.stop();
    b.stop();
}

#[test]
fn test_slow_reader_receives_mixed_record_sizes() {
    let a = Messenger::start(&common::tls_config("a", TlsMode::ServerAuth, "server"), StaticResolver::default()).unwrap();
    let mut config = common::tls_config("b", TlsMode::ServerAuth, "server");
    config.dispatch.worker_threads = 0;
    let b = Messenger::start(&config, StaticResolver::default()).unwrap();

    // Inline handler on the selector thread: ciphertext piles up while it sleeps.
    let (collect, rx) = common::collector();
    b.register_packet_type(
        24,
        Arc::new(move |packet: &Packet| {
            std::thread::sleep(Duration::from_millis(20));
            collect.handle_packet(packet)
        }),
    );

    for seq in 0..40 {
        let size = if seq % 2 == 0 { 16_300 } else { 1_000 };
        let message = json!({ "type": 24, "seq": seq, "pad": "z".repeat(size) });
        a.send_to_address(b.local_addr(), &message).unwrap();
    }

    for expected in 0..40 {
        assert_eq!(common::recv(&rx).body["seq"], expected);
    }

    a.stop();
    b.stop();
}

#[test]
fn test_untrusted_client_is_rejected() {
    let rogue = Messenger::start(&common::tls_config("rogue", TlsMode::MutualAuth, "rogue"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::tls_config("b", TlsMode::MutualAuth, "server"), StaticResolver::default()).unwrap();
    let (handler, rx) = common::collector();
    b.register_packet_type(22, handler);

    rogue.send_to_address(b.local_addr(), &json!({ "type": 22 })).unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());

    rogue.stop();
    b.stop();
}

#[test]
fn test_clear_client_cannot_reach_tls_server() {
    let a = Messenger::start(&common::clear_config("a"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::tls_config("b", TlsMode::ServerAuth, "server"), StaticResolver::default()).unwrap();
    let (handler, rx) = common::collector();
    b.register_packet_type(23, handler);

    a.send_to_address(b.local_addr(), &json!({ "type": 23 })).unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());

    a.stop();
    b.stop();
}
