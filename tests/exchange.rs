//! Clear-text message exchange between nodes.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ns_transport::dispatch::tagged;
use ns_transport::{Messenger, Packet, StaticResolver};

mod common;

#[test]
fn test_every_message_is_delivered() {
    let resolver = Arc::new(StaticResolver::default());
    let a = Messenger::start(&common::clear_config("a"), Arc::clone(&resolver)).unwrap();
    let b = Messenger::start(&common::clear_config("b"), Arc::clone(&resolver)).unwrap();
    resolver.insert("b", b.local_addr());

    let (handler, rx) = common::collector();
    b.register_packet_type(10, handler);

    for seq in 0..200 {
        a.send_to_id("b", &json!({ "type": 10, "seq": seq })).unwrap();
    }

    let mut seen: Vec<i64> = (0..200)
        .map(|_| common::recv(&rx).body["seq"].as_i64().unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..200).collect::<Vec<_>>());

    a.stop();
    b.stop();
}

#[test]
fn test_single_channel_preserves_byte_order() {
    let mut config = common::clear_config("b");
    config.dispatch.worker_threads = 0;
    let a = Messenger::start(&common::clear_config("a"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&config, StaticResolver::default()).unwrap();

    // Inline dispatch runs on the selector thread in read order.
    let (handler, rx) = common::collector();
    b.register_packet_type(11, handler);
    for seq in 0..100 {
        a.send_to_address(b.local_addr(), &json!({ "type": 11, "seq": seq })).unwrap();
    }

    for expected in 0..100 {
        assert_eq!(common::recv(&rx).body["seq"], expected);
    }
    a.stop();
    b.stop();
}

#[test]
fn test_large_payload_spans_many_reads() {
    let a = Messenger::start(&common::clear_config("a"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::clear_config("b"), StaticResolver::default()).unwrap();
    let (handler, rx) = common::collector();
    b.register_packet_type(12, handler);

    let blob = "x".repeat(2 * 1024 * 1024);
    let message = json!({ "type": 12, "blob": blob });
    a.send_to_address(b.local_addr(), &message).unwrap();

    assert_eq!(common::recv(&rx).body, message);
    a.stop();
    b.stop();
}

#[test]
fn test_duplex_reply_uses_inbound_channel() {
    let a = Messenger::start(&common::clear_config("a"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::clear_config("b"), StaticResolver::default()).unwrap();

    let replier = b.clone();
    let ping_sender = Arc::new(parking_lot::Mutex::new(None));
    let recorded = Arc::clone(&ping_sender);
    b.register_packet_type(
        1,
        Arc::new(move |packet: &Packet| {
            *recorded.lock() = Some(packet.sender);
            let echo = tagged(2, json!({ "echo": packet.body["n"] }));
            replier.send_to_address(packet.sender, &echo).is_ok()
        }),
    );
    let (handler, rx) = common::collector();
    a.register_packet_type(2, handler);

    a.send_to_address(b.local_addr(), &json!({ "type": 1, "n": 7 })).unwrap();
    let echo = common::recv(&rx);
    assert_eq!(echo.body["echo"], 7);
    assert_eq!(echo.sender, b.local_addr());

    // The reply travelled over the accepted channel; B never dialled A.
    let a_ephemeral = ping_sender.lock().unwrap();
    assert_eq!(b.transport().connect_attempts(a_ephemeral), 0);
    assert_eq!(b.transport().connect_attempts(a.local_addr()), 0);

    a.stop();
    b.stop();
}

#[test]
fn test_local_loopback_skips_network() {
    let mut config = common::clear_config("solo");
    let port = common::free_port();
    config.nodes.insert("solo".into(), port.to_string());

    let messenger = Messenger::start(&config, StaticResolver::from_config(&config)).unwrap();
    assert_eq!(messenger.local_addr(), port);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    messenger.register_packet_type(
        4,
        Arc::new(move |_: &Packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }),
    );

    messenger.send_to_id("solo", &json!({ "type": 4 })).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "local delivery returns after the handler ran");
    assert_eq!(messenger.transport().connect_attempts(port), 0);
    messenger.stop();
}

#[test]
fn test_first_registration_wins() {
    let a = Messenger::start(&common::clear_config("a"), StaticResolver::default()).unwrap();
    let b = Messenger::start(&common::clear_config("b"), StaticResolver::default()).unwrap();

    let (first, first_rx) = common::collector();
    let (second, second_rx) = common::collector();
    assert!(b.register_packet_type(6, first));
    assert_eq!(b.register_demultiplexer(&[6, 7], second), 1);

    a.send_to_address(b.local_addr(), &json!({ "type": 6 })).unwrap();
    a.send_to_address(b.local_addr(), &json!({ "type": 7 })).unwrap();

    assert_eq!(common::recv(&first_rx).packet_type, 6);
    assert_eq!(common::recv(&second_rx).packet_type, 7);
    assert!(second_rx.recv_timeout(Duration::from_millis(200)).is_err());

    a.stop();
    b.stop();
}

#[test]
fn test_malformed_header_resyncs_on_next_frame() {
    let b = Messenger::start(&common::clear_config("b"), StaticResolver::default()).unwrap();
    let (handler, rx) = common::collector();
    b.register_packet_type(3, handler);

    let body = br#"{"type":3}"#;
    let mut raw = std::net::TcpStream::connect(b.local_addr()).unwrap();
    raw.write_all(b"&abc&").unwrap();
    raw.write_all(format!("&{}&", body.len()).as_bytes()).unwrap();
    raw.write_all(body).unwrap();
    raw.write_all(b"&9&not json!").unwrap();
    raw.flush().unwrap();

    assert_eq!(common::recv(&rx).packet_type, 3);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    b.stop();
}
