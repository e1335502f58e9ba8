//! Datagram sockets over loopback.

mod common;

use common::*;
use gantry::prelude::*;
use gantry::{DatagramState, FilterContext, Filtered, ReceiveFilter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn bound(label: &str) -> (Arc<DatagramRecorder>, flume::Receiver<Dg>, DatagramSocket, SocketAddr) {
    let (rec, rx) = DatagramRecorder::new();
    let sock = rec.socket(label);
    sock.bind(0, Some("127.0.0.1")).unwrap();
    assert_eq!(sock.state(), DatagramState::Bound);
    let addr = sock.local_addr().unwrap();
    (rec, rx, sock, addr)
}

fn expect_received(rx: &flume::Receiver<Dg>) -> (Vec<u8>, SocketAddr, Option<String>) {
    match next_dg(rx) {
        Dg::Received(data, from, ctx) => (data, from, ctx),
        other => panic!("expected datagram, got {other:?}"),
    }
}

#[test]
fn test_send_to_reports_destination() {
    let (_ra, rx_a, a, addr_a) = bound("a");
    let (_rb, rx_b, b, addr_b) = bound("b");
    b.begin_receiving().unwrap();

    a.send_to(&b"hello"[..], addr_b, None, 1);
    match next_dg(&rx_a) {
        Dg::Sent(1, dest) => assert_eq!(dest, addr_b),
        other => panic!("unexpected {other:?}"),
    }
    let (data, from, ctx) = expect_received(&rx_b);
    assert_eq!(data, b"hello");
    assert_eq!(from, addr_a);
    assert_eq!(ctx, None);

    let stats = a.stats();
    assert_eq!(stats.datagrams_sent, 1);
    assert_eq!(stats.bytes_sent, 5);
    assert_eq!(b.stats().datagrams_received, 1);
}

#[test]
fn test_connected_socket_rejects_explicit_destinations() {
    let (_ra, rx_a, a, _) = bound("a");
    let (_rb, _rx_b, _b, addr_b) = bound("b");
    let (_rc, _rx_c, _c, addr_c) = bound("c");

    a.connect(addr_b).unwrap();
    match next_dg(&rx_a) {
        Dg::Connected(peer) => assert_eq!(peer, addr_b),
        other => panic!("unexpected {other:?}"),
    }
    assert!(a.is_connected());
    assert_eq!(a.peer_addr(), Some(addr_b));
    assert!(matches!(a.connect(addr_c), Err(GantryError::Config(_))));

    a.send_to(&b"elsewhere"[..], addr_c, None, 1);
    a.send(&b"peer"[..], None, 2);
    // an explicit destination is refused even when it is the peer
    a.send_to(&b"peer again"[..], addr_b, None, 3);
    a.send_to_host(&b"by name"[..], "127.0.0.1", addr_b.port(), None, 4);
    a.send(&b"still fine"[..], None, 5);

    assert!(matches!(next_dg(&rx_a), Dg::SendFailed(1, GantryError::Config(_))));
    assert!(matches!(next_dg(&rx_a), Dg::Sent(2, d) if d == addr_b));
    assert!(matches!(next_dg(&rx_a), Dg::SendFailed(3, GantryError::Config(_))));
    assert!(matches!(next_dg(&rx_a), Dg::SendFailed(4, GantryError::Config(_))));
    assert!(matches!(next_dg(&rx_a), Dg::Sent(5, d) if d == addr_b));
}

#[test]
fn test_connect_is_ordered_with_sends() {
    let (_ra, rx_a, a, _) = bound("a");
    let (_rb, _rx_b, _b, addr_b) = bound("b");

    a.send(&b"too early"[..], None, 1);
    a.connect(addr_b).unwrap();
    a.send(&b"in order"[..], None, 2);

    assert!(matches!(next_dg(&rx_a), Dg::SendFailed(1, GantryError::Config(_))));
    assert!(matches!(next_dg(&rx_a), Dg::Connected(_)));
    assert!(matches!(next_dg(&rx_a), Dg::Sent(2, _)));
}

#[test]
fn test_connect_to_unresolvable_host_keeps_socket() {
    let (_ra, rx_a, a, _) = bound("a");
    let (_rb, _rx_b, _b, addr_b) = bound("b");

    a.connect_to_host("", 9).unwrap();
    assert!(matches!(next_dg(&rx_a), Dg::ConnectFailed(GantryError::Resolve { .. })));
    assert_eq!(a.state(), DatagramState::Bound);

    a.send_to(&b"still works"[..], addr_b, None, 1);
    assert!(matches!(next_dg(&rx_a), Dg::Sent(1, _)));
}

#[test]
fn test_receive_filter_discards_and_labels() {
    let (_ra, _rx_a, a, _) = bound("a");
    let (_rb, rx_b, b, addr_b) = bound("b");

    let filter: ReceiveFilter = Arc::new(|data: &[u8], _from: SocketAddr| {
        if data.starts_with(b"drop") {
            Filtered::Discard
        } else {
            let label: FilterContext = Box::new(format!("len={}", data.len()));
            Filtered::Deliver(Some(label))
        }
    });
    b.set_receive_filter(Some(filter));
    b.begin_receiving().unwrap();

    a.send_to(&b"drop me"[..], addr_b, None, 1);
    a.send_to(&b"keep"[..], addr_b, None, 2);
    a.send_to(&b"drop too"[..], addr_b, None, 3);
    a.send_to(&b"keep 2"[..], addr_b, None, 4);

    let (first, _, ctx) = expect_received(&rx_b);
    assert_eq!(first, b"keep");
    assert_eq!(ctx.as_deref(), Some("len=4"));
    let (second, _, ctx) = expect_received(&rx_b);
    assert_eq!(second, b"keep 2");
    assert_eq!(ctx.as_deref(), Some("len=6"));
    assert!(rx_b.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_receive_once_pauses_after_one() {
    let (_ra, _rx_a, a, _) = bound("a");
    let (_rb, rx_b, b, addr_b) = bound("b");

    b.receive_once().unwrap();
    a.send_to(&b"one"[..], addr_b, None, 1);
    a.send_to(&b"two"[..], addr_b, None, 2);

    assert_eq!(expect_received(&rx_b).0, b"one");
    assert!(rx_b.recv_timeout(Duration::from_millis(300)).is_err());

    // the second datagram waited in the kernel
    b.receive_once().unwrap();
    assert_eq!(expect_received(&rx_b).0, b"two");
}

#[test]
fn test_receive_once_skips_filtered() {
    let (_ra, _rx_a, a, _) = bound("a");
    let (_rb, rx_b, b, addr_b) = bound("b");
    b.set_receive_filter(Some(Arc::new(|data: &[u8], _: SocketAddr| {
        if data == b"noise" {
            Filtered::Discard
        } else {
            Filtered::Deliver(None)
        }
    })));

    b.receive_once().unwrap();
    a.send_to(&b"noise"[..], addr_b, None, 1);
    a.send_to(&b"signal"[..], addr_b, None, 2);
    assert_eq!(expect_received(&rx_b).0, b"signal");
}

#[test]
fn test_pause_holds_datagrams() {
    let (_ra, rx_a, a, _) = bound("a");
    let (_rb, rx_b, b, addr_b) = bound("b");
    b.begin_receiving().unwrap();
    b.pause_receiving();

    a.send_to(&b"held"[..], addr_b, None, 1);
    assert!(matches!(next_dg(&rx_a), Dg::Sent(1, _)));
    assert!(rx_b.recv_timeout(Duration::from_millis(300)).is_err());

    b.begin_receiving().unwrap();
    assert_eq!(expect_received(&rx_b).0, b"held");
}

#[test]
fn test_close_after_sending_flushes_queue() {
    let (_ra, rx_a, a, _) = bound("a");
    let (_rb, rx_b, b, addr_b) = bound("b");
    b.begin_receiving().unwrap();

    for tag in 0..3 {
        a.send_to(format!("msg {tag}").into_bytes(), addr_b, None, tag);
    }
    a.close_after_sending();
    a.send_to(&b"late"[..], addr_b, None, 9);

    for tag in 0..3 {
        assert!(matches!(next_dg(&rx_a), Dg::Sent(t, _) if t == tag));
    }
    assert!(matches!(next_dg(&rx_a), Dg::Closed(None)));
    assert!(matches!(next_dg(&rx_a), Dg::SendFailed(9, GantryError::Closed)));
    assert!(a.is_closed());

    for tag in 0..3 {
        assert_eq!(expect_received(&rx_b).0, format!("msg {tag}").as_bytes());
    }
}

#[test]
fn test_close_fails_unsent_and_stops_receiving() {
    let (_ra, rx_a, a, _) = bound("a");
    a.begin_receiving().unwrap();
    a.close();
    a.send(&b"x"[..], None, 1);

    assert!(matches!(next_dg(&rx_a), Dg::Closed(None)));
    assert!(matches!(next_dg(&rx_a), Dg::SendFailed(1, GantryError::Closed)));
    assert!(matches!(a.begin_receiving(), Err(GantryError::Closed)));
    assert!(matches!(a.connect(SocketAddr::from(([127, 0, 0, 1], 9))), Err(GantryError::Closed)));
}

#[test]
fn test_send_to_host_resolves_per_packet() {
    let (_ra, rx_a, a, _) = bound("a");
    let (_rb, rx_b, b, addr_b) = bound("b");
    b.begin_receiving().unwrap();

    a.send_to_host(&b"by name"[..], "localhost", addr_b.port(), Some(Duration::from_secs(5)), 1);
    match next_dg(&rx_a) {
        Dg::Sent(1, dest) => assert_eq!(dest, addr_b),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(expect_received(&rx_b).0, b"by name");
    assert!(!a.is_connected());
}

#[test]
fn test_unbound_sender_opens_descriptor_on_demand() {
    let (rec, rx_a) = DatagramRecorder::new();
    let a = rec.socket("implicit");
    let (_rb, rx_b, b, addr_b) = bound("b");
    b.begin_receiving().unwrap();

    a.send_to(&b"implicit"[..], addr_b, None, 1);
    assert!(matches!(next_dg(&rx_a), Dg::Sent(1, _)));
    let (_, from, _) = expect_received(&rx_b);
    assert_eq!(a.local_addr_v4().map(|addr| addr.port()), Some(from.port()));
    assert_eq!(a.state(), DatagramState::Bound);
}

#[test]
fn test_empty_send_is_ignored() {
    let (_ra, rx_a, a, _) = bound("a");
    let (_rb, _rx_b, _b, addr_b) = bound("b");
    a.send_to(Bytes::new(), addr_b, None, 1);
    a.send_to(&b"real"[..], addr_b, None, 2);
    assert!(matches!(next_dg(&rx_a), Dg::Sent(2, _)));
}
