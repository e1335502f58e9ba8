//! Integration tests for socket options and the dual-stack policy they produce

use gantry_core::addr::{Family, FamilyPreference, LocalBinding};
use gantry_core::options::{SocketOptions, DEFAULT_MAX_RECEIVE, MAX_RECEIVE_IPV4};
use std::net::SocketAddr;
use std::time::Duration;

#[test]
fn test_builder_chain() {
    let opts = SocketOptions::new()
        .with_preference(FamilyPreference::Neutral)
        .with_read_chunk_size(0)
        .with_max_prebuffer(1024)
        .with_close_on_timeout(true)
        .with_tcp_nodelay(true)
        .with_tcp_keepalive(Some(Duration::from_secs(15)))
        .with_reuse_address(false);

    assert_eq!(opts.preference, FamilyPreference::Neutral);
    assert_eq!(opts.read_chunk_size, 1);
    assert_eq!(opts.max_prebuffer, 1024);
    assert!(opts.close_on_timeout);
    assert!(opts.tcp_nodelay);
    assert_eq!(opts.tcp_keepalive, Some(Duration::from_secs(15)));
    assert!(!opts.reuse_address);
}

#[test]
fn test_default_receive_sizes() {
    let opts = SocketOptions::default();
    assert_eq!(opts.max_receive_ipv4, DEFAULT_MAX_RECEIVE);
    assert_eq!(opts.max_receive_ipv6, DEFAULT_MAX_RECEIVE);

    let opts = opts.with_max_receive_ipv4(70_000);
    assert_eq!(opts.max_receive_ipv4, MAX_RECEIVE_IPV4);
}

#[test]
fn test_policy_follows_options() {
    let opts = SocketOptions::new().with_ipv4(false);
    let policy = opts.family_policy();
    assert!(!policy.allows(Family::V4));
    assert!(policy.allows(Family::V6));

    let candidates: Vec<SocketAddr> = vec!["127.0.0.1:1".parse().unwrap(), "[::1]:1".parse().unwrap()];
    let ordered = policy.order(candidates);
    assert_eq!(ordered.len(), 1);
    assert!(ordered[0].is_ipv6());
}

#[test]
fn test_binding_respects_disabled_family() {
    let policy = SocketOptions::new().with_ipv6(false).family_policy();
    let binding = LocalBinding::for_interface(Some("loopback"), 4000, &policy).unwrap();
    assert_eq!(binding.v4, Some("127.0.0.1:4000".parse().unwrap()));
    assert_eq!(binding.v6, None);

    assert!(LocalBinding::for_interface(Some("::1"), 4000, &policy).is_err());

    let none = SocketOptions::new().with_ipv4(false).with_ipv6(false).family_policy();
    assert!(LocalBinding::for_interface(None, 0, &none).is_err());
}
