//! TLS upgrades over loopback, using the certificates in `tests/certs`.

mod common;

use common::*;
use gantry::prelude::*;
use gantry::tls::{certs_from_pem, key_from_pem, roots_from_pem, ClientAuth};

const CA: &[u8] = include_bytes!("certs/ca.pem");
const CERT: &[u8] = include_bytes!("certs/localhost.pem");
const KEY: &[u8] = include_bytes!("certs/localhost.key");

fn server_settings() -> TlsSettings {
    TlsSettings::server(certs_from_pem(CERT).unwrap(), key_from_pem(KEY).unwrap())
        .build()
        .unwrap()
}

fn client_settings() -> TlsSettings {
    TlsSettings::client("localhost")
        .add_roots_pem(CA)
        .unwrap()
        .build()
        .unwrap()
}

fn expect_secured(rx: &flume::Receiver<Ev>) -> gantry::TlsInfo {
    match next(rx) {
        Ev::Secured(info) => info,
        other => panic!("expected secured, got {other:?}"),
    }
}

#[test]
fn test_handshake_then_echo() {
    let p = connected_pair();
    p.accepted.start_tls(server_settings()).unwrap();
    p.conn.start_tls(client_settings()).unwrap();

    let client_info = expect_secured(&p.client_rx);
    let server_info = expect_secured(&p.server_rx);
    assert!(client_info.protocol_version.is_some());
    assert!(client_info.cipher_suite.is_some());
    assert!(!client_info.peer_certificates.is_empty());
    assert!(server_info.peer_certificates.is_empty());
    assert!(p.conn.is_secure());
    assert!(p.accepted.is_secure());

    p.accepted.read_until(&b"\n"[..], None, 1);
    p.conn.write(&b"over tls\n"[..], None, 2);
    assert_eq!(expect_read(&p.server_rx, 1), b"over tls\n");
    assert!(matches!(next(&p.client_rx), Ev::Written(2)));

    p.conn.read_exact(4, None, 3);
    p.accepted.write(&b"pong"[..], None, 4);
    assert_eq!(expect_read(&p.client_rx, 3), b"pong");
}

#[test]
fn test_ops_queued_before_tls_run_in_plaintext() {
    let p = connected_pair();
    // STARTTLS: the server reads a plaintext command before upgrading
    p.accepted.read_until(&b"\r\n"[..], None, 1);
    p.accepted.start_tls(server_settings()).unwrap();
    p.accepted.read_exact(6, None, 2);

    p.conn.write(&b"STARTTLS\r\n"[..], None, 1);
    p.conn.start_tls(client_settings()).unwrap();
    p.conn.write(&b"secret"[..], None, 2);

    assert_eq!(expect_read(&p.server_rx, 1), b"STARTTLS\r\n");
    let _ = expect_secured(&p.server_rx);
    assert_eq!(expect_read(&p.server_rx, 2), b"secret");

    assert!(matches!(next(&p.client_rx), Ev::Written(1)));
    let _ = expect_secured(&p.client_rx);
    assert!(matches!(next(&p.client_rx), Ev::Written(2)));
}

#[test]
fn test_untrusted_server_closes_with_security_error() {
    let p = connected_pair();
    p.accepted.start_tls(server_settings()).unwrap();
    // no trust anchors
    let untrusting = TlsSettings::client("localhost").build().unwrap();
    p.conn.start_tls(untrusting).unwrap();

    match next(&p.client_rx) {
        Ev::Closed(Some(GantryError::Security(_))) => {}
        other => panic!("unexpected {other:?}"),
    }
    match next(&p.server_rx) {
        Ev::Closed(Some(err)) => assert!(err.is_connection_error()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!p.conn.is_secure());
}

#[test]
fn test_wrong_server_name_is_rejected() {
    let p = connected_pair();
    p.accepted.start_tls(server_settings()).unwrap();
    let settings = TlsSettings::client("example.invalid")
        .add_roots_pem(CA)
        .unwrap()
        .build()
        .unwrap();
    p.conn.start_tls(settings).unwrap();

    assert!(matches!(next(&p.client_rx), Ev::Closed(Some(GantryError::Security(_)))));
}

#[test]
fn test_mutual_tls_reports_client_certificate() {
    let p = connected_pair();
    let server = TlsSettings::server(certs_from_pem(CERT).unwrap(), key_from_pem(KEY).unwrap())
        .with_client_auth(ClientAuth::Required(roots_from_pem(CA).unwrap()))
        .build()
        .unwrap();
    let client = TlsSettings::client("localhost")
        .add_roots_pem(CA)
        .unwrap()
        .with_identity(certs_from_pem(CERT).unwrap(), key_from_pem(KEY).unwrap())
        .build()
        .unwrap();
    p.accepted.start_tls(server).unwrap();
    p.conn.start_tls(client).unwrap();

    let _ = expect_secured(&p.client_rx);
    let server_info = expect_secured(&p.server_rx);
    assert_eq!(server_info.peer_certificates.len(), 1);
    assert_eq!(p.accepted.tls_info().map(|i| i.peer_certificates.len()), Some(1));
}

#[test]
fn test_alpn_negotiated() {
    let p = connected_pair();
    let server = TlsSettings::server(certs_from_pem(CERT).unwrap(), key_from_pem(KEY).unwrap())
        .with_alpn(vec![b"gantry/1".to_vec()])
        .build()
        .unwrap();
    let client = TlsSettings::client("localhost")
        .add_roots_pem(CA)
        .unwrap()
        .with_alpn(vec![b"other".to_vec(), b"gantry/1".to_vec()])
        .build()
        .unwrap();
    p.accepted.start_tls(server).unwrap();
    p.conn.start_tls(client).unwrap();

    let info = expect_secured(&p.client_rx);
    assert_eq!(info.alpn.as_deref(), Some(&b"gantry/1"[..]));
}

#[test]
fn test_start_tls_twice_is_rejected() {
    let p = connected_pair();
    p.conn.start_tls(client_settings()).unwrap();
    assert!(matches!(p.conn.start_tls(client_settings()), Err(GantryError::Config(_))));
    assert!(matches!(p.listener.start_tls(server_settings()), Err(GantryError::Config(_))));
}

#[test]
fn test_clean_close_after_tls() {
    let p = connected_pair();
    p.accepted.start_tls(server_settings()).unwrap();
    p.conn.start_tls(client_settings()).unwrap();
    let _ = expect_secured(&p.client_rx);
    let _ = expect_secured(&p.server_rx);

    p.accepted.read_exact(1, None, 1);
    p.conn.write(&b"!"[..], None, 1);
    p.conn.close_after_writing();
    assert_eq!(expect_read(&p.server_rx, 1), b"!");
    assert!(matches!(next(&p.client_rx), Ev::Written(1)));
    assert!(matches!(next(&p.client_rx), Ev::Closed(None)));

    // close_notify with nothing buffered ends the connection
    assert!(matches!(next(&p.server_rx), Ev::Closed(Some(GantryError::PeerClosed))));
}
