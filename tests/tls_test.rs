//! TLS Upgrade Tests
//!
//! Covers:
//! - STARTTLS-style upgrade of an established connection
//! - Readiness reporting data buffered inside the TLS layer
//! - `TlsConfig` builder application

use boring::asn1::Asn1Time;
use boring::ec::{EcGroup, EcKey};
use boring::hash::MessageDigest;
use boring::nid::Nid;
use boring::pkey::{PKey, Private};
use boring::ssl::{SslAcceptor, SslConnector, SslMethod, SslVersion};
use boring::x509::{X509NameBuilder, X509};
use mailnet::{Condition, EngineConfig, NetError, SocketEngine, TlsConfig};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

fn self_signed() -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

fn acceptor() -> SslAcceptor {
    let (cert, key) = self_signed();
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    builder.set_private_key(&key).unwrap();
    builder.set_certificate(&cert).unwrap();
    builder.check_private_key().unwrap();
    builder.build()
}

#[test]
fn test_starttls_upgrade() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = acceptor();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"* OK ready\r\n").unwrap();

        let mut command = String::new();
        BufReader::new(stream.try_clone().unwrap()).read_line(&mut command).unwrap();
        assert_eq!(command, "a1 STARTTLS\r\n");
        stream.write_all(b"a1 OK begin TLS\r\n").unwrap();

        let mut tls = acceptor.accept(stream).unwrap();
        // Both lines go out in one record.
        tls.write_all(b"* CAPABILITY IMAP4rev1\r\na2 OK done\r\n").unwrap();

        let mut buf = [0u8; 11];
        tls.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"a3 LOGOUT\r\n");
        let _ = tls.shutdown();
    });

    let engine = SocketEngine::new(EngineConfig {
        settle_delay_ms: 0,
        io_timeout_secs: 10,
        ..EngineConfig::default()
    });
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    let fd = conn.raw_fd().unwrap();

    assert_eq!(conn.get_line_alloc().unwrap(), b"* OK ready\r\n");
    conn.puts("a1 STARTTLS").unwrap();
    assert_eq!(conn.get_line_alloc().unwrap(), b"a1 OK begin TLS\r\n");

    conn.start_tls(&TlsConfig::insecure()).unwrap();
    assert!(conn.is_tls());
    assert_eq!(conn.raw_fd(), Some(fd));
    assert!(engine.is_live(fd));

    // A short read leaves the rest of the record decrypted inside TLS.
    let mut head = [0u8; 2];
    assert_eq!(conn.read(&mut head).unwrap(), 2);
    assert_eq!(&head, b"* ");
    assert!(conn.has_read_data());
    assert!(conn.readiness_source().unwrap().is_ready(Condition::READ));

    assert_eq!(conn.get_line_alloc().unwrap(), b"CAPABILITY IMAP4rev1\r\n");
    assert_eq!(conn.get_line_alloc().unwrap(), b"a2 OK done\r\n");

    conn.write_all(b"a3 LOGOUT\r\n").unwrap();
    server.join().unwrap();
    conn.close();
    assert!(!engine.is_live(fd));
}

#[test]
fn test_start_tls_twice_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = acceptor();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut tls = acceptor.accept(stream).unwrap();
        let mut buf = [0u8; 1];
        let _ = tls.read(&mut buf);
    });

    let engine = SocketEngine::new(EngineConfig {
        settle_delay_ms: 0,
        io_timeout_secs: 10,
        ..EngineConfig::default()
    });
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    conn.start_tls(&TlsConfig::insecure()).unwrap();

    let err = conn.start_tls(&TlsConfig::insecure()).unwrap_err();
    assert!(matches!(err, NetError::Tls(_)));
    assert!(conn.is_tls());

    conn.close();
    server.join().unwrap();
}

#[test]
fn test_verification_rejects_self_signed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = acceptor();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let _ = acceptor.accept(stream);
    });

    let engine = SocketEngine::new(EngineConfig {
        settle_delay_ms: 0,
        io_timeout_secs: 10,
        ..EngineConfig::default()
    });
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    let fd = conn.raw_fd().unwrap();

    let err = conn.start_tls(&TlsConfig::default()).unwrap_err();
    assert!(matches!(err, NetError::Tls(_)));
    assert!(!engine.is_live(fd));
    server.join().unwrap();
}

#[test]
fn test_config_application() {
    let config = TlsConfig {
        min_version: Some(SslVersion::TLS1_3),
        alpn_protos: vec!["imap".to_string()],
        ..TlsConfig::default()
    };

    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    assert!(config.apply_to_builder(&mut builder).is_ok());
}
