//! DNS Module Tests
//!
//! Covers:
//! - `GaiResolver` literal bypass and mode shapes
//! - Forked `ResolveJob` via `SocketEngine::resolve_async`
//! - Resolver pipe framing round-trips

use mailnet::dns::framing::{self, Frame, FrameDecoder};
use mailnet::{AddressCandidate, AddressFamily, EngineConfig, NetError, ResolverMode, SocketEngine};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

#[test]
fn test_literal_resolves_without_lookup() {
    let engine = SocketEngine::default();
    let candidates = engine.resolve("127.0.0.1", 4190).unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].family(), AddressFamily::Inet);
    assert_eq!(
        candidates[0].socket_addr(),
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4190))
    );
    assert_eq!(engine.resolv_conf().reload_count(), 0);
}

#[test]
fn test_legacy_mode_returns_one_address() {
    let engine = SocketEngine::new(EngineConfig {
        resolver_mode: ResolverMode::Legacy,
        ..EngineConfig::default()
    });
    let candidates = engine.resolve("localhost", 25).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].family(), AddressFamily::Inet);
}

#[test]
fn test_unknown_host() {
    let err = SocketEngine::default().resolve("nonexistent.invalid", 25).unwrap_err();
    assert!(matches!(err, NetError::LookupFailed { .. }));
}

#[tokio::test]
async fn test_resolve_async_matches_sync() {
    let engine = SocketEngine::default();
    let expected = engine.resolve("localhost", 993).unwrap();

    let (tx, rx) = oneshot::channel();
    let id = engine
        .resolve_async("localhost", 993, move |candidates| {
            let _ = tx.send(candidates);
        })
        .unwrap();
    let candidates = timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();

    assert_eq!(candidates, expected);
    assert_eq!(engine.pending_resolves(), 0);
    assert!(!engine.cancel_resolve(id));
}

#[tokio::test]
async fn test_resolve_async_failure_is_empty() {
    let engine = SocketEngine::default();
    let (tx, rx) = oneshot::channel();
    engine
        .resolve_async("nonexistent.invalid", 80, move |candidates| {
            let _ = tx.send(candidates);
        })
        .unwrap();

    let candidates = timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();
    assert!(candidates.is_empty());
}

#[test]
fn test_resolve_async_needs_runtime() {
    let err = SocketEngine::default()
        .resolve_async("localhost", 25, |_| {})
        .unwrap_err();
    assert!(matches!(err, NetError::Io(_)));
}

#[test]
fn test_framing_round_trip_many() {
    let originals: Vec<AddressCandidate> = ["203.0.113.5:143", "[2001:db8::25]:143", "198.51.100.9:143"]
        .iter()
        .map(|s| AddressCandidate::from_socket_addr(s.parse().unwrap()))
        .collect();

    let mut wire = Vec::new();
    for candidate in &originals {
        framing::encode_candidate(candidate, &mut wire);
    }

    // Split the stream at an awkward boundary.
    let mut decoder = FrameDecoder::new("mail.example.com");
    let mut decoded = Vec::new();
    for chunk in wire.chunks(5) {
        decoder.feed(chunk);
        while let Some(frame) = decoder.next_frame().unwrap() {
            match frame {
                Frame::Candidate(candidate) => decoded.push(candidate),
                Frame::Failure => panic!("unexpected failure marker"),
            }
        }
    }
    assert_eq!(decoded, originals);
}

#[test]
fn test_framing_failure_marker() {
    let mut wire = Vec::new();
    framing::encode_failure(&mut wire);
    assert_eq!(wire.len(), framing::HEADER_LEN);
    assert!(framing::decode_all("nonexistent.invalid", &wire).unwrap().is_empty());
}
