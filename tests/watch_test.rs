//! Readiness Watch Tests
//!
//! Covers:
//! - Read watches firing on incoming data
//! - Callback-driven and explicit removal
//! - Watch teardown on close

use mailnet::{Condition, EngineConfig, SocketEngine};
use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn engine() -> SocketEngine {
    SocketEngine::new(EngineConfig {
        settle_delay_ms: 0,
        watch_quantum_ms: 10,
        ..EngineConfig::default()
    })
}

#[tokio::test]
async fn test_read_watch_fires_on_data() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine();
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = engine
        .add_watch(&mut conn, Condition::READ, move |cond| {
            let _ = tx.send(cond);
            false
        })
        .unwrap();
    assert_eq!(conn.watch(), Some(id));

    // Nothing to read yet.
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    peer.write_all(b"* OK IMAP4rev1 ready\r\n").unwrap();
    let fired = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(fired.contains(Condition::READ));

    // Returning false removed the watch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.watch_count(), 0);

    let line = conn.get_line_alloc().unwrap();
    assert_eq!(line, b"* OK IMAP4rev1 ready\r\n");
}

#[tokio::test]
async fn test_buffered_data_wakes_read_watch() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine();
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    peer.write_all(b"line one\r\nline two\r\n").unwrap();
    // Pulls both lines off the socket; the second stays buffered.
    assert_eq!(conn.get_line_alloc().unwrap(), b"line one\r\n");
    assert!(conn.has_read_data());

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .add_watch(&mut conn, Condition::READ, move |cond| {
            let _ = tx.send(cond);
            false
        })
        .unwrap();
    let fired = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(fired, Condition::READ);
}

#[tokio::test]
async fn test_remove_watch_stops_callbacks() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine();
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    // An idle socket is always writable.
    let id = engine
        .add_watch(&mut conn, Condition::WRITE, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(count.load(Ordering::SeqCst) > 0);

    assert!(engine.remove_watch(id));
    let after = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), after);
    assert!(!engine.remove_watch(id));
    assert_eq!(engine.watch_count(), 0);
}

#[tokio::test]
async fn test_close_removes_watch() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine();
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();

    engine
        .add_watch(&mut conn, Condition::READ, |_| true)
        .unwrap();
    // A second watch replaces the first.
    engine
        .add_watch(&mut conn, Condition::READ, |_| true)
        .unwrap();
    assert_eq!(engine.watch_count(), 1);

    conn.close();
    assert_eq!(engine.watch_count(), 0);
}

#[tokio::test]
async fn test_clear_watch_on_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine();
    let mut conn = engine.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();

    engine.add_watch(&mut conn, Condition::READ, |_| true).unwrap();
    assert!(engine.clear_watch(&mut conn));
    assert_eq!(conn.watch(), None);
    assert_eq!(engine.watch_count(), 0);
    assert!(!engine.clear_watch(&mut conn));
}
