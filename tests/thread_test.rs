//! Thread Connector Tests
//!
//! Covers:
//! - Blocking connect on a worker awaited from the runtime
//! - Done flag and result code
//! - Single-wait semantics and detaching

use mailnet::{ConnState, EngineConfig, NetError, SocketEngine};
use std::net::TcpListener;
use std::time::Duration;

fn engine() -> SocketEngine {
    SocketEngine::new(EngineConfig {
        settle_delay_ms: 0,
        io_timeout_secs: 5,
        ..EngineConfig::default()
    })
}

#[tokio::test]
async fn test_connect_on_thread() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine();

    let id = engine.connect_on_thread("127.0.0.1", port).unwrap();
    assert_eq!(engine.pending_threads(), 1);

    let conn = engine.wait_thread(id).await.unwrap();
    assert_eq!(conn.state(), ConnState::Established);
    assert!(engine.is_live(conn.raw_fd().unwrap()));
    assert_eq!(engine.pending_threads(), 0);

    // Joined exactly once.
    assert!(matches!(
        engine.wait_thread(id).await,
        Err(NetError::RequestNotFound(n)) if n == id
    ));
}

#[tokio::test]
async fn test_thread_result_code_on_failure() {
    let engine = engine();
    let id = engine.connect_on_thread("nonexistent.invalid", 110).unwrap();

    for _ in 0..500 {
        if engine.is_thread_done(id) == Some(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.is_thread_done(id), Some(true));
    let code = engine.thread_result_code(id).unwrap();
    assert_eq!(
        code,
        NetError::LookupFailed {
            host: String::new(),
            reason: String::new()
        }
        .as_i32()
    );

    assert!(matches!(
        engine.wait_thread(id).await,
        Err(NetError::LookupFailed { .. })
    ));
}

#[tokio::test]
async fn test_other_tasks_run_while_waiting() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = SocketEngine::new(EngineConfig {
        settle_delay_ms: 300,
        ..EngineConfig::default()
    });

    let ticker = tokio::spawn(async {
        let mut ticks = 0;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ticks += 1;
        }
        ticks
    });

    let id = engine.connect_on_thread("127.0.0.1", port).unwrap();
    engine.wait_thread(id).await.unwrap();
    assert!(ticker.is_finished());
    assert_eq!(ticker.await.unwrap(), 5);
}

#[tokio::test]
async fn test_cancel_thread_detaches() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let engine = engine();

    let id = engine.connect_on_thread("127.0.0.1", port).unwrap();
    assert!(engine.cancel_thread(id));
    assert!(!engine.cancel_thread(id));
    assert_eq!(engine.is_thread_done(id), None);

    // The detached worker's connection is closed once it finishes.
    for _ in 0..500 {
        if engine.live_connections().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.live_connections().is_empty());
}
