//! Cancellation leak checks.
//!
//! Kept in its own binary so no other test opens descriptors while the
//! descriptor table is being counted.

#![cfg(target_os = "linux")]

use mailnet::{EngineConfig, SocketEngine};
use std::net::TcpListener;
use std::time::Duration;

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[tokio::test]
async fn test_cancel_releases_descriptors_and_children() {
    let engine = SocketEngine::new(EngineConfig {
        settle_delay_ms: 0,
        ..EngineConfig::default()
    });
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let before = open_fds();

    // Cancelled while the child is resolving.
    let id = engine.connect_async("127.0.0.1", port, |_| {}).unwrap();
    let pid = engine.async_resolver_pid(id).unwrap();
    assert!(engine.cancel_async(id));

    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) }, -1);
    assert_eq!(open_fds(), before);

    // Cancelled while a standalone resolve is running.
    let id = engine.resolve_async("localhost", port, |_| {}).unwrap();
    let pid = engine.resolve_pid(id).unwrap();
    assert!(engine.cancel_resolve(id));
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) }, -1);
    assert_eq!(open_fds(), before);

    // Cancelled with a connect attempt in flight, if this host lets one hang.
    let id = engine.connect_async("192.0.2.1", 25, |_| {}).unwrap();
    for _ in 0..100 {
        if engine.async_resolver_pid(id).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if engine.pending_connects() == 1 {
        assert!(engine.cancel_async(id));
    }
    assert_eq!(engine.pending_connects(), 0);
    assert_eq!(open_fds(), before);
    assert_eq!(engine.watch_count(), 0);
    assert!(engine.live_connections().is_empty());
}
