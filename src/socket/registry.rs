//! Engine-wide state shared by every connection.
//!
//! Holds the live-connection registry (keyed by descriptor), the watch
//! registry, the request id counter and the process-wide I/O timeout. Each
//! [`Connection`](super::connection::Connection) keeps an `Arc` to it so it
//! can deregister itself on close.

use crate::base::config::EngineConfig;
use crate::base::neterror::NetError;
use dashmap::DashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Identifier of a pending async, resolve or thread request.
pub type RequestId = u64;

/// Identifier of a readiness watch.
pub type WatchId = u64;

/// Snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveConnection {
    pub fd: RawFd,
    pub host: String,
    pub port: u16,
    pub since: Instant,
}

#[derive(Debug)]
pub(crate) struct WatchEntry {
    pub(crate) alive: Arc<AtomicBool>,
    pub(crate) abort: Option<AbortHandle>,
}

#[derive(Debug)]
pub struct EngineShared {
    config: EngineConfig,
    io_timeout_ms: AtomicU64,
    next_id: AtomicU64,
    live: DashMap<RawFd, LiveConnection>,
    watches: DashMap<WatchId, WatchEntry>,
}

impl EngineShared {
    pub fn new(config: EngineConfig) -> Self {
        let io_timeout_ms = stored_millis(config.io_timeout());
        Self {
            config,
            io_timeout_ms: AtomicU64::new(io_timeout_ms),
            next_id: AtomicU64::new(1),
            live: DashMap::new(),
            watches: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bound on blocking-style waits. `None` waits forever.
    pub fn io_timeout(&self) -> Option<Duration> {
        match self.io_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn set_io_timeout(&self, timeout: Duration) {
        let ms = stored_millis(timeout);
        self.io_timeout_ms.store(ms, Ordering::Relaxed);
        tracing::debug!(timeout_ms = ms, "I/O timeout changed");
    }

    /// Deadline for connects that take no explicit timeout. Never unbounded.
    pub fn connect_timeout(&self) -> Duration {
        self.io_timeout()
            .unwrap_or_else(|| EngineConfig::default().io_timeout())
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_live(&self, fd: RawFd, host: &str, port: u16) {
        tracing::debug!(fd, host = %host, port, "connection registered");
        self.live.insert(
            fd,
            LiveConnection {
                fd,
                host: host.to_string(),
                port,
                since: Instant::now(),
            },
        );
    }

    pub fn deregister_live(&self, fd: RawFd) -> bool {
        self.live.remove(&fd).is_some()
    }

    pub fn is_live(&self, fd: RawFd) -> bool {
        self.live.contains_key(&fd)
    }

    pub fn live_connections(&self) -> Vec<LiveConnection> {
        let mut list: Vec<_> = self.live.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|c| c.fd);
        list
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn insert_watch(&self, id: WatchId, alive: Arc<AtomicBool>) {
        self.watches.insert(id, WatchEntry { alive, abort: None });
    }

    pub(crate) fn attach_watch_task(&self, id: WatchId, abort: AbortHandle) {
        match self.watches.get_mut(&id) {
            Some(mut entry) => entry.abort = Some(abort),
            // Already finished or removed.
            None => abort.abort(),
        }
    }

    /// Stop a watch. No callback starts after this returns.
    pub fn remove_watch(&self, id: WatchId) -> bool {
        match self.watches.remove(&id) {
            Some((_, entry)) => {
                entry.alive.store(false, Ordering::Release);
                if let Some(abort) = entry.abort {
                    abort.abort();
                }
                tracing::debug!(watch = id, "watch removed");
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget_watch(&self, id: WatchId) {
        self.watches.remove(&id);
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

/// The runtime to spawn on, or an error outside of one.
pub(crate) fn runtime() -> Result<Handle, NetError> {
    Handle::try_current().map_err(|e| NetError::io(std::io::Error::other(e)))
}

/// Millisecond form of a timeout. Only `Duration::ZERO` maps to 0, which
/// means unbounded; anything shorter than a millisecond becomes 1.
fn stored_millis(timeout: Duration) -> u64 {
    if timeout.is_zero() {
        return 0;
    }
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1)
}
