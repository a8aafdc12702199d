//! The engine context.
//!
//! [`SocketEngine`] owns every registry the connectors share: live
//! connections, watches, and the pending async, resolve and thread
//! requests. It is cheap to clone; clones share the same state.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailnet::{EngineConfig, SocketEngine};
//! use std::time::Duration;
//!
//! let engine = SocketEngine::new(EngineConfig::default());
//! let mut conn = engine.connect("imap.example.com", 143, Duration::from_secs(30))?;
//! let greeting = conn.get_line_alloc()?;
//! conn.puts("a1 CAPABILITY")?;
//! ```

use dashmap::DashMap;
use std::future::poll_fn;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::base::config::EngineConfig;
use crate::base::neterror::NetError;
use crate::dns::{AddressCandidate, GaiResolver, ResolvConfWatcher, ResolveJob};
use crate::socket::blocking::BlockingConnector;
use crate::socket::connectjob::AsyncConnector;
use crate::socket::connection::Connection;
use crate::socket::readiness::Condition;
use crate::socket::registry::{runtime, EngineShared, LiveConnection, RequestId, WatchId};
use crate::socket::thread::ThreadConnector;
use crate::socket::watch;

struct PendingResolve {
    job: Arc<Mutex<ResolveJob>>,
    abort: Option<AbortHandle>,
}

fn lock_job(job: &Mutex<ResolveJob>) -> MutexGuard<'_, ResolveJob> {
    match job.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct EngineInner {
    shared: Arc<EngineShared>,
    conf: Arc<ResolvConfWatcher>,
    blocking: BlockingConnector,
    connects: AsyncConnector,
    threads: ThreadConnector,
    resolves: Arc<DashMap<RequestId, PendingResolve>>,
}

#[derive(Clone)]
pub struct SocketEngine {
    inner: Arc<EngineInner>,
}

impl SocketEngine {
    pub fn new(config: EngineConfig) -> Self {
        let conf = Arc::new(ResolvConfWatcher::new(&config.resolv_conf));
        let mode = config.resolver_mode;
        let shared = Arc::new(EngineShared::new(config));
        let blocking = BlockingConnector::new(GaiResolver::new(mode, conf.clone()), shared.clone());

        Self {
            inner: Arc::new(EngineInner {
                connects: AsyncConnector::new(shared.clone(), conf.clone(), mode),
                threads: ThreadConnector::new(blocking.clone(), shared.clone()),
                resolves: Arc::new(DashMap::new()),
                blocking,
                conf,
                shared,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.shared.config()
    }

    /// Bound on every later blocking-style read/write wait. Zero waits forever.
    pub fn set_io_timeout(&self, timeout: Duration) {
        self.inner.shared.set_io_timeout(timeout);
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.inner.shared.io_timeout()
    }

    pub fn resolv_conf(&self) -> &ResolvConfWatcher {
        &self.inner.conf
    }

    /// Synchronous resolution with the engine's resolver mode.
    pub fn resolve(&self, host: &str, port: u16) -> Result<Vec<AddressCandidate>, NetError> {
        self.inner.blocking.resolver().resolve(host, port)
    }

    /// Blocking connect with an overall deadline.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Connection, NetError> {
        self.inner.blocking.connect(host, port, timeout)
    }

    /// Start an asynchronous connect. `on_done` receives the connection or
    /// the error once, on a runtime thread.
    pub fn connect_async<F>(&self, host: &str, port: u16, on_done: F) -> Result<RequestId, NetError>
    where
        F: FnOnce(Result<Connection, NetError>) + Send + 'static,
    {
        self.inner.connects.start(host, port, on_done)
    }

    /// Cancel an asynchronous connect. False if unknown or already finished.
    pub fn cancel_async(&self, id: RequestId) -> bool {
        self.inner.connects.cancel(id)
    }

    /// Pid of the resolver child while the request is still resolving.
    pub fn async_resolver_pid(&self, id: RequestId) -> Option<libc::pid_t> {
        self.inner.connects.resolver_pid(id)
    }

    /// Run a blocking connect on a worker thread.
    pub fn connect_on_thread(&self, host: &str, port: u16) -> Result<RequestId, NetError> {
        self.inner.threads.start(host, port)
    }

    pub fn is_thread_done(&self, id: RequestId) -> Option<bool> {
        self.inner.threads.is_done(id)
    }

    pub fn thread_result_code(&self, id: RequestId) -> Option<i32> {
        self.inner.threads.result_code(id)
    }

    /// Await a thread request. Fails with `RequestNotFound` on a second call.
    pub async fn wait_thread(&self, id: RequestId) -> Result<Connection, NetError> {
        self.inner.threads.wait(id).await
    }

    pub fn cancel_thread(&self, id: RequestId) -> bool {
        self.inner.threads.cancel(id)
    }

    /// Resolve in a child process. `on_done` receives the candidates, empty
    /// on failure.
    pub fn resolve_async<F>(&self, host: &str, port: u16, on_done: F) -> Result<RequestId, NetError>
    where
        F: FnOnce(Vec<AddressCandidate>) + Send + 'static,
    {
        let handle = runtime()?;
        let job = ResolveJob::spawn(host, port, self.config().resolver_mode, &self.inner.conf)?;
        let id = self.inner.shared.next_id();
        let job = Arc::new(Mutex::new(job));
        self.inner.resolves.insert(
            id,
            PendingResolve {
                job: job.clone(),
                abort: None,
            },
        );

        let resolves = self.inner.resolves.clone();
        let task = handle.spawn(async move {
            let candidates = poll_fn(|cx| lock_job(&job).poll_complete(cx)).await;
            if resolves.remove(&id).is_some() {
                on_done(candidates);
            }
        });
        match self.inner.resolves.get_mut(&id) {
            Some(mut entry) => entry.abort = Some(task.abort_handle()),
            None => drop(task),
        }
        Ok(id)
    }

    /// Kill and reap the resolver child of a pending resolve.
    pub fn cancel_resolve(&self, id: RequestId) -> bool {
        let Some((_, pending)) = self.inner.resolves.remove(&id) else {
            return false;
        };
        if let Some(abort) = pending.abort {
            abort.abort();
        }
        lock_job(&pending.job).cancel();
        tracing::debug!(id, "async resolve cancelled");
        true
    }

    pub fn resolve_pid(&self, id: RequestId) -> Option<libc::pid_t> {
        let entry = self.inner.resolves.get(&id)?;
        let pid = lock_job(&entry.job).child_pid();
        pid
    }

    /// Watch `conn` for `cond`, replacing any earlier watch on it. Return
    /// `false` from the callback to stop watching.
    pub fn add_watch<F>(&self, conn: &mut Connection, cond: Condition, callback: F) -> Result<WatchId, NetError>
    where
        F: FnMut(Condition) -> bool + Send + 'static,
    {
        watch::add_watch(conn, cond, callback)
    }

    pub fn remove_watch(&self, id: WatchId) -> bool {
        self.inner.shared.remove_watch(id)
    }

    /// Remove whatever watch `conn` has registered.
    pub fn clear_watch(&self, conn: &mut Connection) -> bool {
        watch::clear_watch(conn)
    }

    /// Close a connection: TLS shutdown, watch removal, deregistration.
    pub fn close(&self, conn: Connection) {
        conn.close();
    }

    pub fn live_connections(&self) -> Vec<LiveConnection> {
        self.inner.shared.live_connections()
    }

    pub fn is_live(&self, fd: RawFd) -> bool {
        self.inner.shared.is_live(fd)
    }

    pub fn pending_connects(&self) -> usize {
        self.inner.connects.pending()
    }

    pub fn pending_resolves(&self) -> usize {
        self.inner.resolves.len()
    }

    pub fn pending_threads(&self) -> usize {
        self.inner.threads.pending()
    }

    pub fn watch_count(&self) -> usize {
        self.inner.shared.watch_count()
    }
}

impl Default for SocketEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for SocketEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEngine")
            .field("live", &self.inner.shared.live_count())
            .field("pending_connects", &self.pending_connects())
            .field("pending_resolves", &self.pending_resolves())
            .field("pending_threads", &self.pending_threads())
            .field("watches", &self.watch_count())
            .finish()
    }
}
