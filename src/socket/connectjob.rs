//! Asynchronous resolve-then-connect.
//!
//! Each request walks [`ConnectMachine`]: resolve in a child process, then
//! try candidates strictly in resolver order with at most one non-blocking
//! connect in flight. The machine holds no I/O; the driver task feeds it
//! events (resolution done, attempt succeeded, attempt failed) and performs
//! the [`Step`] it asks for.
//!
//! Requests live in a registry keyed by id. The driver only holds the
//! request lock while polling, so [`AsyncConnector::cancel`] can release
//! every resource synchronously from any thread.

use dashmap::DashMap;
use socket2::Socket;
use std::future::poll_fn;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::AbortHandle;

use crate::base::config::ResolverMode;
use crate::base::neterror::NetError;
use crate::dns::{AddressCandidate, ResolvConfWatcher, ResolveJob};
use crate::socket::blocking::is_in_progress;
use crate::socket::connection::{ConnState, Connection};
use crate::socket::registry::{runtime, EngineShared, RequestId};

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    /// `cursor` is the next candidate to try.
    Attempting { cursor: usize },
    Done,
}

/// What the driver must do next.
#[derive(Debug, Clone)]
pub enum Step {
    /// Start a connect to candidate `idx`.
    Attempt(usize),
    /// Report failure and release the request.
    Fail(NetError),
    /// The in-flight attempt connected; report success.
    Finish,
}

#[derive(Debug)]
pub struct ConnectMachine {
    host: String,
    port: u16,
    phase: Phase,
    candidates: Vec<AddressCandidate>,
    in_flight: bool,
    attempts: usize,
}

impl ConnectMachine {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            phase: Phase::Resolving,
            candidates: Vec::new(),
            in_flight: false,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Connect attempts started so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn candidate(&self, idx: usize) -> Option<&AddressCandidate> {
        self.candidates.get(idx)
    }

    pub fn on_resolved(&mut self, candidates: Vec<AddressCandidate>) -> Step {
        if self.phase != Phase::Resolving {
            return self.fail_unexpected("resolution result");
        }
        if candidates.is_empty() {
            self.phase = Phase::Done;
            return Step::Fail(NetError::LookupFailed {
                host: self.host.clone(),
                reason: "no usable address".to_string(),
            });
        }
        self.candidates = candidates;
        self.phase = Phase::Attempting { cursor: 0 };
        self.next_attempt()
    }

    pub fn on_attempt_failed(&mut self) -> Step {
        if !self.in_flight {
            return self.fail_unexpected("attempt failure");
        }
        self.in_flight = false;
        self.next_attempt()
    }

    pub fn on_attempt_succeeded(&mut self) -> Step {
        if !self.in_flight {
            return self.fail_unexpected("attempt success");
        }
        self.in_flight = false;
        self.phase = Phase::Done;
        self.candidates.clear();
        Step::Finish
    }

    pub fn cancel(&mut self) {
        self.phase = Phase::Done;
        self.in_flight = false;
        self.candidates.clear();
    }

    fn next_attempt(&mut self) -> Step {
        let Phase::Attempting { cursor } = self.phase else {
            return self.fail_unexpected("attempt");
        };
        if cursor >= self.candidates.len() {
            self.phase = Phase::Done;
            self.candidates.clear();
            return Step::Fail(NetError::ConnectFailed {
                host: self.host.clone(),
                port: self.port,
            });
        }
        self.phase = Phase::Attempting { cursor: cursor + 1 };
        self.in_flight = true;
        self.attempts += 1;
        Step::Attempt(cursor)
    }

    fn fail_unexpected(&mut self, event: &str) -> Step {
        tracing::warn!(host = %self.host, phase = ?self.phase, event, "unexpected connect event");
        self.cancel();
        Step::Fail(NetError::ConnectFailed {
            host: self.host.clone(),
            port: self.port,
        })
    }
}

pub type ConnectCallback = Box<dyn FnOnce(Result<Connection, NetError>) + Send>;

struct ConnectRequest {
    machine: ConnectMachine,
    resolve: Option<ResolveJob>,
    in_flight: Option<AsyncFd<Socket>>,
    conn: Option<Connection>,
    on_done: Option<ConnectCallback>,
}

type Completion = (ConnectCallback, Result<Connection, NetError>);

impl ConnectRequest {
    /// Advance as far as possible without waiting.
    fn poll_drive(&mut self, cx: &mut Context<'_>) -> Poll<Option<Completion>> {
        loop {
            let step = match self.machine.phase() {
                Phase::Done => return Poll::Ready(None),
                Phase::Resolving => {
                    let candidates = match self.resolve.as_mut() {
                        Some(job) => ready!(job.poll_complete(cx)),
                        None => Vec::new(),
                    };
                    self.resolve = None;
                    if let Some(conn) = self.conn.as_mut() {
                        conn.set_state(if candidates.is_empty() {
                            ConnState::LookupFailed
                        } else {
                            ConnState::LookupSucceeded
                        });
                    }
                    self.machine.on_resolved(candidates)
                }
                Phase::Attempting { .. } => {
                    let Some(fd) = self.in_flight.as_ref() else {
                        // Nothing in flight: the last step already failed the attempt.
                        return Poll::Ready(self.complete(Step::Fail(NetError::NotConnected)));
                    };
                    let outcome = ready!(poll_connected(fd, cx));
                    let Some(fd) = self.in_flight.take() else {
                        return Poll::Ready(None);
                    };
                    match outcome.and_then(|()| self.attach(fd)) {
                        Ok(()) => self.machine.on_attempt_succeeded(),
                        Err(e) => {
                            tracing::debug!(host = %self.machine.host, error = %e, "connect attempt failed");
                            self.machine.on_attempt_failed()
                        }
                    }
                }
            };

            match self.run(step) {
                Some(Step::Attempt(_)) => continue,
                Some(step) => return Poll::Ready(self.complete(step)),
                None => continue,
            }
        }
    }

    /// Perform a step. Attempts that fail immediately move on to the next
    /// candidate here; returns the step that ended the loop.
    fn run(&mut self, mut step: Step) -> Option<Step> {
        while let Step::Attempt(idx) = step {
            let candidate = self.machine.candidate(idx)?.clone();
            tracing::debug!(host = %self.machine.host, addr = %candidate, "async connect attempt");
            match start_attempt(&candidate) {
                Ok(fd) => {
                    self.in_flight = Some(fd);
                    return Some(Step::Attempt(idx));
                }
                Err(e) => {
                    tracing::debug!(addr = %candidate, error = %e, "connect attempt failed immediately");
                    step = self.machine.on_attempt_failed();
                }
            }
        }
        Some(step)
    }

    fn attach(&mut self, fd: AsyncFd<Socket>) -> io::Result<()> {
        let socket = fd.into_inner();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        conn.establish(socket.into()).map_err(io::Error::from)
    }

    fn complete(&mut self, step: Step) -> Option<Completion> {
        let on_done = self.on_done.take()?;
        let result = match step {
            Step::Finish => self.conn.take().ok_or(NetError::NotConnected),
            Step::Fail(e) => {
                if let Some(mut conn) = self.conn.take() {
                    if conn.state() != ConnState::LookupFailed {
                        conn.set_state(ConnState::Failed);
                    }
                }
                Err(e)
            }
            Step::Attempt(_) => Err(NetError::ConnectFailed {
                host: self.machine.host.clone(),
                port: self.machine.port,
            }),
        };
        Some((on_done, result))
    }

    /// Release everything. Safe to call repeatedly.
    fn release(&mut self) {
        self.machine.cancel();
        if let Some(mut job) = self.resolve.take() {
            job.cancel();
        }
        self.in_flight = None;
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.on_done = None;
    }
}

fn start_attempt(candidate: &AddressCandidate) -> io::Result<AsyncFd<Socket>> {
    let addr = candidate
        .sock_addr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unsupported address"))?;
    let socket = candidate.open_socket()?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr) {
        Ok(()) => {}
        Err(e) if is_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    AsyncFd::with_interest(socket, Interest::WRITABLE)
}

/// Resolves once the in-flight connect has finished, with its outcome.
fn poll_connected(fd: &AsyncFd<Socket>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let guard = ready!(fd.poll_write_ready(cx))?;
    let readiness = guard.ready();
    if let Some(err) = fd.get_ref().take_error()? {
        return Poll::Ready(Err(err));
    }
    if readiness.is_error() || readiness.is_write_closed() {
        return Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "socket reported error or hangup",
        )));
    }
    Poll::Ready(Ok(()))
}

struct ConnectEntry {
    request: Arc<Mutex<ConnectRequest>>,
    abort: Option<AbortHandle>,
}

fn lock(request: &Mutex<ConnectRequest>) -> MutexGuard<'_, ConnectRequest> {
    match request.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registry and driver of asynchronous connect requests.
#[derive(Clone)]
pub struct AsyncConnector {
    shared: Arc<EngineShared>,
    conf: Arc<ResolvConfWatcher>,
    mode: ResolverMode,
    requests: Arc<DashMap<RequestId, ConnectEntry>>,
}

impl AsyncConnector {
    pub fn new(shared: Arc<EngineShared>, conf: Arc<ResolvConfWatcher>, mode: ResolverMode) -> Self {
        Self {
            shared,
            conf,
            mode,
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Start a request. `on_done` runs exactly once unless the request is
    /// cancelled first; the request is out of the registry by then.
    pub fn start<F>(&self, host: &str, port: u16, on_done: F) -> Result<RequestId, NetError>
    where
        F: FnOnce(Result<Connection, NetError>) + Send + 'static,
    {
        let handle = runtime()?;
        let job = ResolveJob::spawn(host, port, self.mode, &self.conf)?;
        let id = self.shared.next_id();

        let request = Arc::new(Mutex::new(ConnectRequest {
            machine: ConnectMachine::new(host, port),
            resolve: Some(job),
            in_flight: None,
            conn: Some(Connection::new(host, port, self.shared.clone())),
            on_done: Some(Box::new(on_done)),
        }));
        self.requests.insert(
            id,
            ConnectEntry {
                request: request.clone(),
                abort: None,
            },
        );
        tracing::debug!(id, host = %host, port, "async connect started");

        let requests = self.requests.clone();
        let task = handle.spawn(async move {
            let completion = poll_fn(|cx| lock(&request).poll_drive(cx)).await;
            // A concurrent cancel already took the entry and owns cleanup.
            if requests.remove(&id).is_none() {
                return;
            }
            if let Some((on_done, result)) = completion {
                tracing::debug!(id, ok = result.is_ok(), "async connect finished");
                on_done(result);
            }
        });

        match self.requests.get_mut(&id) {
            Some(mut entry) => entry.abort = Some(task.abort_handle()),
            None => drop(task),
        }
        Ok(id)
    }

    /// Cancel a pending request, releasing its child process, descriptors
    /// and connection before returning. False if the id is unknown or the
    /// request already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        let Some((_, entry)) = self.requests.remove(&id) else {
            return false;
        };
        if let Some(abort) = entry.abort {
            abort.abort();
        }
        lock(&entry.request).release();
        tracing::debug!(id, "async connect cancelled");
        true
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// Pid of the resolver child of a request still resolving.
    pub fn resolver_pid(&self, id: RequestId) -> Option<libc::pid_t> {
        let entry = self.requests.get(&id)?;
        let request = lock(&entry.request);
        let pid = request.resolve.as_ref().and_then(ResolveJob::child_pid);
        pid
    }
}
