//! Blocking connects run on a worker, awaited from the event loop.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::base::neterror::NetError;
use crate::socket::blocking::BlockingConnector;
use crate::socket::connection::Connection;
use crate::socket::registry::{runtime, EngineShared, RequestId};

#[derive(Debug)]
struct ThreadRequest {
    host: String,
    port: u16,
    done: Arc<AtomicBool>,
    /// 0 on success, otherwise the error's code.
    result: Arc<AtomicI32>,
    handle: JoinHandle<Result<Connection, NetError>>,
}

#[derive(Debug, Clone)]
pub struct ThreadConnector {
    blocking: BlockingConnector,
    shared: Arc<EngineShared>,
    requests: Arc<DashMap<RequestId, ThreadRequest>>,
}

impl ThreadConnector {
    pub fn new(blocking: BlockingConnector, shared: Arc<EngineShared>) -> Self {
        Self {
            blocking,
            shared,
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Run a blocking connect to `host:port` on the blocking pool.
    pub fn start(&self, host: &str, port: u16) -> Result<RequestId, NetError> {
        let handle = runtime()?;
        let id = self.shared.next_id();
        let done = Arc::new(AtomicBool::new(false));
        let result = Arc::new(AtomicI32::new(0));
        let timeout = self.shared.connect_timeout();

        let worker = {
            let blocking = self.blocking.clone();
            let host = host.to_string();
            let done = done.clone();
            let result = result.clone();
            handle.spawn_blocking(move || {
                let outcome = blocking.connect(&host, port, timeout);
                let code = outcome.as_ref().map_or_else(NetError::as_i32, |_| 0);
                result.store(code, Ordering::Release);
                done.store(true, Ordering::Release);
                outcome
            })
        };

        tracing::debug!(id, host = %host, port, "thread connect started");
        self.requests.insert(
            id,
            ThreadRequest {
                host: host.to_string(),
                port,
                done,
                result,
                handle: worker,
            },
        );
        Ok(id)
    }

    /// `None` if the id is unknown.
    pub fn is_done(&self, id: RequestId) -> Option<bool> {
        self.requests
            .get(&id)
            .map(|req| req.done.load(Ordering::Acquire))
    }

    /// Result code of a finished request: 0 or a negative error code.
    pub fn result_code(&self, id: RequestId) -> Option<i32> {
        let req = self.requests.get(&id)?;
        req.done
            .load(Ordering::Acquire)
            .then(|| req.result.load(Ordering::Acquire))
    }

    /// Wait for the worker and take its result. Other tasks keep running
    /// meanwhile. A request can be waited on once.
    pub async fn wait(&self, id: RequestId) -> Result<Connection, NetError> {
        let (_, request) = self
            .requests
            .remove(&id)
            .ok_or(NetError::RequestNotFound(id))?;
        match request.handle.await {
            Ok(outcome) => {
                tracing::debug!(id, host = %request.host, port = request.port, ok = outcome.is_ok(), "thread connect joined");
                outcome
            }
            Err(e) if e.is_cancelled() => Err(NetError::Cancelled),
            Err(e) => {
                tracing::warn!(id, error = %e, "thread connect worker panicked");
                Err(NetError::Unknown(request.result.load(Ordering::Acquire)))
            }
        }
    }

    /// Forget a request. The worker cannot be interrupted; its connection is
    /// closed when it finishes.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.requests.remove(&id) {
            Some((_, request)) => {
                tracing::debug!(id, host = %request.host, "thread connect detached");
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }
}
