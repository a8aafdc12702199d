//! Resolve and connect with one overall deadline, blocking the caller.

use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::{AddressCandidate, GaiResolver};
use crate::socket::connection::{ConnState, Connection};
use crate::socket::readiness::{poll_fd, Condition};
use crate::socket::registry::EngineShared;

#[derive(Debug, Clone)]
pub struct BlockingConnector {
    resolver: GaiResolver,
    shared: Arc<EngineShared>,
}

impl BlockingConnector {
    pub fn new(resolver: GaiResolver, shared: Arc<EngineShared>) -> Self {
        Self { resolver, shared }
    }

    pub fn resolver(&self) -> &GaiResolver {
        &self.resolver
    }

    /// Connect to `host:port`, trying candidates in resolver order until one
    /// succeeds or `timeout` runs out.
    ///
    /// The returned connection is in blocking mode and registered as live.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Connection, NetError> {
        // `None` when the timeout is too large to represent: no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut conn = Connection::new(host, port, self.shared.clone());

        let candidates = match self.resolver.resolve(host, port) {
            Ok(candidates) => candidates,
            Err(e) => {
                conn.set_state(ConnState::LookupFailed);
                return Err(e);
            }
        };
        conn.set_state(ConnState::LookupSucceeded);

        let remaining = || match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => timeout,
        };
        let mut last_err = None;
        let mut timed_out = false;
        for candidate in &candidates {
            let remaining = remaining();
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            tracing::debug!(host = %host, port, addr = %candidate, "connect attempt");
            match connect_with_timeout(candidate, remaining) {
                Ok(stream) => {
                    conn.establish(stream)?;
                    self.settle();
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::debug!(host = %host, addr = %candidate, error = %e, "connect attempt failed");
                    timed_out |= e.kind() == io::ErrorKind::TimedOut;
                    last_err = Some(e);
                }
            }
        }

        conn.set_state(ConnState::Failed);
        Err(final_error(last_err, timed_out, remaining().is_zero())).connect_context(host, port)
    }

    fn settle(&self) {
        let delay = self.shared.config().settle_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Non-blocking connect to one candidate, waiting up to `timeout` for it
/// to complete. The returned stream is back in blocking mode.
pub(crate) fn connect_with_timeout(candidate: &AddressCandidate, timeout: Duration) -> io::Result<TcpStream> {
    let addr = candidate
        .sock_addr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unsupported address"))?;
    let socket = candidate.open_socket()?;
    socket.set_nonblocking(true)?;

    match socket.connect(&addr) {
        Ok(()) => {}
        Err(e) if is_in_progress(&e) => {
            let ready = poll_fd(socket.as_raw_fd(), Condition::WRITE, Some(timeout))?;
            if ready.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
            if let Some(err) = socket.take_error()? {
                return Err(err);
            }
        }
        Err(e) => return Err(e),
    }

    socket.set_nonblocking(false)?;
    Ok(socket.into())
}

/// The error that ends a failed candidate loop. A timeout on any candidate
/// wins once the deadline is gone, even if a later one was refused outright.
fn final_error(last_err: Option<io::Error>, timed_out: bool, expired: bool) -> io::Error {
    if timed_out && expired {
        return io::Error::from(io::ErrorKind::TimedOut);
    }
    last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
}

pub(crate) fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::config::EngineConfig;
    use crate::dns::ResolvConfWatcher;
    use std::net::TcpListener;

    fn connector(config: EngineConfig) -> (BlockingConnector, Arc<EngineShared>) {
        let shared = Arc::new(EngineShared::new(config.clone()));
        let resolver = GaiResolver::new(
            config.resolver_mode,
            Arc::new(ResolvConfWatcher::new(&config.resolv_conf)),
        );
        (BlockingConnector::new(resolver, shared.clone()), shared)
    }

    fn no_settle() -> EngineConfig {
        EngineConfig {
            settle_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_connect_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (connector, shared) = connector(no_settle());

        let conn = connector.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        assert_eq!(conn.state(), ConnState::Established);
        assert!(shared.is_live(conn.raw_fd().unwrap()));
        assert_eq!(conn.peer_addr().unwrap(), listener.local_addr().unwrap());
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let (connector, shared) = connector(no_settle());

        let err = connector.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, NetError::ConnectFailed { .. }));
        assert_eq!(shared.live_count(), 0);
    }

    #[test]
    fn test_lookup_failure() {
        let (connector, _) = connector(no_settle());
        let err = connector
            .connect("nonexistent.invalid", 25, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, NetError::LookupFailed { .. }));
    }

    #[test]
    fn test_settle_delay_applied() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (connector, _) = connector(EngineConfig {
            settle_delay_ms: 150,
            ..EngineConfig::default()
        });

        let start = Instant::now();
        let _conn = connector.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_connect_unbounded_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (connector, shared) = connector(no_settle());

        let conn = connector.connect("127.0.0.1", port, Duration::MAX).unwrap();
        assert_eq!(conn.state(), ConnState::Established);
        assert!(shared.is_live(conn.raw_fd().unwrap()));
    }

    #[test]
    fn test_zero_budget_times_out() {
        let refused = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let (connector, shared) = connector(no_settle());

        let err = connector.connect("127.0.0.1", refused, Duration::ZERO).unwrap_err();
        assert!(matches!(err, NetError::ConnectTimedOut { .. }), "got {:?}", err);
        assert_eq!(shared.live_count(), 0);
    }

    #[test]
    fn test_timeout_outranks_later_refusal() {
        let refused = || Some(io::Error::from(io::ErrorKind::ConnectionRefused));

        let err = final_error(refused(), true, true);
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        let err = Err::<(), _>(err).connect_context("mail.example.com", 25).unwrap_err();
        assert!(matches!(err, NetError::ConnectTimedOut { port: 25, .. }));

        // Budget left over: the last candidate's own error stands.
        assert_eq!(final_error(refused(), true, false).kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(final_error(refused(), false, true).kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(final_error(None, false, false).kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[test]
    fn test_connected_stream_is_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let cand = AddressCandidate::from_socket_addr(listener.local_addr().unwrap());
        let stream = connect_with_timeout(&cand, Duration::from_secs(5)).unwrap();

        // SAFETY: F_GETFL on a valid descriptor.
        let flags = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
    }
}
