//! Readiness polling for plain and TLS transports.
//!
//! A TLS session can hold decrypted application data that the descriptor no
//! longer advertises, and during renegotiation a read may first need the
//! socket to become writable (or the reverse). [`ReadinessSource`] folds both
//! cases into a single `poll(2)` so callers never branch on "is this TLS".

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A set of readiness conditions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Condition(u8);

impl Condition {
    pub const READ: Condition = Condition(0b0001);
    pub const WRITE: Condition = Condition(0b0010);
    pub const ERROR: Condition = Condition(0b0100);
    pub const HANGUP: Condition = Condition(0b1000);

    pub const fn empty() -> Self {
        Condition(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Condition) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Condition) -> bool {
        self.0 & other.0 != 0
    }

    fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Condition::READ) {
            events |= libc::POLLIN;
        }
        if self.contains(Condition::WRITE) {
            events |= libc::POLLOUT;
        }
        events
    }

    fn from_poll_events(revents: libc::c_short) -> Self {
        let mut cond = Condition::empty();
        if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
            cond |= Condition::READ;
        }
        if revents & libc::POLLOUT != 0 {
            cond |= Condition::WRITE;
        }
        if revents & libc::POLLERR != 0 {
            cond |= Condition::ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            cond |= Condition::HANGUP;
        }
        cond
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        Condition(self.0 | rhs.0)
    }
}

impl BitOrAssign for Condition {
    fn bitor_assign(&mut self, rhs: Condition) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Condition) -> Condition {
        Condition(self.0 & rhs.0)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Condition::READ, "READ"),
            (Condition::WRITE, "WRITE"),
            (Condition::ERROR, "ERROR"),
            (Condition::HANGUP, "HANGUP"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                list.entry(&format_args!("{}", name));
            }
        }
        list.finish()
    }
}

/// Transport state that readiness depends on beyond the descriptor itself.
///
/// The owning connection publishes after every I/O operation; watch tasks on
/// other threads read it without touching the connection.
#[derive(Debug, Default)]
pub struct ReadinessHints {
    buffered: AtomicUsize,
    wants_read: AtomicBool,
    wants_write: AtomicBool,
}

impl ReadinessHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, buffered: usize, wants_read: bool, wants_write: bool) {
        self.buffered.store(buffered, Ordering::Release);
        self.wants_read.store(wants_read, Ordering::Release);
        self.wants_write.store(wants_write, Ordering::Release);
    }

    pub fn clear(&self) {
        self.publish(0, false, false);
    }

    /// Bytes readable without touching the descriptor.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn wants_read(&self) -> bool {
        self.wants_read.load(Ordering::Acquire)
    }

    pub fn wants_write(&self) -> bool {
        self.wants_write.load(Ordering::Acquire)
    }
}

/// Pollable view of one connection.
#[derive(Debug, Clone)]
pub struct ReadinessSource {
    fd: RawFd,
    hints: Arc<ReadinessHints>,
}

impl ReadinessSource {
    pub fn new(fd: RawFd, hints: Arc<ReadinessHints>) -> Self {
        Self { fd, hints }
    }

    /// Source for a descriptor with no transport state on top.
    pub fn plain(fd: RawFd) -> Self {
        Self::new(fd, Arc::new(ReadinessHints::new()))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wait up to `timeout` (`None` = forever) for any of `cond`.
    ///
    /// Returns the subset of `cond` that is ready, plus `ERROR`/`HANGUP` when
    /// the descriptor reports them. An empty result means the wait timed out.
    pub fn poll(&self, cond: Condition, timeout: Option<Duration>) -> io::Result<Condition> {
        if cond.contains(Condition::READ) && self.hints.buffered() > 0 {
            return Ok(Condition::READ);
        }

        let wants_read = self.hints.wants_read();
        let wants_write = self.hints.wants_write();

        let mut events = cond & (Condition::READ | Condition::WRITE);
        if cond.contains(Condition::READ) && wants_write {
            events |= Condition::WRITE;
        }
        if cond.contains(Condition::WRITE) && wants_read {
            events |= Condition::READ;
        }

        let revents = poll_fd(self.fd, events, timeout)?;

        let mut ready = revents & (Condition::ERROR | Condition::HANGUP);
        if cond.contains(Condition::READ)
            && (revents.contains(Condition::READ) || (wants_write && revents.contains(Condition::WRITE)))
        {
            ready |= Condition::READ;
        }
        if cond.contains(Condition::WRITE)
            && (revents.contains(Condition::WRITE) || (wants_read && revents.contains(Condition::READ)))
        {
            ready |= Condition::WRITE;
        }
        tracing::trace!(fd = self.fd, ?cond, ?ready, "readiness polled");
        Ok(ready)
    }

    /// Zero-timeout check. Poll errors count as ready so the caller's next
    /// I/O call surfaces them.
    pub fn is_ready(&self, cond: Condition) -> bool {
        match self.poll(cond, Some(Duration::ZERO)) {
            Ok(ready) => ready.intersects(cond | Condition::ERROR | Condition::HANGUP),
            Err(_) => true,
        }
    }
}

/// `poll(2)` on a single descriptor, restarted on `EINTR` with the remaining
/// time. Returns an empty condition on timeout.
pub fn poll_fd(fd: RawFd, cond: Condition, timeout: Option<Duration>) -> io::Result<Condition> {
    // A timeout past what `Instant` can hold waits forever.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: cond.to_poll_events(),
            revents: 0,
        };
        let wait_ms = match deadline {
            None => -1,
            Some(deadline) => timeout_ms(deadline.saturating_duration_since(Instant::now())),
        };

        // SAFETY: pfd is a single valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, wait_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(Condition::empty());
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        return Ok(Condition::from_poll_events(pfd.revents));
    }
}

fn timeout_ms(remaining: Duration) -> libc::c_int {
    // Round up so a sub-millisecond remainder still waits instead of spinning.
    let ms = remaining.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_condition_ops() {
        let both = Condition::READ | Condition::WRITE;
        assert!(both.contains(Condition::READ));
        assert!(!both.contains(Condition::ERROR));
        assert!(both.intersects(Condition::WRITE | Condition::HANGUP));
        assert!((both & Condition::ERROR).is_empty());
        assert_eq!(format!("{:?}", both), "{READ, WRITE}");
    }

    #[test]
    fn test_poll_fd_timeout() {
        let (client, _server) = pair();
        let start = Instant::now();
        let ready = poll_fd(client.as_raw_fd(), Condition::READ, Some(Duration::from_millis(50))).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_poll_fd_unbounded_timeout() {
        let (client, _server) = pair();
        let ready = poll_fd(client.as_raw_fd(), Condition::WRITE, Some(Duration::MAX)).unwrap();
        assert!(ready.contains(Condition::WRITE));
        assert_eq!(timeout_ms(Duration::MAX), libc::c_int::MAX);
        assert_eq!(timeout_ms(Duration::from_micros(1)), 1);
    }

    #[test]
    fn test_poll_fd_readable() {
        let (client, mut server) = pair();
        server.write_all(b"* OK\r\n").unwrap();
        let ready = poll_fd(client.as_raw_fd(), Condition::READ, Some(Duration::from_secs(5))).unwrap();
        assert!(ready.contains(Condition::READ));
    }

    #[test]
    fn test_buffered_data_is_readable_immediately() {
        let (client, _server) = pair();
        let hints = Arc::new(ReadinessHints::new());
        let source = ReadinessSource::new(client.as_raw_fd(), hints.clone());
        assert!(!source.is_ready(Condition::READ));

        hints.publish(12, false, false);
        assert!(source.is_ready(Condition::READ));
        assert_eq!(source.poll(Condition::READ, None).unwrap(), Condition::READ);
    }

    #[test]
    fn test_tls_want_write_satisfies_read() {
        let (client, _server) = pair();
        let hints = Arc::new(ReadinessHints::new());
        let source = ReadinessSource::new(client.as_raw_fd(), hints.clone());

        // Nothing to read, but an idle socket is writable.
        hints.publish(0, false, true);
        let ready = source.poll(Condition::READ, Some(Duration::ZERO)).unwrap();
        assert!(ready.contains(Condition::READ));
    }

    #[test]
    fn test_hangup_reported() {
        let (client, server) = pair();
        drop(server);
        let ready = ReadinessSource::plain(client.as_raw_fd())
            .poll(Condition::READ, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(ready.intersects(Condition::READ | Condition::HANGUP));
    }
}
