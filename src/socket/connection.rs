//! One socket endpoint and the I/O helpers that run on it.
//!
//! A [`Connection`] owns its transport only while [`ConnState::Established`];
//! in every other state there is no descriptor. Reads go through a small
//! read-ahead buffer so `peek` and line reads never lose bytes, and every
//! blocking-style transfer first waits on the connection's
//! [`ReadinessSource`] bounded by the engine's I/O timeout.

use bytes::{Buf, BytesMut};
use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::base::neterror::NetError;
use crate::socket::client::{SocketType, StreamSocket, TlsStream};
use crate::socket::readiness::{poll_fd, Condition, ReadinessHints, ReadinessSource};
use crate::socket::registry::{EngineShared, WatchId};
use crate::socket::tls::TlsConfig;

/// Largest single read into the read-ahead buffer.
const READ_CHUNK: usize = 4096;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Ready,
    LookupSucceeded,
    LookupFailed,
    Established,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnFlags {
    /// Helpers never wait; would-block surfaces as an error.
    pub non_blocking: bool,
    /// Helpers wait for readiness, bounded by the I/O timeout.
    pub check_io: bool,
}

impl Default for ConnFlags {
    fn default() -> Self {
        Self {
            non_blocking: false,
            check_io: true,
        }
    }
}

pub struct Connection {
    hostname: String,
    port: u16,
    state: ConnState,
    flags: ConnFlags,
    transport: Option<SocketType>,
    read_ahead: BytesMut,
    hints: Arc<ReadinessHints>,
    watch: Option<WatchId>,
    user_data: Option<Box<dyn Any + Send>>,
    shared: Arc<EngineShared>,
}

impl Connection {
    pub(crate) fn new(hostname: &str, port: u16, shared: Arc<EngineShared>) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            state: ConnState::Ready,
            flags: ConnFlags::default(),
            transport: None,
            read_ahead: BytesMut::new(),
            hints: Arc::new(ReadinessHints::new()),
            watch: None,
            user_data: None,
            shared,
        }
    }

    /// Attach a connected stream and register in the live-connection registry.
    pub(crate) fn establish(&mut self, stream: TcpStream) -> Result<(), NetError> {
        stream.set_nonblocking(false)?;
        let fd = stream.as_raw_fd();
        self.transport = Some(SocketType::Tcp(stream));
        self.state = ConnState::Established;
        self.flags.non_blocking = false;
        self.shared.register_live(fd, &self.hostname, self.port);
        self.publish_hints();
        tracing::debug!(host = %self.hostname, port = self.port, fd, "connection established");
        Ok(())
    }

    /// Move to a non-established state, dropping any transport.
    pub(crate) fn set_state(&mut self, state: ConnState) {
        if state != ConnState::Established {
            self.release_transport();
        }
        self.state = state;
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    pub(crate) fn replace_watch(&mut self, id: Option<WatchId>) -> Option<WatchId> {
        std::mem::replace(&mut self.watch, id)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(SocketType::is_tls)
    }

    pub fn is_connected(&self) -> bool {
        !self.read_ahead.is_empty() || self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// The registered readiness watch, if any.
    pub fn watch(&self) -> Option<WatchId> {
        self.watch
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.transport()?.tcp().peer_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.transport()?.tcp().local_addr()?)
    }

    pub fn set_user_data<T: Any + Send>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref().and_then(|d| d.downcast_ref())
    }

    pub fn take_user_data<T: Any>(&mut self) -> Option<T> {
        let data = self.user_data.take()?;
        match data.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(other) => {
                self.user_data = Some(other);
                None
            }
        }
    }

    /// Readiness view for watches and helpers.
    pub fn readiness_source(&self) -> Option<ReadinessSource> {
        self.raw_fd().map(|fd| ReadinessSource::new(fd, self.hints.clone()))
    }

    pub fn set_nonblocking(&mut self, non_blocking: bool) -> Result<(), NetError> {
        self.transport()?.tcp().set_nonblocking(non_blocking)?;
        self.flags.non_blocking = non_blocking;
        Ok(())
    }

    pub fn set_check_io(&mut self, enabled: bool) {
        self.flags.check_io = enabled;
    }

    /// True when a read would return data without waiting on the peer.
    pub fn has_read_data(&self) -> bool {
        match self.readiness_source() {
            Some(source) => {
                self.hints.buffered() > 0
                    || source
                        .poll(Condition::READ, Some(std::time::Duration::ZERO))
                        .is_ok_and(|ready| ready.contains(Condition::READ))
            }
            None => false,
        }
    }

    /// Wait for `cond` bounded by the I/O timeout.
    pub fn check_io(&self, cond: Condition) -> Result<Condition, NetError> {
        let source = self.readiness_source().ok_or(NetError::NotConnected)?;
        let ready = source.poll(cond, self.shared.io_timeout())?;
        if ready.is_empty() {
            tracing::debug!(host = %self.hostname, ?cond, "I/O wait timed out");
            return Err(NetError::IoTimeout);
        }
        Ok(ready)
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.read_ahead.is_empty() {
            return Ok(self.take_buffered(buf));
        }
        self.wait_for(Condition::READ)?;
        let transport = self.transport.as_mut().ok_or(NetError::NotConnected)?;
        let result = retry_interrupted(|| transport.read(buf));
        self.publish_hints();
        Ok(result?)
    }

    /// Copy buffered bytes without consuming them, reading once if nothing
    /// is buffered. `Ok(0)` means the peer closed.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.read_ahead.is_empty() && self.fill_read_ahead(buf.len())? == 0 {
            return Ok(0);
        }
        let n = buf.len().min(self.read_ahead.len());
        buf[..n].copy_from_slice(&self.read_ahead[..n]);
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.wait_for(Condition::WRITE)?;
        let transport = self.transport.as_mut().ok_or(NetError::NotConnected)?;
        let result = retry_interrupted(|| transport.write(buf));
        self.publish_hints();
        Ok(result?)
    }

    /// Write the whole buffer. A zero-length write means the peer is gone.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.write(&buf[sent..])? {
                0 => {
                    tracing::debug!(host = %self.hostname, sent, total = buf.len(), "write returned zero");
                    return Err(NetError::ConnectionClosed);
                }
                n => sent += n,
            }
        }
        Ok(sent)
    }

    /// Read one line, terminator included, into `buf`.
    ///
    /// Stops early when `buf` fills. Returns the number of bytes stored;
    /// `Ok(0)` means the peer closed before sending anything.
    pub fn get_line(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.read_ahead.is_empty() && self.fill_read_ahead(buf.len() - filled)? == 0 {
                break;
            }
            let window = self.read_ahead.len().min(buf.len() - filled);
            let (take, found) = match find_newline(&self.read_ahead[..window]) {
                Some(pos) => (pos + 1, true),
                None => (window, false),
            };
            buf[filled..filled + take].copy_from_slice(&self.read_ahead[..take]);
            self.read_ahead.advance(take);
            filled += take;
            if found {
                break;
            }
        }
        self.publish_hints();
        Ok(filled)
    }

    /// Read one line of any length, terminator included.
    ///
    /// An empty result means the peer closed before sending anything; a
    /// final line without terminator is returned as is.
    pub fn get_line_alloc(&mut self) -> Result<Vec<u8>, NetError> {
        let chunk = self.shared.config().line_buffer_size.max(1);
        let mut line = Vec::with_capacity(chunk);
        loop {
            if self.read_ahead.is_empty() && self.fill_read_ahead(chunk)? == 0 {
                break;
            }
            match find_newline(&self.read_ahead) {
                Some(pos) => {
                    line.extend_from_slice(&self.read_ahead[..=pos]);
                    self.read_ahead.advance(pos + 1);
                    break;
                }
                None => {
                    line.extend_from_slice(&self.read_ahead);
                    self.read_ahead.clear();
                }
            }
        }
        self.publish_hints();
        Ok(line)
    }

    /// Formatted write: `conn.printf(format_args!("a{} LOGIN\r\n", tag))`.
    pub fn printf(&mut self, args: fmt::Arguments<'_>) -> Result<usize, NetError> {
        match args.as_str() {
            Some(s) => self.write_all(s.as_bytes()),
            None => self.write_all(fmt::format(args).as_bytes()),
        }
    }

    /// Write `line` followed by CRLF.
    pub fn puts(&mut self, line: &str) -> Result<usize, NetError> {
        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.write_all(&out)
    }

    /// Upgrade the established plain connection to TLS.
    ///
    /// Buffered plaintext is discarded first: nothing received before the
    /// handshake may be mistaken for protected data. On failure the
    /// connection is left `Failed` without a descriptor.
    pub fn start_tls(&mut self, config: &TlsConfig) -> Result<(), NetError> {
        let transport = self.transport.take().ok_or(NetError::NotConnected)?;
        let stream = match transport {
            SocketType::Tcp(stream) => stream,
            tls @ SocketType::Ssl(_) => {
                self.transport = Some(tls);
                return Err(NetError::Tls("connection already uses TLS".to_string()));
            }
        };
        let fd = stream.as_raw_fd();
        // The handshake runs non-blocking so every step is bounded by the
        // I/O timeout.
        if let Err(e) = stream.set_nonblocking(true) {
            self.transport = Some(SocketType::Tcp(stream));
            return Err(e.into());
        }
        if !self.read_ahead.is_empty() {
            tracing::debug!(host = %self.hostname, discarded = self.read_ahead.len(), "dropping plaintext before TLS");
            self.read_ahead.clear();
        }

        let timeout = self.shared.io_timeout();
        let handshake = config.configure(&self.hostname).and_then(|tls_config| {
            TlsStream::connect(tls_config, &self.hostname, stream, |cond| {
                if poll_fd(fd, cond, timeout)?.is_empty() {
                    return Err(NetError::IoTimeout);
                }
                Ok(())
            })
        });

        match handshake {
            Ok(tls) => {
                let restored = tls.get_ref().set_nonblocking(self.flags.non_blocking);
                self.transport = Some(SocketType::Ssl(Box::new(tls)));
                restored?;
                self.publish_hints();
                tracing::debug!(host = %self.hostname, fd, "connection upgraded to TLS");
                Ok(())
            }
            Err(e) => {
                // The stream went down with the failed handshake.
                self.shared.deregister_live(fd);
                self.release_transport();
                self.state = ConnState::Failed;
                Err(e)
            }
        }
    }

    /// Tear down TLS, remove any watch, deregister and release the descriptor.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.transport.is_some() {
            tracing::debug!(host = %self.hostname, port = self.port, fd = ?self.raw_fd(), "closing connection");
        }
        self.release_transport();
    }

    /// Drop the descriptor and everything watching it.
    fn release_transport(&mut self) {
        if let Some(id) = self.watch.take() {
            self.shared.remove_watch(id);
        }
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown_tls();
            self.shared.deregister_live(transport.as_raw_fd());
        }
        self.read_ahead.clear();
        self.hints.clear();
    }

    fn transport(&self) -> Result<&SocketType, NetError> {
        self.transport.as_ref().ok_or(NetError::NotConnected)
    }

    fn wait_for(&self, cond: Condition) -> Result<(), NetError> {
        if self.transport.is_none() {
            return Err(NetError::NotConnected);
        }
        if self.flags.non_blocking || !self.flags.check_io {
            return Ok(());
        }
        self.check_io(cond).map(|_| ())
    }

    fn take_buffered(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.read_ahead.len());
        buf[..n].copy_from_slice(&self.read_ahead[..n]);
        self.read_ahead.advance(n);
        self.publish_hints();
        n
    }

    /// One read from the transport appended to the read-ahead buffer.
    fn fill_read_ahead(&mut self, want: usize) -> Result<usize, NetError> {
        self.wait_for(Condition::READ)?;
        let transport = self.transport.as_mut().ok_or(NetError::NotConnected)?;

        let want = want.clamp(1, READ_CHUNK);
        let start = self.read_ahead.len();
        self.read_ahead.resize(start + want, 0);
        let read_ahead = &mut self.read_ahead;
        let result = retry_interrupted(|| transport.read(&mut read_ahead[start..]));
        let n = *result.as_ref().unwrap_or(&0);
        self.read_ahead.truncate(start + n);
        self.publish_hints();
        Ok(result?)
    }

    fn publish_hints(&self) {
        match &self.transport {
            Some(t) => self.hints.publish(
                self.read_ahead.len() + t.pending_input(),
                t.wants_read(),
                t.wants_write(),
            ),
            None => self.hints.clear(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("fd", &self.raw_fd())
            .field("tls", &self.is_tls())
            .field("buffered", &self.read_ahead.len())
            .field("watch", &self.watch)
            .finish()
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(Connection::read(self, buf)?)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Connection::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.transport.as_mut() {
            Some(t) => t.flush(),
            None => Err(NetError::NotConnected.into()),
        }
    }
}

fn retry_interrupted<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn find_newline(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == b'\n')
}
