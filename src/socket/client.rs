use boring::ssl::{ConnectConfiguration, ErrorCode, HandshakeError, SslStream};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

use crate::base::neterror::NetError;
use crate::socket::readiness::Condition;

/// Represents a connected socket (TCP or TLS).
///
/// The readiness hooks let the poller account for state the descriptor
/// cannot show: decrypted bytes held by the TLS layer, and a TLS operation
/// that needs the opposite direction to make progress.
pub trait StreamSocket: Read + Write + AsRawFd + Send + fmt::Debug {
    /// Returns true if the socket is still connected.
    /// Note: This is a non-blocking peek, not a round trip to the peer.
    fn is_connected(&self) -> bool;

    /// The last operation stopped until the socket becomes readable.
    fn wants_read(&self) -> bool {
        false
    }

    /// The last operation stopped until the socket becomes writable.
    fn wants_write(&self) -> bool {
        false
    }

    /// Bytes that can be read without touching the descriptor.
    fn pending_input(&self) -> usize {
        0
    }

    fn has_buffered_input(&self) -> bool {
        self.pending_input() > 0
    }
}

impl StreamSocket for TcpStream {
    fn is_connected(&self) -> bool {
        // peer_addr() returns Err if socket is disconnected
        if self.peer_addr().is_err() {
            return false;
        }
        // A non-blocking peek catches RST and FIN without consuming data.
        let mut buf = [0u8; 1];
        // SAFETY: buf is a valid one-byte buffer.
        let n = unsafe {
            libc::recv(
                self.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        match n {
            0 => false,
            n if n > 0 => true,
            _ => io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Nothing,
    Read,
    Write,
}

/// Client TLS session over a TCP stream.
#[derive(Debug)]
pub struct TlsStream {
    inner: SslStream<TcpStream>,
    want: Want,
}

impl TlsStream {
    /// Run the client handshake.
    ///
    /// On a non-blocking stream `wait` is called with the direction the
    /// handshake is blocked on; it must return once that direction is ready
    /// or fail with a timeout.
    pub fn connect<F>(
        config: ConnectConfiguration,
        host: &str,
        stream: TcpStream,
        mut wait: F,
    ) -> Result<Self, NetError>
    where
        F: FnMut(Condition) -> Result<(), NetError>,
    {
        let mut attempt = config.connect(host, stream);
        loop {
            match attempt {
                Ok(inner) => {
                    tracing::debug!(host = %host, version = ?inner.ssl().version_str(), "TLS handshake complete");
                    return Ok(Self {
                        inner,
                        want: Want::Nothing,
                    });
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    let cond = if mid.error().code() == ErrorCode::WANT_WRITE {
                        Condition::WRITE
                    } else {
                        Condition::READ
                    };
                    wait(cond)?;
                    attempt = mid.handshake();
                }
                Err(e) => {
                    tracing::debug!(host = %host, error = %e, "TLS handshake failed");
                    return Err(NetError::Tls(e.to_string()));
                }
            }
        }
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.inner.get_ref()
    }

    /// Send close-notify. Errors are ignored; the peer may already be gone.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown() {
            tracing::trace!(error = %e, "TLS shutdown incomplete");
        }
    }

    fn map_error(&mut self, e: boring::ssl::Error, eof_is_ok: bool) -> io::Result<usize> {
        match e.code() {
            ErrorCode::WANT_READ => {
                self.want = Want::Read;
                Err(io::ErrorKind::WouldBlock.into())
            }
            ErrorCode::WANT_WRITE => {
                self.want = Want::Write;
                Err(io::ErrorKind::WouldBlock.into())
            }
            ErrorCode::ZERO_RETURN if eof_is_ok => {
                self.want = Want::Nothing;
                Ok(0)
            }
            // Peer closed the TCP stream without close-notify.
            ErrorCode::SYSCALL if eof_is_ok && e.io_error().is_none() => {
                self.want = Want::Nothing;
                Ok(0)
            }
            ErrorCode::ZERO_RETURN => {
                self.want = Want::Nothing;
                Err(io::ErrorKind::BrokenPipe.into())
            }
            _ => {
                self.want = Want::Nothing;
                Err(e.into_io_error().unwrap_or_else(io::Error::other))
            }
        }
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.ssl_read(buf) {
            Ok(n) => {
                self.want = Want::Nothing;
                Ok(n)
            }
            Err(e) => self.map_error(e, true),
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.ssl_write(buf) {
            Ok(n) => {
                self.want = Want::Nothing;
                Ok(n)
            }
            Err(e) => self.map_error(e, false),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.get_mut().flush()
    }
}

impl AsRawFd for TlsStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

impl StreamSocket for TlsStream {
    fn is_connected(&self) -> bool {
        self.pending_input() > 0 || self.get_ref().is_connected()
    }

    fn wants_read(&self) -> bool {
        self.want == Want::Read
    }

    fn wants_write(&self) -> bool {
        self.want == Want::Write
    }

    fn pending_input(&self) -> usize {
        self.inner.ssl().pending()
    }
}

/// The transport under an established connection.
#[derive(Debug)]
pub enum SocketType {
    Tcp(TcpStream),
    Ssl(Box<TlsStream>),
}

impl SocketType {
    /// The TCP stream under any TLS layer.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            SocketType::Tcp(s) => s,
            SocketType::Ssl(s) => s.get_ref(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, SocketType::Ssl(_))
    }

    /// Tear down TLS, if any. The descriptor stays open until drop.
    pub fn shutdown_tls(&mut self) {
        if let SocketType::Ssl(s) = self {
            s.shutdown();
        }
    }
}

impl Read for SocketType {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SocketType::Tcp(s) => s.read(buf),
            SocketType::Ssl(s) => s.read(buf),
        }
    }
}

impl Write for SocketType {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SocketType::Tcp(s) => s.write(buf),
            SocketType::Ssl(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SocketType::Tcp(s) => s.flush(),
            SocketType::Ssl(s) => s.flush(),
        }
    }
}

impl AsRawFd for SocketType {
    fn as_raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }
}

impl StreamSocket for SocketType {
    fn is_connected(&self) -> bool {
        match self {
            SocketType::Tcp(s) => s.is_connected(),
            SocketType::Ssl(s) => s.is_connected(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            SocketType::Tcp(s) => s.wants_read(),
            SocketType::Ssl(s) => s.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            SocketType::Tcp(s) => s.wants_write(),
            SocketType::Ssl(s) => s.wants_write(),
        }
    }

    fn pending_input(&self) -> usize {
        match self {
            SocketType::Tcp(s) => s.pending_input(),
            SocketType::Ssl(s) => s.pending_input(),
        }
    }
}
