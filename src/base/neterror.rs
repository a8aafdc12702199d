use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the connection engine.
///
/// Every variant has a stable negative code (see [`NetError::as_i32`]) so that
/// results can travel through plain integers, e.g. the result slot of a
/// thread-backed connect request.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Resolution Errors
    #[error("Lookup of {host} failed: {reason}")]
    LookupFailed { host: String, reason: String },
    #[error("Resolver returned a malformed address for {host} ({len} bytes)")]
    MalformedAddress { host: String, len: usize },

    // Connection Errors
    #[error("Connection to {host}:{port} failed")]
    ConnectFailed { host: String, port: u16 },
    #[error("Connection to {host}:{port} timed out")]
    ConnectTimedOut { host: String, port: u16 },
    #[error("Socket not connected")]
    NotConnected,
    #[error("Connection closed by peer")]
    ConnectionClosed,

    // I/O Errors
    #[error("I/O timed out")]
    IoTimeout,
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    #[error("TLS error: {0}")]
    Tls(String),

    // Request bookkeeping
    #[error("Request cancelled")]
    Cancelled,
    #[error("No pending request with id {0}")]
    RequestNotFound(u64),

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::LookupFailed { .. } => -105,
            NetError::MalformedAddress { .. } => -108,
            NetError::ConnectFailed { .. } => -104,
            NetError::ConnectTimedOut { .. } => -118,
            NetError::NotConnected => -112,
            NetError::ConnectionClosed => -100,
            NetError::IoTimeout => -7,
            NetError::Io(_) => -1,
            NetError::Tls(_) => -107,
            NetError::Cancelled => -3,
            NetError::RequestNotFound(_) => -2,
            NetError::Unknown(code) => *code,
        }
    }

    /// Build an I/O error variant.
    pub fn io(err: io::Error) -> Self {
        NetError::Io(Arc::new(err))
    }

    /// True for the non-blocking "try again later" condition.
    pub fn is_would_block(&self) -> bool {
        matches!(self, NetError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// True for either flavour of connect failure.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            NetError::ConnectFailed { .. } | NetError::ConnectTimedOut { .. }
        )
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            return NetError::IoTimeout;
        }
        NetError::io(err)
    }
}

impl From<boring::error::ErrorStack> for NetError {
    fn from(err: boring::error::ErrorStack) -> Self {
        NetError::Tls(err.to_string())
    }
}

/// Lossy reverse mapping. Variants that carry context come back with empty
/// fields since the code alone cannot restore them.
impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -105 => NetError::LookupFailed {
                host: String::new(),
                reason: String::new(),
            },
            -108 => NetError::MalformedAddress {
                host: String::new(),
                len: 0,
            },
            -104 => NetError::ConnectFailed {
                host: String::new(),
                port: 0,
            },
            -118 => NetError::ConnectTimedOut {
                host: String::new(),
                port: 0,
            },
            -112 => NetError::NotConnected,
            -100 => NetError::ConnectionClosed,
            -7 => NetError::IoTimeout,
            -1 => NetError::io(io::Error::other("I/O error")),
            -107 => NetError::Tls(String::new()),
            -3 => NetError::Cancelled,
            -2 => NetError::RequestNotFound(0),
            _ => NetError::Unknown(code),
        }
    }
}

/// For `std::io::Read`/`Write` on a connection.
impl From<NetError> for io::Error {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Io(inner) => match Arc::try_unwrap(inner) {
                Ok(e) => e,
                Err(shared) => io::Error::new(shared.kind(), shared.to_string()),
            },
            NetError::IoTimeout => io::Error::new(io::ErrorKind::TimedOut, err),
            NetError::NotConnected => io::Error::new(io::ErrorKind::NotConnected, err),
            NetError::ConnectionClosed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            other => io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
