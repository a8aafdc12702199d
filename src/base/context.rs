//! Ergonomic error context helpers.
//!
//! Provides extension traits for adding context to `Result` types,
//! converting IO errors into context-rich `NetError` variants.

use crate::base::neterror::NetError;
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Turn a failed connect step into `ConnectFailed`, or `ConnectTimedOut`
    /// when the underlying error is a timeout.
    ///
    /// # Example
    /// ```ignore
    /// use mailnet::base::context::IoResultExt;
    ///
    /// socket.connect(&addr).connect_context("mail.example.com", 993)?;
    /// // Error: "Connection to mail.example.com:993 failed"
    /// ```
    fn connect_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Turn a failed lookup into `LookupFailed` for `host`.
    fn dns_context(self, host: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connect_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(host = %host, port, error = %e, "connect step failed");
            if e.kind() == io::ErrorKind::TimedOut {
                NetError::ConnectTimedOut {
                    host: host.to_string(),
                    port,
                }
            } else {
                NetError::ConnectFailed {
                    host: host.to_string(),
                    port,
                }
            }
        })
    }

    fn dns_context(self, host: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::LookupFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })
    }
}
