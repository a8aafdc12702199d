//! Sockets and the three ways to connect one.
//!
//! - [`blocking`]: resolve and connect under one deadline, blocking the caller
//! - [`connectjob`]: resolve in a child process, then non-blocking attempts
//!   across candidates driven by the runtime
//! - [`thread`]: a blocking connect on a worker, awaited without stalling
//!   other tasks
//!
//! All three produce a [`Connection`](connection::Connection). Readiness for
//! plain and TLS transports goes through [`readiness`]; [`watch`] bridges it
//! into the runtime.

pub mod blocking;
pub mod client;
pub mod connectjob;
pub mod connection;
pub mod readiness;
pub mod registry;
pub mod thread;
pub mod tls;
pub mod watch;
