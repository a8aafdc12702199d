//! # mailnet
//!
//! The socket layer under mail protocol clients.
//!
//! `mailnet` connects to a named host three ways, sharing one resolver and
//! one readiness model:
//!
//! - **Blocking**: resolve and connect under a single deadline
//!   ([`SocketEngine::connect`])
//! - **Asynchronous**: resolve in a forked child, then try each candidate in
//!   resolver order with one non-blocking attempt in flight, cancellable by
//!   id at any point ([`SocketEngine::connect_async`])
//! - **Worker thread**: a blocking connect on the runtime's blocking pool,
//!   awaited without stalling other tasks ([`SocketEngine::connect_on_thread`])
//!
//! Established connections are plain TCP or TLS (BoringSSL) behind the same
//! [`Connection`] API: `read`, `write`, `peek`, `write_all`, `get_line`,
//! `get_line_alloc`, `printf`, `puts`. Every blocking-style transfer waits
//! for readiness first, bounded by the engine's I/O timeout, and readiness
//! accounts for data already decrypted by TLS.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mailnet::{EngineConfig, SocketEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = SocketEngine::new(EngineConfig::default());
//!     engine
//!         .connect_async("imap.example.com", 143, |result| match result {
//!             Ok(conn) => println!("connected to {:?}", conn.peer_addr()),
//!             Err(e) => eprintln!("connect failed: {}", e),
//!         })
//!         .unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors and configuration
//! - [`dns`] - Synchronous and forked resolution, resolver pipe framing
//! - [`socket`] - Connectors, connections, readiness and watches

pub mod base;
pub mod dns;
pub mod engine;
pub mod socket;

pub use base::config::{EngineConfig, ResolverMode};
pub use base::neterror::{NetError, Result};
pub use dns::{AddressCandidate, AddressFamily};
pub use engine::SocketEngine;
pub use socket::connection::{ConnFlags, ConnState, Connection};
pub use socket::readiness::{Condition, ReadinessSource};
pub use socket::registry::{LiveConnection, RequestId, WatchId};
pub use socket::tls::TlsConfig;
