//! DNS resolution.
//!
//! Two ways into the system resolver share one algorithm:
//! - [`GaiResolver`]: synchronous `getaddrinfo`, used by blocking connects
//! - [`ResolveJob`]: the same lookup in a forked child, streamed back over a
//!   pipe so the event loop never waits on DNS
//!
//! Both bypass the resolver for literal addresses and reload the resolver
//! configuration when [`ResolvConfWatcher`] sees the file change.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailnet::dns::{GaiResolver, ResolvConfWatcher};
//! use mailnet::ResolverMode;
//! use std::sync::Arc;
//!
//! let resolver = GaiResolver::new(ResolverMode::Full, Arc::new(ResolvConfWatcher::new("/etc/resolv.conf")));
//! for candidate in resolver.resolve("imap.example.com", 993)? {
//!     println!("candidate: {}", candidate);
//! }
//! ```

mod candidate;
pub mod framing;
mod gai;
mod job;
mod resolvconf;

pub use candidate::{AddressCandidate, AddressFamily};
pub use gai::{literal_candidate, GaiResolver};
pub use job::ResolveJob;
pub use resolvconf::ResolvConfWatcher;
