//! System DNS resolver using getaddrinfo.
//!
//! This resolver is synchronous: it blocks the calling thread for the length
//! of the lookup. Callers on the event loop go through the forked
//! [`ResolveJob`](super::job::ResolveJob) instead, which runs this same lookup
//! in a child process.
//!
//! # Modes
//!
//! - [`ResolverMode::Full`]: every address, IPv4 and IPv6, in resolver order.
//! - [`ResolverMode::Legacy`]: one IPv4 address, for peers that only ever
//!   handled the first `gethostbyname` answer.

use super::candidate::{AddressCandidate, AddressFamily};
use super::resolvconf::ResolvConfWatcher;
use crate::base::config::ResolverMode;
use crate::base::neterror::NetError;
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::{io, mem, ptr};

/// System DNS resolver backed by `getaddrinfo`.
#[derive(Clone, Debug)]
pub struct GaiResolver {
    mode: ResolverMode,
    conf: Arc<ResolvConfWatcher>,
}

impl GaiResolver {
    pub fn new(mode: ResolverMode, conf: Arc<ResolvConfWatcher>) -> Self {
        Self { mode, conf }
    }

    pub fn mode(&self) -> ResolverMode {
        self.mode
    }

    pub fn conf(&self) -> &Arc<ResolvConfWatcher> {
        &self.conf
    }

    /// Resolve `host` into connectable candidates, in resolver order.
    ///
    /// Literal addresses never reach the resolver.
    pub fn resolve(&self, host: &str, port: u16) -> Result<Vec<AddressCandidate>, NetError> {
        if let Some(candidate) = literal_candidate(host, port) {
            if self.mode == ResolverMode::Legacy && candidate.family() != AddressFamily::Inet {
                return Err(NetError::LookupFailed {
                    host: host.to_string(),
                    reason: "legacy resolver mode only handles IPv4".to_string(),
                });
            }
            tracing::debug!(host = %host, "literal address, skipping lookup");
            return Ok(vec![candidate]);
        }

        self.conf.check();

        let (c_host, c_service) = lookup_args(host, port)?;
        tracing::debug!(host = %host, port, mode = ?self.mode, "resolving via getaddrinfo");

        let list = AddrInfoList::lookup(&c_host, &c_service, &lookup_hints(self.mode))
            .map_err(|rc| gai_error(host, rc))?;

        let mut candidates = Vec::new();
        for ai in list.iter() {
            let candidate = candidate_from_addrinfo(ai);
            candidate.validate(host)?;
            candidates.push(candidate);
            if self.mode == ResolverMode::Legacy {
                break;
            }
        }

        if candidates.is_empty() {
            return Err(NetError::LookupFailed {
                host: host.to_string(),
                reason: "no addresses returned by getaddrinfo".to_string(),
            });
        }

        tracing::debug!(host = %host, count = candidates.len(), "resolution complete");
        Ok(candidates)
    }
}

/// Parse `host` as an IP literal.
///
/// Returns `None` for names that need a lookup.
pub fn literal_candidate(host: &str, port: u16) -> Option<AddressCandidate> {
    // Bracketed IPv6 as found in URLs and config files.
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let ip: IpAddr = bare.parse().ok()?;
    Some(AddressCandidate::from_socket_addr(SocketAddr::new(ip, port)))
}

/// C strings for a lookup. Built before any fork so the child never allocates.
pub(crate) fn lookup_args(host: &str, port: u16) -> Result<(CString, CString), NetError> {
    let c_host = CString::new(host).map_err(|_| NetError::LookupFailed {
        host: host.to_string(),
        reason: "host name contains a NUL byte".to_string(),
    })?;
    let c_service = CString::new(port.to_string()).map_err(|_| NetError::LookupFailed {
        host: host.to_string(),
        reason: "invalid port".to_string(),
    })?;
    Ok((c_host, c_service))
}

pub(crate) fn lookup_hints(mode: ResolverMode) -> libc::addrinfo {
    // SAFETY: addrinfo is a plain C struct; all-zero is its documented "no hints" value.
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = match mode {
        ResolverMode::Full => libc::AF_UNSPEC,
        ResolverMode::Legacy => libc::AF_INET,
    };
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = libc::AI_NUMERICSERV;
    hints
}

fn gai_error(host: &str, rc: libc::c_int) -> NetError {
    let reason = if rc == libc::EAI_SYSTEM {
        io::Error::last_os_error().to_string()
    } else {
        // SAFETY: gai_strerror returns a static NUL-terminated string.
        unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
            .to_string_lossy()
            .into_owned()
    };
    tracing::debug!(host = %host, error = %reason, "getaddrinfo failed");
    NetError::LookupFailed {
        host: host.to_string(),
        reason,
    }
}

fn candidate_from_addrinfo(ai: &libc::addrinfo) -> AddressCandidate {
    let bytes = if ai.ai_addr.is_null() {
        Vec::new()
    } else {
        // SAFETY: getaddrinfo guarantees ai_addr points at ai_addrlen bytes.
        unsafe { std::slice::from_raw_parts(ai.ai_addr as *const u8, ai.ai_addrlen as usize) }
            .to_vec()
    };
    AddressCandidate::new(
        AddressFamily::from_raw(ai.ai_family),
        ai.ai_socktype,
        ai.ai_protocol,
        bytes,
    )
}

/// Owned result list of `getaddrinfo`, freed on drop.
pub(crate) struct AddrInfoList {
    head: *mut libc::addrinfo,
}

impl AddrInfoList {
    /// Run the lookup. Allocates nothing on the Rust side, so it is usable in
    /// a freshly forked child.
    pub(crate) fn lookup(
        host: &CStr,
        service: &CStr,
        hints: &libc::addrinfo,
    ) -> Result<Self, libc::c_int> {
        let mut head = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call.
        let rc = unsafe { libc::getaddrinfo(host.as_ptr(), service.as_ptr(), hints, &mut head) };
        if rc != 0 {
            return Err(rc);
        }
        Ok(Self { head })
    }

    pub(crate) fn iter(&self) -> AddrInfoIter<'_> {
        AddrInfoIter {
            cur: self.head,
            _list: PhantomData,
        }
    }
}

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.head.is_null() {
            // SAFETY: head came from a successful getaddrinfo and is freed once.
            unsafe { libc::freeaddrinfo(self.head) };
        }
    }
}

pub(crate) struct AddrInfoIter<'a> {
    cur: *const libc::addrinfo,
    _list: PhantomData<&'a AddrInfoList>,
}

impl<'a> Iterator for AddrInfoIter<'a> {
    type Item = &'a libc::addrinfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: the list outlives the iterator and nodes are never mutated.
        let ai = unsafe { &*self.cur };
        self.cur = ai.ai_next;
        Some(ai)
    }
}
