//! Resolved address candidates.

use crate::base::neterror::NetError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{fmt, io, mem, net::SocketAddr, ptr};

/// Address family of a candidate, as reported by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// `AF_UNSPEC`. Only ever seen as the failure marker on the resolver pipe.
    Unspecified,
    Inet,
    Inet6,
    Other(i32),
}

impl AddressFamily {
    pub fn from_raw(family: i32) -> Self {
        match family {
            libc::AF_UNSPEC => AddressFamily::Unspecified,
            libc::AF_INET => AddressFamily::Inet,
            libc::AF_INET6 => AddressFamily::Inet6,
            other => AddressFamily::Other(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            AddressFamily::Unspecified => libc::AF_UNSPEC,
            AddressFamily::Inet => libc::AF_INET,
            AddressFamily::Inet6 => libc::AF_INET6,
            AddressFamily::Other(raw) => raw,
        }
    }

    /// Size of the sockaddr structure this family uses, if supported.
    pub fn sockaddr_len(self) -> Option<usize> {
        match self {
            AddressFamily::Inet => Some(mem::size_of::<libc::sockaddr_in>()),
            AddressFamily::Inet6 => Some(mem::size_of::<libc::sockaddr_in6>()),
            _ => None,
        }
    }
}

/// One resolved address eligible for a connect attempt.
///
/// The raw bytes are the `sockaddr` exactly as the resolver produced it, so a
/// candidate can cross the resolver pipe and be handed back to `connect(2)`
/// without reinterpretation.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AddressCandidate {
    family: AddressFamily,
    socktype: i32,
    protocol: i32,
    addr: Box<[u8]>,
}

impl AddressCandidate {
    pub fn new(family: AddressFamily, socktype: i32, protocol: i32, addr: Vec<u8>) -> Self {
        Self {
            family,
            socktype,
            protocol,
            addr: addr.into_boxed_slice(),
        }
    }

    /// Candidate for a literal socket address: stream socket, TCP.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let sa = SockAddr::from(addr);
        // SAFETY: `as_ptr` points at a sockaddr of exactly `len` initialised bytes.
        let bytes = unsafe { std::slice::from_raw_parts(sa.as_ptr() as *const u8, sa.len() as usize) };
        let family = if addr.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        Self::new(family, libc::SOCK_STREAM, libc::IPPROTO_TCP, bytes.to_vec())
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn socktype(&self) -> i32 {
        self.socktype
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn addr_bytes(&self) -> &[u8] {
        &self.addr
    }

    pub fn addr_len(&self) -> usize {
        self.addr.len()
    }

    /// Reject candidates whose address length does not match their family.
    pub fn validate(&self, host: &str) -> Result<(), NetError> {
        match self.family.sockaddr_len() {
            Some(expected) if expected == self.addr.len() => Ok(()),
            _ => Err(NetError::MalformedAddress {
                host: host.to_string(),
                len: self.addr.len(),
            }),
        }
    }

    /// The raw bytes as a `socket2` address, ready for `connect`.
    pub fn sock_addr(&self) -> Option<SockAddr> {
        let len = self.addr.len();
        if len == 0 || len > mem::size_of::<libc::sockaddr_storage>() {
            return None;
        }
        // SAFETY: storage is zeroed and large enough for `len` bytes.
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            ptr::copy_nonoverlapping(
                self.addr.as_ptr(),
                &mut storage as *mut libc::sockaddr_storage as *mut u8,
                len,
            );
            Some(SockAddr::new(storage, len as libc::socklen_t))
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.sock_addr().and_then(|sa| sa.as_socket())
    }

    /// Open an unconnected socket matching this candidate.
    pub fn open_socket(&self) -> io::Result<Socket> {
        let protocol = match self.protocol {
            0 => None,
            p => Some(Protocol::from(p)),
        };
        Socket::new(
            Domain::from(self.family.as_raw()),
            Type::from(self.socktype),
            protocol,
        )
    }
}

impl fmt::Debug for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("AddressCandidate");
        s.field("family", &self.family);
        match self.socket_addr() {
            Some(addr) => s.field("addr", &addr),
            None => s.field("addr_len", &self.addr.len()),
        };
        s.finish()
    }
}

impl fmt::Display for AddressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => fmt::Display::fmt(&addr, f),
            None => write!(f, "<family {} / {} bytes>", self.family.as_raw(), self.addr.len()),
        }
    }
}
