//! Resolver pipe framing.
//!
//! The resolver child streams its answers to the parent as a sequence of
//! records:
//!
//! ```text
//! +-----------+-------------+-------------+-------------+-------------------+
//! | family:i32| socktype:i32| protocol:i32| addr_len:i32| addr_len raw bytes|
//! +-----------+-------------+-------------+-------------+-------------------+
//! ```
//!
//! All integers are native-endian since both ends run on the same host. A
//! record whose family is `AF_UNSPEC` marks a failed lookup and ends the
//! stream; otherwise the stream ends at EOF.

use super::candidate::{AddressCandidate, AddressFamily};
use crate::base::neterror::NetError;
use bytes::{Buf, BufMut, BytesMut};
use std::mem;

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 4 * mem::size_of::<i32>();

/// Largest address payload accepted from the pipe.
pub const MAX_ADDR_LEN: usize = mem::size_of::<libc::sockaddr_storage>();

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Candidate(AddressCandidate),
    /// The lookup failed; nothing follows.
    Failure,
}

/// Encode a header on the stack. Used by the resolver child, which must not
/// allocate.
pub fn encode_header(family: i32, socktype: i32, protocol: i32, addr_len: i32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&family.to_ne_bytes());
    header[4..8].copy_from_slice(&socktype.to_ne_bytes());
    header[8..12].copy_from_slice(&protocol.to_ne_bytes());
    header[12..16].copy_from_slice(&addr_len.to_ne_bytes());
    header
}

/// The failure marker record.
pub fn failure_header() -> [u8; HEADER_LEN] {
    encode_header(libc::AF_UNSPEC, 0, 0, 0)
}

pub fn encode_candidate(candidate: &AddressCandidate, out: &mut impl BufMut) {
    out.put_i32_ne(candidate.family().as_raw());
    out.put_i32_ne(candidate.socktype());
    out.put_i32_ne(candidate.protocol());
    out.put_i32_ne(candidate.addr_len() as i32);
    out.put_slice(candidate.addr_bytes());
}

pub fn encode_failure(out: &mut impl BufMut) {
    out.put_slice(&failure_header());
}

/// Incremental decoder for the parent side of the pipe.
///
/// Bytes arrive in arbitrary chunks; [`FrameDecoder::next_frame`] yields a
/// record only once its header and payload are both complete.
#[derive(Debug)]
pub struct FrameDecoder {
    host: String,
    buf: BytesMut,
    finished: bool,
}

impl FrameDecoder {
    /// `host` is only used to give decode errors context.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            buf: BytesMut::with_capacity(HEADER_LEN + MAX_ADDR_LEN),
            finished: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        if !self.finished {
            self.buf.extend_from_slice(data);
        }
    }

    /// True once a failure marker was decoded. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes of an incomplete record still waiting for more input.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, NetError> {
        if self.finished || self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buf[..HEADER_LEN];
        let family = header.get_i32_ne();
        let socktype = header.get_i32_ne();
        let protocol = header.get_i32_ne();
        let addr_len = header.get_i32_ne();

        if family == libc::AF_UNSPEC {
            self.buf.clear();
            self.finished = true;
            return Ok(Some(Frame::Failure));
        }

        let len = usize::try_from(addr_len)
            .ok()
            .filter(|len| *len <= MAX_ADDR_LEN)
            .ok_or_else(|| NetError::MalformedAddress {
                host: self.host.clone(),
                len: addr_len.unsigned_abs() as usize,
            })?;

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let addr = self.buf.split_to(len).to_vec();
        let candidate =
            AddressCandidate::new(AddressFamily::from_raw(family), socktype, protocol, addr);
        candidate.validate(&self.host)?;
        Ok(Some(Frame::Candidate(candidate)))
    }
}

/// Decode a complete stream. A failure marker yields an empty list; a
/// trailing partial record is dropped, as it would be at pipe EOF.
pub fn decode_all(host: &str, data: &[u8]) -> Result<Vec<AddressCandidate>, NetError> {
    let mut decoder = FrameDecoder::new(host);
    decoder.feed(data);
    let mut candidates = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        match frame {
            Frame::Candidate(candidate) => candidates.push(candidate),
            Frame::Failure => return Ok(Vec::new()),
        }
    }
    Ok(candidates)
}
