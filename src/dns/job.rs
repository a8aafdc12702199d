//! Isolated asynchronous resolution.
//!
//! `getaddrinfo` blocks and cannot be cancelled, so a lookup started from the
//! event loop runs in a forked child process. The child performs the same
//! lookup as [`GaiResolver`](super::GaiResolver) and streams each answer back
//! over a pipe using the record format of [`framing`](super::framing). The
//! parent watches the read end of the pipe from the tokio reactor and never
//! waits on DNS itself.
//!
//! Cancelling (or dropping) a job kills and reaps the child before the pipe
//! is closed, so no zombie survives the call.

use super::candidate::{AddressCandidate, AddressFamily};
use super::framing::{self, Frame, FrameDecoder};
use super::gai::{literal_candidate, lookup_args, lookup_hints, AddrInfoList};
use super::resolvconf::ResolvConfWatcher;
use crate::base::config::ResolverMode;
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::ffi::CStr;
use std::fs::File;
use std::future::poll_fn;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// A resolution running in a child process.
#[derive(Debug)]
pub struct ResolveJob {
    host: String,
    port: u16,
    pid: Option<libc::pid_t>,
    pipe: Option<AsyncFd<File>>,
    decoder: FrameDecoder,
    candidates: Vec<AddressCandidate>,
    failed: bool,
    done: bool,
}

impl ResolveJob {
    /// Fork the resolver child and start watching its pipe.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        host: &str,
        port: u16,
        mode: ResolverMode,
        conf: &ResolvConfWatcher,
    ) -> Result<Self, NetError> {
        // The pipe is registered with the reactor; fail before forking.
        tokio::runtime::Handle::try_current().map_err(|e| NetError::io(io::Error::other(e)))?;

        // Everything the child needs is prepared here: after fork it may not
        // allocate.
        let preset = literal_candidate(host, port).map(|candidate| {
            let mut wire = Vec::new();
            if mode == ResolverMode::Legacy && candidate.family() != AddressFamily::Inet {
                framing::encode_failure(&mut wire);
            } else {
                framing::encode_candidate(&candidate, &mut wire);
            }
            wire
        });
        if preset.is_none() {
            // Reload in the parent; the child inherits the fresh resolver state.
            conf.check();
        }
        let (c_host, c_service) = lookup_args(host, port)?;
        let hints = lookup_hints(mode);
        let (read_end, write_end) = cloexec_pipe().dns_context(host)?;

        // SAFETY: the child only runs async-signal-tolerant code and leaves
        // through `_exit`, never returning into Rust.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error()).dns_context(host);
        }
        if pid == 0 {
            // SAFETY: closing our copy of the read end; the OwnedFd is never dropped here.
            unsafe { libc::close(read_end.as_raw_fd()) };
            run_child(
                write_end.as_raw_fd(),
                preset.as_deref(),
                &c_host,
                &c_service,
                &hints,
                mode == ResolverMode::Legacy,
            );
        }

        drop(write_end);
        tracing::debug!(host = %host, port, pid, "resolver child started");

        let mut job = Self {
            host: host.to_string(),
            port,
            pid: Some(pid),
            pipe: None,
            decoder: FrameDecoder::new(host),
            candidates: Vec::new(),
            failed: false,
            done: false,
        };
        // On error `job` drops here, which kills and reaps the child.
        set_nonblocking(read_end.as_raw_fd())?;
        let pipe = AsyncFd::with_interest(File::from(read_end), Interest::READABLE)?;
        job.pipe = Some(pipe);
        Ok(job)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pid of the resolver child while it has not been reaped.
    pub fn child_pid(&self) -> Option<libc::pid_t> {
        self.pid
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Drain whatever the child has written so far.
    ///
    /// Resolves to the candidate list once the stream ends; an empty list
    /// means the lookup failed. After completion the child is reaped and the
    /// pipe is closed. Polling again after completion yields an empty list.
    pub fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<Vec<AddressCandidate>> {
        if self.done {
            return Poll::Ready(Vec::new());
        }
        loop {
            let Some(pipe) = self.pipe.as_ref() else {
                return Poll::Ready(self.finish());
            };
            let mut chunk = [0u8; 512];
            match ready!(poll_read_chunk(pipe, cx, &mut chunk)) {
                Ok(0) => return Poll::Ready(self.finish()),
                Ok(n) => {
                    if self.absorb(&chunk[..n]) {
                        return Poll::Ready(self.finish());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(host = %self.host, error = %e, "resolver pipe read failed");
                    self.failed = true;
                    return Poll::Ready(self.finish());
                }
            }
        }
    }

    /// Wait for the resolution to finish.
    pub async fn wait(&mut self) -> Vec<AddressCandidate> {
        poll_fn(|cx| self.poll_complete(cx)).await
    }

    /// Kill and reap the child, then close the pipe. Idempotent.
    pub fn cancel(&mut self) {
        if self.pid.is_some() {
            tracing::debug!(host = %self.host, pid = ?self.pid, "cancelling resolver child");
        }
        self.reap(true);
        self.pipe = None;
        self.done = true;
    }

    /// Feed a chunk to the decoder. Returns true once the stream is over.
    fn absorb(&mut self, data: &[u8]) -> bool {
        self.decoder.feed(data);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(Frame::Candidate(candidate))) => self.candidates.push(candidate),
                Ok(Some(Frame::Failure)) => {
                    tracing::debug!(host = %self.host, "resolver child reported lookup failure");
                    self.failed = true;
                    return true;
                }
                Ok(None) => return false,
                Err(e) => {
                    tracing::warn!(host = %self.host, error = %e, "bad record on resolver pipe");
                    self.failed = true;
                    return true;
                }
            }
        }
    }

    fn finish(&mut self) -> Vec<AddressCandidate> {
        // A child that is still writing after a bad record gets killed.
        let kill = self.failed && !self.decoder.is_finished();
        self.reap(kill);
        self.pipe = None;
        self.done = true;

        if self.failed {
            self.candidates.clear();
        }
        tracing::debug!(
            host = %self.host,
            count = self.candidates.len(),
            "resolver child finished"
        );
        std::mem::take(&mut self.candidates)
    }

    fn reap(&mut self, kill: bool) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        if kill {
            // SAFETY: pid is our own unreaped child.
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        let mut status = 0;
        loop {
            // SAFETY: as above; status is a valid out pointer.
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::warn!(pid, error = %err, "failed to reap resolver child");
                break;
            }
        }
    }
}

impl Drop for ResolveJob {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn poll_read_chunk(
    pipe: &AsyncFd<File>,
    cx: &mut Context<'_>,
    buf: &mut [u8],
) -> Poll<io::Result<usize>> {
    loop {
        let mut guard = ready!(pipe.poll_read_ready(cx))?;
        match guard.try_io(|inner| inner.get_ref().read(buf)) {
            Ok(result) => return Poll::Ready(result),
            Err(_would_block) => continue,
        }
    }
}

/// Body of the resolver child. Never returns.
fn run_child(
    fd: RawFd,
    preset: Option<&[u8]>,
    host: &CStr,
    service: &CStr,
    hints: &libc::addrinfo,
    legacy: bool,
) -> ! {
    if let Some(wire) = preset {
        write_all_raw(fd, wire);
    } else {
        match AddrInfoList::lookup(host, service, hints) {
            Ok(list) => {
                for ai in list.iter() {
                    let len = if ai.ai_addr.is_null() { 0 } else { ai.ai_addrlen as usize };
                    let header =
                        framing::encode_header(ai.ai_family, ai.ai_socktype, ai.ai_protocol, len as i32);
                    if !write_all_raw(fd, &header) {
                        break;
                    }
                    if len > 0 {
                        // SAFETY: ai_addr points at ai_addrlen bytes.
                        let addr = unsafe { std::slice::from_raw_parts(ai.ai_addr as *const u8, len) };
                        if !write_all_raw(fd, addr) {
                            break;
                        }
                    }
                    if legacy {
                        break;
                    }
                }
            }
            Err(_) => {
                write_all_raw(fd, &framing::failure_header());
            }
        }
    }
    // SAFETY: terminate the child without running any parent destructors.
    unsafe { libc::_exit(0) }
}

fn write_all_raw(fd: RawFd, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        // SAFETY: buf is a valid slice for its whole length.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return false;
        }
        if n == 0 {
            return false;
        }
        buf = &buf[n as usize..];
    }
    true
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    #[cfg(target_os = "linux")]
    // SAFETY: fds has room for the two descriptors.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    #[cfg(not(target_os = "linux"))]
    // SAFETY: as above.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors are freshly created and owned by nobody else.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(target_os = "linux"))]
    for fd in [fds[0], fds[1]] {
        // SAFETY: fd is valid and owned by `pair`.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(pair)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
