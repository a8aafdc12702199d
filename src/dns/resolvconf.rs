//! Resolver configuration reload.
//!
//! The C resolver reads its configuration once per process. The watcher
//! compares the configuration file's modification time at the start of every
//! resolution and re-initialises the resolver when it moved.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" {
    #[link_name = "__res_init"]
    fn res_init() -> libc::c_int;
}

/// Tracks the modification time of the resolver configuration file.
#[derive(Debug)]
pub struct ResolvConfWatcher {
    path: PathBuf,
    last_mtime: Mutex<Option<SystemTime>>,
    reloads: AtomicU64,
}

impl ResolvConfWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_mtime = Mutex::new(modified(&path));
        Self {
            path,
            last_mtime,
            reloads: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the resolver if the file changed since the last check.
    ///
    /// Returns true when a reload happened.
    pub fn check(&self) -> bool {
        let current = modified(&self.path);
        let mut last = match self.last_mtime.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.is_none() || current == *last {
            return false;
        }
        *last = current;
        drop(last);

        match reload_system_resolver() {
            Ok(()) => tracing::debug!(path = %self.path.display(), "resolver configuration reloaded"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "resolver reload failed"),
        }
        self.reloads.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Number of reloads triggered so far.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn reload_system_resolver() -> io::Result<()> {
    // SAFETY: plain libc call without arguments.
    if unsafe { res_init() } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn reload_system_resolver() -> io::Result<()> {
    // Other libcs re-read the file on their own.
    Ok(())
}
