//! modelrun-gate: single-flight admission for a shared compute resource
//!
//! Every worker that wants to run an analysis on the same resource opens the
//! same lock file and takes an exclusive lock on it (`flock` on unix,
//! `File::try_lock` elsewhere). At most one process (or one open handle
//! within a process) holds the lock at a time.
//!
//! Acquisition never blocks indefinitely: [`ResourceGate::try_acquire`]
//! polls for up to a caller-supplied duration and then reports
//! [`Acquisition::Busy`], which callers translate into "reschedule later".
//! The lock is released when the returned [`ResourceLock`] is released or
//! dropped, so every exit path of the critical section gives it back.

pub mod error;

pub use error::GateError;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result type for gate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Default interval between lock attempts while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Outcome of a bounded acquisition attempt.
#[derive(Debug)]
pub enum Acquisition {
    /// The lock is held; release it by dropping or calling [`ResourceLock::release`].
    Held(ResourceLock),
    /// Another holder kept the lock for the whole wait.
    Busy { waited: Duration },
}

impl Acquisition {
    /// Whether the lock was acquired.
    pub fn is_held(&self) -> bool {
        matches!(self, Acquisition::Held(_))
    }
}

/// Named, file-backed mutual exclusion gate.
#[derive(Debug, Clone)]
pub struct ResourceGate {
    lock_path: PathBuf,
    poll_interval: Duration,
}

impl ResourceGate {
    /// Create a gate backed by the lock file at `lock_path`.
    ///
    /// The file is created on first use; its parent directory must exist or
    /// be creatable.
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the interval between attempts while waiting.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(GateError::InvalidConfig(
                "poll interval must be non-zero".to_string(),
            ));
        }
        self.poll_interval = poll_interval;
        Ok(self)
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Name of the lock, derived from the lock file name.
    pub fn lock_id(&self) -> String {
        self.lock_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.lock_path.display().to_string())
    }

    /// Single non-blocking attempt.
    ///
    /// Returns `Ok(None)` if another handle currently holds the lock.
    pub fn try_lock(&self) -> Result<Option<ResourceLock>> {
        let file = self.open_lock_file()?;
        match try_flock_exclusive(&file) {
            Ok(true) => Ok(Some(ResourceLock {
                file,
                path: self.lock_path.clone(),
                acquired_at: Instant::now(),
                released: false,
            })),
            Ok(false) => Ok(None),
            Err(source) => Err(GateError::Lock {
                path: self.lock_path.clone(),
                source,
            }),
        }
    }

    /// Try to take the lock, waiting up to `max_wait` for the current holder.
    ///
    /// Contention is reported as [`Acquisition::Busy`], not as an error.
    /// The call returns no later than one poll attempt after `max_wait`.
    pub async fn try_acquire(&self, max_wait: Duration) -> Result<Acquisition> {
        let start = Instant::now();
        loop {
            if let Some(lock) = self.try_lock()? {
                debug!(
                    lock = %self.lock_path.display(),
                    waited_ms = start.elapsed().as_millis() as u64,
                    "resource lock acquired"
                );
                return Ok(Acquisition::Held(lock));
            }

            let waited = start.elapsed();
            if waited >= max_wait {
                debug!(lock = %self.lock_path.display(), waited_ms = waited.as_millis() as u64, "resource lock busy");
                return Ok(Acquisition::Busy { waited });
            }
            let remaining = max_wait - waited;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// Check whether some other handle holds the lock right now.
    pub fn is_held(&self) -> Result<bool> {
        if !self.lock_path.exists() {
            return Ok(false);
        }
        // Acquiring and immediately dropping the probe is the only portable
        // way to observe flock state.
        Ok(self.try_lock()?.is_none())
    }

    fn open_lock_file(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| GateError::Open {
                    path: self.lock_path.clone(),
                    source,
                })?;
            }
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| GateError::Open {
                path: self.lock_path.clone(),
                source,
            })
    }
}

/// RAII guard for a held resource lock.
///
/// Dropping the guard releases the lock. [`ResourceLock::release`] does the
/// same but reports unlock failures to the caller.
#[derive(Debug)]
pub struct ResourceLock {
    file: File,
    path: PathBuf,
    acquired_at: Instant,
    released: bool,
}

impl ResourceLock {
    /// Path of the lock file this guard holds.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release the lock explicitly.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        unlock(&self.file).map_err(|source| GateError::Lock {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            lock = %self.path.display(),
            held_ms = self.held_for().as_millis() as u64,
            "resource lock released"
        );
        Ok(())
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Closing the descriptor releases the lock too; unlock first so the
        // release is visible before the file handle is torn down.
        if let Err(e) = unlock(&self.file) {
            warn!(lock = %self.path.display(), err = %e, "failed to unlock resource lock");
        } else {
            debug!(
                lock = %self.path.display(),
                held_ms = self.held_for().as_millis() as u64,
                "resource lock released on drop"
            );
        }
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if it is already
/// held through another open file description.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the duration
        // of the call. LOCK_EX | LOCK_NB never blocks.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        match file.try_lock() {
            Ok(()) => Ok(true),
            Err(std::fs::TryLockError::WouldBlock) => Ok(false),
            Err(std::fs::TryLockError::Error(err)) => Err(err),
        }
    }
}

fn unlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file`.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
    #[cfg(not(unix))]
    {
        file.unlock()
    }
}
