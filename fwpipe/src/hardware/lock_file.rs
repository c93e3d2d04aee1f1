//! Hardware locks shared between processes on one host.
//!
//! Each resource maps to `<dir>/<resource>.lock`. Ownership is an exclusive
//! advisory lock (`flock`) on that file, so the kernel releases it when the
//! holder exits, however it exits. The holder's pid is written into the
//! file for operators; it plays no part in deciding ownership.

use super::{is_valid_resource_name, HardwareLease, HardwareLock};
use crate::cancellation::CancellationToken;
use crate::errors::HardwareAcquisitionError;
use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(unix)]
type LockHandle = nix::fcntl::Flock<std::fs::File>;
#[cfg(not(unix))]
type LockHandle = std::fs::File;

/// Lock-file backed hardware registry.
#[derive(Debug, Clone)]
pub struct LockFileLocks {
    dir: PathBuf,
    poll_interval: Duration,
}

impl LockFileLocks {
    /// Creates a registry storing lock files under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets how often a busy lock is re-checked.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the lock directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the lock file path for `resource`.
    #[must_use]
    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{resource}.lock"))
    }
}

struct LockFileGuard {
    path: PathBuf,
    lock: Option<LockHandle>,
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        // Unix unlinks while still holding the lock; a waiter that opened
        // the old inode notices the swap and retries.
        #[cfg(not(unix))]
        drop(self.lock.take());
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        }
        drop(self.lock.take());
    }
}

fn write_owner(mut file: &std::fs::File) -> io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

/// Takes the lock at `path` without blocking, returning `None` if another
/// holder has it.
#[cfg(unix)]
fn try_lock(path: &Path) -> io::Result<Option<LockFileGuard>> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    use std::os::unix::fs::MetadataExt;

    loop {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Ok(None),
            Err((_, errno)) => return Err(errno.into()),
        };

        // The previous holder may have unlinked the file after we opened it.
        let held = lock.metadata()?;
        match std::fs::metadata(path) {
            Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {}
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }

        write_owner(&lock)?;
        return Ok(Some(LockFileGuard {
            path: path.to_path_buf(),
            lock: Some(lock),
        }));
    }
}

#[cfg(not(unix))]
fn try_lock(path: &Path) -> io::Result<Option<LockFileGuard>> {
    match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => {
            write_owner(&file)?;
            Ok(Some(LockFileGuard {
                path: path.to_path_buf(),
                lock: Some(file),
            }))
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl HardwareLock for LockFileLocks {
    async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HardwareLease, HardwareAcquisitionError> {
        let backend = |e: io::Error| HardwareAcquisitionError::backend(resource, e.to_string());

        if !is_valid_resource_name(resource) {
            return Err(HardwareAcquisitionError::backend(
                resource,
                "resource name cannot be used as a lock file name",
            ));
        }
        tokio::fs::create_dir_all(&self.dir).await.map_err(backend)?;
        let path = self.lock_path(resource);
        let deadline = Instant::now() + timeout;

        loop {
            let attempt_path = path.clone();
            let locked = tokio::task::spawn_blocking(move || try_lock(&attempt_path))
                .await
                .map_err(|e| HardwareAcquisitionError::backend(resource, e.to_string()))?
                .map_err(backend)?;
            if let Some(guard) = locked {
                debug!(resource, path = %path.display(), "Hardware lock file held");
                return Ok(HardwareLease::new(resource, guard));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HardwareAcquisitionError::timeout(resource, timeout));
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => {
                    return Err(HardwareAcquisitionError::Cancelled { resource: resource.to_string() });
                }
            }
        }
    }
}
