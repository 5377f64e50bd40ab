//! Re-entrant cross-process file lock.
//!
//! Each store owns one lock file. The OS lock (`flock` on Unix, `LockFileEx`
//! on Windows, both through `fs2`) belongs to the open file handle, so the
//! counts below track how many callers inside *this* handle hold each kind:
//!
//! - shared while nothing is held takes the OS shared lock
//! - exclusive waits until no caller in this handle holds shared, since
//!   converting a `flock` releases it first
//! - shared while exclusive is held just counts
//! - releasing the last exclusive downgrades back to shared if nested
//!   shared holders remain, otherwise unlocks
//!
//! Lock order is always: file lock first, then the store's in-process lock.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Many holders, used by readers.
    Shared,
    /// One holder, used by writers.
    Exclusive,
}

impl LockKind {
    const fn name(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

#[derive(Debug, Default)]
struct Counts {
    shared: u32,
    exclusive: u32,
}

/// Advisory lock over a store's lock file.
#[derive(Debug)]
pub struct ProcessLock {
    id: String,
    path: PathBuf,
    file: File,
    counts: Mutex<Counts>,
    drained: Condvar,
    timeout: Option<Duration>,
}

impl ProcessLock {
    /// Opens (creating if needed) the lock file at `path`.
    ///
    /// `timeout` bounds how long [`ProcessLock::lock`] waits; `None` waits
    /// indefinitely.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(id: &str, path: &Path, timeout: Option<Duration>) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            id: id.to_string(),
            path: path.to_path_buf(),
            file,
            counts: Mutex::new(Counts::default()),
            drained: Condvar::new(),
            timeout,
        })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if the wait expires, or an I/O
    /// error from the OS.
    pub fn lock(&self, kind: LockKind) -> CoreResult<()> {
        let mut counts = self.counts.lock();
        match kind {
            LockKind::Shared => {
                if counts.shared > 0 || counts.exclusive > 0 {
                    counts.shared += 1;
                    return Ok(());
                }
                self.acquire(kind)?;
                counts.shared = 1;
            }
            LockKind::Exclusive => {
                if counts.exclusive > 0 {
                    counts.exclusive += 1;
                    return Ok(());
                }
                self.wait_for_readers(&mut counts)?;
                self.acquire(kind)?;
                counts.exclusive = 1;
            }
        }
        Ok(())
    }

    /// Releases one hold of `kind`.
    ///
    /// Releasing a kind that is not held is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to downgrade or unlock.
    pub fn unlock(&self, kind: LockKind) -> CoreResult<()> {
        let mut counts = self.counts.lock();
        match kind {
            LockKind::Shared => {
                if counts.shared == 0 {
                    return Ok(());
                }
                counts.shared -= 1;
                if counts.shared == 0 {
                    self.drained.notify_all();
                    if counts.exclusive == 0 {
                        FileExt::unlock(&self.file)?;
                    }
                }
            }
            LockKind::Exclusive => {
                if counts.exclusive == 0 {
                    return Ok(());
                }
                counts.exclusive -= 1;
                if counts.exclusive == 0 {
                    if counts.shared > 0 {
                        trace!(id = %self.id, "downgrading to shared lock");
                        FileExt::lock_shared(&self.file)?;
                    } else {
                        FileExt::unlock(&self.file)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Acquires the lock only if that needs no waiting.
    ///
    /// Returns `Ok(false)` if another handle holds a conflicting lock, or
    /// for exclusive, if a caller in this handle holds shared.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the OS.
    pub fn try_lock(&self, kind: LockKind) -> CoreResult<bool> {
        let mut counts = self.counts.lock();
        let held = match kind {
            LockKind::Shared if counts.shared > 0 || counts.exclusive > 0 => {
                counts.shared += 1;
                return Ok(true);
            }
            LockKind::Exclusive if counts.exclusive > 0 => {
                counts.exclusive += 1;
                return Ok(true);
            }
            LockKind::Exclusive if counts.shared > 0 => return Ok(false),
            LockKind::Shared => &mut counts.shared,
            LockKind::Exclusive => &mut counts.exclusive,
        };
        let attempt = match kind {
            LockKind::Shared => FileExt::try_lock_shared(&self.file),
            LockKind::Exclusive => FileExt::try_lock_exclusive(&self.file),
        };
        match attempt {
            Ok(()) => {
                *held = 1;
                Ok(true)
            }
            Err(e) if is_contended(&e) => {
                trace!(id = %self.id, kind = kind.name(), "lock busy");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`ProcessLock::lock`].
    pub fn guard(&self, kind: LockKind) -> CoreResult<LockGuard<'_>> {
        self.lock(kind)?;
        Ok(LockGuard {
            lock: Some(self),
            kind,
        })
    }

    /// Returns `(shared, exclusive)` hold counts.
    #[must_use]
    pub fn holds(&self) -> (u32, u32) {
        let counts = self.counts.lock();
        (counts.shared, counts.exclusive)
    }

    fn wait_for_readers(&self, counts: &mut MutexGuard<'_, Counts>) -> CoreResult<()> {
        if counts.shared == 0 {
            return Ok(());
        }
        trace!(id = %self.id, shared = counts.shared, "waiting for shared holders");
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        while counts.shared > 0 {
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(counts, deadline).timed_out() && counts.shared > 0 {
                        warn!(id = %self.id, "timed out waiting for shared holders");
                        return Err(self.timed_out(LockKind::Exclusive));
                    }
                }
                None => self.drained.wait(counts),
            }
        }
        Ok(())
    }

    fn timed_out(&self, kind: LockKind) -> CoreError {
        CoreError::LockTimeout {
            id: self.id.clone(),
            kind: kind.name(),
        }
    }

    fn acquire(&self, kind: LockKind) -> CoreResult<()> {
        let Some(timeout) = self.timeout else {
            match kind {
                LockKind::Shared => FileExt::lock_shared(&self.file)?,
                LockKind::Exclusive => FileExt::lock_exclusive(&self.file)?,
            }
            return Ok(());
        };

        let started = Instant::now();
        loop {
            let attempt = match kind {
                LockKind::Shared => FileExt::try_lock_shared(&self.file),
                LockKind::Exclusive => FileExt::try_lock_exclusive(&self.file),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if is_contended(&e) => {
                    if started.elapsed() >= timeout {
                        warn!(id = %self.id, kind = kind.name(), ?timeout, "lock wait timed out");
                        return Err(self.timed_out(kind));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let counts = self.counts.get_mut();
        if counts.shared > 0 || counts.exclusive > 0 {
            debug!(id = %self.id, "releasing lock held at drop");
            let _ = FileExt::unlock(&self.file);
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

/// RAII hold on a [`ProcessLock`].
///
/// A guard built with [`LockGuard::none`] holds nothing; stores that skip
/// file locking use it so callers do not branch.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: Option<&'a ProcessLock>,
    kind: LockKind,
}

impl LockGuard<'_> {
    /// A guard that holds nothing.
    #[must_use]
    pub const fn none(kind: LockKind) -> Self {
        Self { lock: None, kind }
    }

    /// Returns the kind this guard was taken with.
    #[must_use]
    pub const fn kind(&self) -> LockKind {
        self.kind
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            if let Err(e) = lock.unlock(self.kind) {
                warn!(id = %lock.id, error = %e, "failed to release lock");
            }
        }
    }
}
