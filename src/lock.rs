use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOCK_FILE: &str = "ctxtap.lock";

/// State-directory lock guard: one service owns the slot file. Removes the
/// lock file on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_PAUSE: Duration = Duration::from_millis(50);

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file. Gone already counts as done; other errors are
    /// retried a few times before giving up.
    fn remove_file(&self) -> io::Result<()> {
        let mut attempt = 1;
        loop {
            match fs::remove_file(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt >= REMOVE_ATTEMPTS => return Err(e),
                Err(_) => {
                    attempt += 1;
                    std::thread::sleep(REMOVE_PAUSE);
                }
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::debug!(path = %self.path.display(), error = %e, "state lock unlock failed");
        }
        match self.remove_file() {
            Ok(()) => tracing::debug!(path = %self.path.display(), "state lock released"),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "stale lock file left behind")
            }
        }
    }
}

/// Acquire a non-blocking exclusive lock on `<state_dir>/ctxtap.lock`,
/// creating the directory when needed.
pub fn acquire_state_lock(state_dir: &Path) -> io::Result<StateLock> {
    fs::create_dir_all(state_dir)?;
    acquire_lock_at(&state_dir.join(LOCK_FILE))
}

/// Acquire a lock at a specific path.
pub fn acquire_lock_at(p: &Path) -> io::Result<StateLock> {
    if let Some(parent) = p.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(p)?;
    match f.try_lock_exclusive() {
        Ok(_) => {
            tracing::debug!(path = %p.display(), "state lock acquired");
            Ok(StateLock {
                file: f,
                path: p.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            tracing::error!(path = %p.display(), "state lock held by another process");
            Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "another ctxtap service already owns {} (lock held)",
                    p.parent().unwrap_or(p).display()
                ),
            ))
        }
        Err(e) => Err(e),
    }
}
