//! Advisory cross-process lock files.
//!
//! A lock is a file created with `create_new`, which gives single-winner
//! semantics per path. Each lease writes a unique token into the file and on
//! drop removes the file only while it still holds that token. Acquisition
//! polls with a bounded wait; on timeout callers fail open and proceed
//! unlocked. Lock files are never reclaimed by age, so a slow holder keeps
//! its lock.

use crate::core::error::TagError;
use crate::core::time;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_BASE_MS: u64 = 10;
const POLL_JITTER_MS: u64 = 25;

#[derive(Debug)]
pub struct LockLease {
    path: PathBuf,
    token: String,
    _file: File,
}

impl LockLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        // Someone else may have replaced the file; only remove our own.
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim_end() == self.token => {
                let _ = fs::remove_file(&self.path);
            }
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "lock file changed owner; leaving it");
            }
            Err(_) => {}
        }
    }
}

/// Outcome of a bounded acquisition.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockLease),
    /// Timed out; the caller proceeds without the lock.
    FailedOpen { waited: Duration },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

pub fn try_acquire_lock(lock_path: &Path) -> Result<Option<LockLease>, TagError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = match OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => return Err(TagError::IoError(err)),
    };
    let token = format!("pid={} id={}", std::process::id(), time::new_event_id());
    if let Err(err) = writeln!(file, "{}", token) {
        let _ = fs::remove_file(lock_path);
        return Err(TagError::IoError(err));
    }

    Ok(Some(LockLease {
        path: lock_path.to_path_buf(),
        token,
        _file: file,
    }))
}

/// Polls for the lock until `timeout` elapses. Never blocks past the timeout.
pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> Result<LockOutcome, TagError> {
    let started = Instant::now();
    loop {
        if let Some(lease) = try_acquire_lock(lock_path)? {
            return Ok(LockOutcome::Acquired(lease));
        }
        let waited = started.elapsed();
        if waited >= timeout {
            tracing::warn!(
                path = %lock_path.display(),
                waited_ms = waited.as_millis() as u64,
                "lock wait timed out; proceeding without lock"
            );
            return Ok(LockOutcome::FailedOpen { waited });
        }
        let remaining = timeout - waited;
        let nap = Duration::from_millis(POLL_BASE_MS + jitter_ms(POLL_JITTER_MS));
        std::thread::sleep(nap.min(remaining));
    }
}

fn jitter_ms(max_exclusive: u64) -> u64 {
    if max_exclusive <= 1 {
        return 0;
    }
    time::now_epoch_millis() % max_exclusive
}
