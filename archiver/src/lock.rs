//! Process-wide advisory lock (§4.P), keyed by stanza, used to ensure
//! at-most-one async fetcher forks during an overlapping window (I4).
//!
//! Grounded in `fs2`, the same crate `neon`'s `safekeeper`/`pageserver`
//! depend on for single-instance advisory locking; the primary teacher
//! (`bottomless`) has no multi-process coordination of its own to draw on
//! here.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held only during the fork window (§5); never held across deadline waits.
pub struct StanzaLock {
    file: File,
    path: PathBuf,
}

impl StanzaLock {
    fn path_for(lock_dir: &Path, stanza: &str) -> PathBuf {
        lock_dir.join(format!("{stanza}-archive.lock"))
    }

    /// Attempts to acquire the lock without blocking. Returns `Ok(None)`
    /// when another process already holds it (§7 "Lock contention
    /// (expected)" — not fatal, the foreground simply skips the fork).
    pub fn try_acquire(lock_dir: &Path, stanza: &str) -> Result<Option<Self>> {
        std::fs::create_dir_all(lock_dir).context("creating lock directory")?;
        let path = Self::path_for(lock_dir, stanza);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StanzaLock { file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).with_context(|| format!("locking {}", path.display())),
        }
    }
}

impl Drop for StanzaLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = &self.path; // path kept for diagnostics/debug formatting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_blocked_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = StanzaLock::try_acquire(dir.path(), "main").unwrap();
        assert!(first.is_some());
        let second = StanzaLock::try_acquire(dir.path(), "main").unwrap();
        assert!(second.is_none());
        drop(first);
        let third = StanzaLock::try_acquire(dir.path(), "main").unwrap();
        assert!(third.is_some());
    }
}
