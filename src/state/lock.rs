//! Write guard for file-based state.
//!
//! A lock file created with exclusive-create semantics serialises the
//! read-compare-write sequence of a conditional save, so two processes
//! cannot both pass the version check. Locks carry an expiry so a crashed
//! writer cannot block the unit forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StackplanError, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 60;

/// Attempts made to take a contended lock before giving up.
const ACQUIRE_ATTEMPTS: u32 = 50;

/// Pause between acquisition attempts.
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(20);

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Unit the lock guards.
    pub unit: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

/// A held lock file; released with [`FileLock::release`].
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    info: LockInfo,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str, unit: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            unit: unit.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

impl FileLock {
    /// Takes the lock at `path` for `unit`.
    ///
    /// A live lock held by someone else is waited on briefly; an expired one
    /// is broken.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if the lock stays held, or a backend error if
    /// the lock file cannot be written.
    pub async fn acquire(path: &Path, unit: &str) -> Result<Self> {
        let info = LockInfo::new(&holder_id(), unit);
        let content = serde_json::to_vec(&info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::create(path, &content).await {
                Ok(()) => {
                    debug!("Acquired state lock {} for {unit}", info.lock_id);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        info,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(StateError::backend(format!(
                        "Failed to create lock file {}: {e}",
                        path.display()
                    ))
                    .into());
                }
            }

            let existing = Self::read(path).await?;
            let modified = Self::modified(path).await;
            match existing {
                Some(existing) if existing.is_expired() => {
                    warn!(
                        "Breaking expired state lock held by {} since {}",
                        existing.holder, existing.acquired_at
                    );
                    Self::remove(path).await?;
                }
                None if modified.is_some_and(is_abandoned) => {
                    warn!("Breaking unreadable state lock {}", path.display());
                    Self::remove(path).await?;
                }
                existing if attempt >= ACQUIRE_ATTEMPTS => {
                    let (holder, since) = match existing {
                        Some(info) => (info.holder, info.acquired_at),
                        None => (
                            String::from("unknown"),
                            modified.map_or_else(Utc::now, DateTime::<Utc>::from),
                        ),
                    };
                    return Err(StateError::LockedByOther {
                        holder,
                        since: since.to_rfc3339(),
                    }
                    .into());
                }
                _ => tokio::time::sleep(ACQUIRE_BACKOFF).await,
            }
        }
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Releases the lock if it is still ours.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be read or removed.
    pub async fn release(self) -> Result<()> {
        match Self::read(&self.path).await? {
            Some(existing) if existing.lock_id == self.info.lock_id => {
                Self::remove(&self.path).await?;
                debug!("Released state lock {}", self.info.lock_id);
            }
            Some(existing) => {
                warn!(
                    "State lock {} was taken over by {}",
                    self.info.lock_id, existing.holder
                );
            }
            None => {}
        }
        Ok(())
    }

    async fn create(path: &Path, content: &[u8]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(content).await?;
        file.sync_all().await
    }

    /// Reads the lock file; `None` if it vanished or is being written.
    async fn read(path: &Path) -> Result<Option<LockInfo>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StackplanError::State(StateError::backend(format!(
                "Failed to read lock file {}: {e}",
                path.display()
            )))),
        }
    }

    /// Last write time of the lock file, if it still exists.
    async fn modified(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).await.ok()?.modified().ok()
    }

    async fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::backend(format!(
                "Failed to delete lock file {}: {e}",
                path.display()
            ))
            .into()),
        }
    }
}

/// A lock file that cannot be parsed is left behind by a writer that died
/// mid-write; once it is older than the expiry it is treated as stale.
fn is_abandoned(modified: SystemTime) -> bool {
    modified
        .elapsed()
        .is_ok_and(|age| age.as_secs() > LOCK_EXPIRY_SECS.unsigned_abs())
}

/// Identifies this process as a state writer: `<hostname>-<pid>`.
#[must_use]
pub fn writer_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    format!("{hostname}-{}", std::process::id())
}

/// Unique holder id for one lock acquisition.
fn holder_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", writer_id(), &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_info_expiry() {
        let info = LockInfo::new("holder", "network");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
        assert_eq!(info.unit, "network");
    }

    #[test]
    fn test_writer_id_is_stable_holder_id_unique() {
        assert_eq!(writer_id(), writer_id());
        assert_ne!(holder_id(), holder_id());
        assert!(holder_id().starts_with(&writer_id()));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.state.lock");

        let lock = FileLock::acquire(&path, "app").await.unwrap();
        assert!(path.exists());
        assert_eq!(lock.info().unit, "app");

        lock.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_expired_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.state.lock");

        let mut stale = LockInfo::new("crashed", "app");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = FileLock::acquire(&path, "app").await.unwrap();
        assert_ne!(lock.info().lock_id, stale.lock_id);
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_unreadable_lock_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.state.lock");
        std::fs::write(&path, "").unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), FileLock::acquire(&path, "app"))
            .await
            .unwrap();
        match result {
            Err(StackplanError::State(StateError::LockedByOther { holder, .. })) => {
                assert_eq!(holder, "unknown");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_old_unreadable_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.state.lock");
        std::fs::write(&path, "").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();

        let lock = tokio::time::timeout(Duration::from_secs(10), FileLock::acquire(&path, "app"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.info().unit, "app");
        lock.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_lock_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.state.lock");

        let held = LockInfo::new("other", "app");
        std::fs::write(&path, serde_json::to_string(&held).unwrap()).unwrap();

        let result = FileLock::acquire(&path, "app").await;
        assert!(matches!(
            result,
            Err(StackplanError::State(StateError::LockedByOther { .. }))
        ));
    }
}
