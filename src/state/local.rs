//! Local file-based state storage backend.
//!
//! Each unit is stored as `<dir>/<unit>.state.json`. A save takes the
//! unit's lock file, re-reads the stored version, and only then writes the
//! new snapshot through a temporary file and an atomic rename.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StackplanError, StateError};

use super::lock::FileLock;
use super::store::{StateStore, check_version, decode, encode};
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackplan";

/// Suffix of state files.
const STATE_SUFFIX: &str = ".state.json";

/// Suffix of lock files.
const LOCK_SUFFIX: &str = ".state.lock";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Directory holding one file per unit.
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a store under `.stackplan` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackplanError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store in a custom directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory holding the state files.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn state_path(&self, unit: &str) -> PathBuf {
        self.base_dir.join(format!("{unit}{STATE_SUFFIX}"))
    }

    fn lock_path(&self, unit: &str) -> PathBuf {
        self.base_dir.join(format!("{unit}{LOCK_SUFFIX}"))
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the stored snapshot, if any.
    async fn read(&self, unit: &str) -> Result<Option<StateSnapshot>> {
        let path = self.state_path(unit);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read {}: {e}", path.display()))
        })?;
        decode(unit, &content).map(Some)
    }

    async fn stored_version(&self, unit: &str) -> Result<u64> {
        Ok(self.read(unit).await?.map_or(0, |s| s.version))
    }

    /// Writes the state file through a temporary file.
    async fn write(&self, unit: &str, content: &str) -> Result<()> {
        let path = self.state_path(unit);
        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create temp state file: {e}"))
        })?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::backend(format!("Failed to write state file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename state file: {e}")))?;
        Ok(())
    }

    async fn save_locked(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64> {
        let found = self.stored_version(&snapshot.unit).await?;
        check_version(&snapshot.unit, expected_version, found)?;

        let version = expected_version + 1;
        self.write(&snapshot.unit, &encode(snapshot, version)?).await?;
        Ok(version)
    }

    async fn delete_locked(&self, unit: &str, expected_version: u64) -> Result<()> {
        let found = self.stored_version(unit).await?;
        check_version(unit, expected_version, found)?;

        let path = self.state_path(unit);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|e| StateError::backend(format!("Failed to delete state file: {e}")))?;
        }
        Ok(())
    }
}

/// Releases a lock after the guarded write has already taken effect. A lock
/// left behind expires on its own, so failing here must not hide the write.
async fn release_quietly(lock: FileLock, unit: &str) {
    if let Err(e) = lock.release().await {
        warn!("Failed to release state lock of {unit}: {e}");
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, unit: &str) -> Result<StateSnapshot> {
        match self.read(unit).await? {
            Some(snapshot) => {
                info!(
                    "Loaded state of {unit} (version {}) from {}",
                    snapshot.version,
                    self.state_path(unit).display()
                );
                Ok(snapshot)
            }
            None => {
                debug!("No state for {unit} in {}", self.base_dir.display());
                Ok(StateSnapshot::new(unit))
            }
        }
    }

    async fn save(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64> {
        self.ensure_dir().await?;

        let lock = FileLock::acquire(&self.lock_path(&snapshot.unit), &snapshot.unit).await?;
        let result = self.save_locked(snapshot, expected_version).await;
        release_quietly(lock, &snapshot.unit).await;

        let version = result?;
        debug!("Saved state of {} at version {version}", snapshot.unit);
        Ok(version)
    }

    async fn delete(&self, unit: &str, expected_version: u64) -> Result<()> {
        if !self.base_dir.exists() {
            return check_version(unit, expected_version, 0);
        }

        let lock = FileLock::acquire(&self.lock_path(unit), unit).await?;
        let result = self.delete_locked(unit, expected_version).await;
        release_quietly(lock, unit).await;

        result?;
        info!("Deleted state of {unit}");
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| StateError::backend(format!("Failed to list state directory: {e}")))?;

        let mut units = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::backend(format!("Failed to list state directory: {e}")))?
        {
            if let Some(unit) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(STATE_SUFFIX))
            {
                units.push(unit.to_string());
            }
        }

        units.sort();
        Ok(units)
    }

    async fn current_version(&self, unit: &str) -> Result<u64> {
        self.stored_version(unit).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::assert_err;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join("state"));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut snapshot = store.load("network").await.unwrap();
        assert_eq!(snapshot.version, 0);
        snapshot.writer = Some(String::from("tester"));

        let version = store.save(&snapshot, 0).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.load("network").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.writer.as_deref(), Some("tester"));
        assert!(!store.lock_path("network").exists());
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let (store, _temp) = create_test_store();
        let snapshot = StateSnapshot::new("storage");

        store.save(&snapshot, 0).await.unwrap();
        let err = store.save(&snapshot, 0).await.unwrap_err();

        match err {
            StackplanError::State(StateError::ConcurrentModification { unit, expected, found }) => {
                assert_eq!(unit, "storage");
                assert_eq!(expected, 0);
                assert_eq!(found, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.lock_path("storage").exists());
    }

    #[tokio::test]
    async fn test_racing_writers_one_wins() {
        let (store, _temp) = create_test_store();
        let snapshot = StateSnapshot::new("compute");

        let (a, b) = tokio::join!(store.save(&snapshot, 0), store.save(&snapshot, 0));
        assert!(a.is_ok() != b.is_ok());
        assert_eq!(store.current_version("compute").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (store, _temp) = create_test_store();
        assert!(store.list_units().await.unwrap().is_empty());

        store.save(&StateSnapshot::new("storage"), 0).await.unwrap();
        store.save(&StateSnapshot::new("network"), 0).await.unwrap();
        assert_eq!(store.list_units().await.unwrap(), ["network", "storage"]);

        assert_err!(store.delete("network", 5).await);
        store.delete("network", 1).await.unwrap();
        assert_eq!(store.list_units().await.unwrap(), ["storage"]);
    }

    #[tokio::test]
    async fn test_failed_release_does_not_fail_write() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();
        let path = store.lock_path("network");

        let lock = FileLock::acquire(&path, "network").await.unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        release_quietly(lock, "network").await;
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_corrupted_state() {
        let (store, _temp) = create_test_store();
        store.ensure_dir().await.unwrap();
        std::fs::write(store.state_path("network"), "{ broken").unwrap();

        assert!(matches!(
            store.load("network").await,
            Err(StackplanError::State(StateError::Corrupted { .. }))
        ));
    }
}
