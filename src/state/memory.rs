//! In-memory state storage backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

use super::store::{StateStore, check_version};
use super::types::StateSnapshot;

/// State store keeping snapshots in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    units: Mutex<BTreeMap<String, StateSnapshot>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, unit: &str) -> Result<StateSnapshot> {
        let units = self.units.lock().await;
        Ok(units
            .get(unit)
            .cloned()
            .unwrap_or_else(|| StateSnapshot::new(unit)))
    }

    async fn save(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64> {
        let mut units = self.units.lock().await;
        let found = units.get(&snapshot.unit).map_or(0, |s| s.version);
        check_version(&snapshot.unit, expected_version, found)?;

        let mut stored = snapshot.clone();
        stored.version = expected_version + 1;
        debug!("Stored state of {} at version {}", stored.unit, stored.version);
        let version = stored.version;
        units.insert(snapshot.unit.clone(), stored);
        Ok(version)
    }

    async fn delete(&self, unit: &str, expected_version: u64) -> Result<()> {
        let mut units = self.units.lock().await;
        let found = units.get(unit).map_or(0, |s| s.version);
        check_version(unit, expected_version, found)?;
        units.remove(unit);
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        Ok(self.units.lock().await.keys().cloned().collect())
    }

    async fn current_version(&self, unit: &str) -> Result<u64> {
        Ok(self.units.lock().await.get(unit).map_or(0, |s| s.version))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_conditional_save() {
        let store = MemoryStateStore::new();
        let snapshot = StateSnapshot::new("app");

        assert_eq!(assert_ok!(store.save(&snapshot, 0).await), 1);
        assert_eq!(assert_ok!(store.save(&snapshot, 1).await), 2);

        let err = store.save(&snapshot, 1).await.unwrap_err();
        assert!(err.is_concurrent_modification());
        assert_eq!(store.load("app").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = MemoryStateStore::new();
        store.save(&StateSnapshot::new("b"), 0).await.unwrap();
        store.save(&StateSnapshot::new("a"), 0).await.unwrap();
        assert_eq!(store.list_units().await.unwrap(), ["a", "b"]);

        assert_err!(store.delete("a", 0).await);
        assert_ok!(store.delete("a", 1).await);
        assert_eq!(store.list_units().await.unwrap(), ["b"]);
        assert_eq!(store.current_version("a").await.unwrap(), 0);
    }
}
