//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Snapshots are stored per deployment unit and every write is conditional
//! on the version the writer last read.

use async_trait::async_trait;

use crate::error::{Result, StateError};

use super::types::{STATE_FORMAT, StateSnapshot};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot of `unit`.
    ///
    /// Returns an empty snapshot at version 0 if none was written yet.
    async fn load(&self, unit: &str) -> Result<StateSnapshot>;

    /// Writes `snapshot` if the stored version still equals
    /// `expected_version`, and returns the new version.
    ///
    /// Fails with `ConcurrentModification` otherwise.
    async fn save(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64>;

    /// Deletes the snapshot of `unit` if the stored version still equals
    /// `expected_version`.
    async fn delete(&self, unit: &str, expected_version: u64) -> Result<()>;

    /// Lists units that have a stored snapshot, sorted.
    async fn list_units(&self) -> Result<Vec<String>>;

    /// Gets the stored version of `unit`, 0 if none.
    async fn current_version(&self, unit: &str) -> Result<u64>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Fails with `ConcurrentModification` unless `found == expected`.
pub(crate) fn check_version(unit: &str, expected: u64, found: u64) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(StateError::ConcurrentModification {
            unit: unit.to_string(),
            expected,
            found,
        }
        .into())
    }
}

/// Serializes `snapshot` as it will be stored at `version`.
pub(crate) fn encode(snapshot: &StateSnapshot, version: u64) -> Result<String> {
    let mut stored = snapshot.clone();
    stored.version = version;
    serde_json::to_string_pretty(&stored)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
}

/// Parses a stored snapshot of `unit`.
pub(crate) fn decode(unit: &str, content: &str) -> Result<StateSnapshot> {
    let snapshot: StateSnapshot = serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse state of '{unit}': {e}")))?;

    if snapshot.format != STATE_FORMAT {
        return Err(StateError::FormatMismatch {
            expected: STATE_FORMAT.to_string(),
            found: snapshot.format,
        }
        .into());
    }

    if snapshot.unit != unit {
        return Err(StateError::corrupted(format!(
            "State stored for '{unit}' belongs to '{}'",
            snapshot.unit
        ))
        .into());
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sets_version() {
        let snapshot = StateSnapshot::new("network");
        let decoded = decode("network", &encode(&snapshot, 7).unwrap()).unwrap();
        assert_eq!(decoded.version, 7);
        assert_eq!(snapshot.version, 0);
    }

    #[test]
    fn test_decode_rejects_foreign_and_old_state() {
        let content = encode(&StateSnapshot::new("network"), 1).unwrap();
        assert!(decode("compute", &content).is_err());

        let mut old = StateSnapshot::new("network");
        old.format = String::from("0.1");
        let content = encode(&old, 1).unwrap();
        assert!(matches!(
            decode("network", &content),
            Err(crate::error::StackplanError::State(StateError::FormatMismatch { .. }))
        ));

        assert!(decode("network", "{not json").is_err());
    }

    #[test]
    fn test_check_version() {
        assert!(check_version("app", 2, 2).is_ok());
        assert!(check_version("app", 2, 3).unwrap_err().is_concurrent_modification());
    }
}
