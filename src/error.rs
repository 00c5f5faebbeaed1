//! Error types for the stackplan provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state persistence, provider calls,
//! and plan application.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stackplan.
#[derive(Debug, Error)]
pub enum StackplanError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Graph construction and planning errors.
    #[error("Planning error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider operation errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Plan application errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A unit name given on the command line is not declared.
    #[error("Unknown unit '{name}'")]
    UnknownUnit {
        /// The requested unit name.
        name: String,
    },

    /// A reference string could not be parsed.
    #[error("Invalid reference '{value}': {reason}")]
    InvalidReference {
        /// The offending reference text.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Graph construction and plan resolution errors.
///
/// All of these are raised before any provider call is made.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node id was declared twice in the same unit.
    #[error("Duplicate resource id '{id}' in unit '{unit}'")]
    DuplicateId {
        /// Unit the duplicate was added to.
        unit: String,
        /// The duplicated id.
        id: String,
    },

    /// A node references an id or input that does not exist.
    #[error("Resource '{node}' in unit '{unit}' references unknown '{reference}'")]
    UnresolvedReference {
        /// Unit containing the node.
        unit: String,
        /// Node holding the reference.
        node: String,
        /// The reference that did not resolve.
        reference: String,
    },

    /// The dependency relation contains a cycle.
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Ids participating in the cycle, in path order, first id repeated last.
        cycle: Vec<String>,
    },

    /// A cross-unit input points at an output the upstream unit does not have.
    #[error("Unit '{unit}' input '{input}' needs output '{output}' of '{source_unit}.{node}', which is not provisioned")]
    MissingUnitOutput {
        /// Consuming unit.
        unit: String,
        /// Input name in the consuming unit.
        input: String,
        /// Producing unit.
        source_unit: String,
        /// Producing node.
        node: String,
        /// Missing output name.
        output: String,
    },

    /// A referenced unit does not exist in the configuration.
    #[error("Unit '{unit}' input '{input}' references unknown unit '{target}'")]
    UnknownUnit {
        /// Consuming unit.
        unit: String,
        /// Input name.
        input: String,
        /// The unknown unit name.
        target: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The stored version advanced since the snapshot was read.
    #[error("State for unit '{unit}' was modified concurrently (expected version {expected}, found {found}); re-read state and re-plan")]
    ConcurrentModification {
        /// Unit whose state was contended.
        unit: String,
        /// Version the writer based its changes on.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State write guard is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Backend storage error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    FormatMismatch {
        /// Expected format version.
        expected: String,
        /// Found format version.
        found: String,
    },
}

/// Provider operation errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider asked the caller to slow down.
    #[error("Provider throttled the request, retry after {retry_after_secs} seconds")]
    Throttled {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// A transient failure that may succeed on retry.
    #[error("Transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The resource does not exist on the provider side.
    #[error("Resource not found: {kind} '{id}'")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Physical id.
        id: String,
    },

    /// The provider rejected the request.
    #[error("Provider rejected the request ({status}): {message}")]
    Rejected {
        /// Status code reported by the provider.
        status: u16,
        /// Message from the provider.
        message: String,
    },

    /// The provider returned something the engine cannot interpret.
    #[error("Invalid provider response: {message}")]
    InvalidResponse {
        /// Description of the problem.
        message: String,
    },

    /// Retry budget exhausted for a node operation.
    #[error("Giving up on '{node}' after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Node the operation was for.
        node: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last error observed.
        last: Box<ProviderError>,
    },
}

/// Plan application errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A node operation failed; state reflects exactly the applied prefix.
    #[error("Apply stopped at '{failed}' (last applied: {}): {source}", .last_applied.as_deref().unwrap_or("none"))]
    PartialApply {
        /// Last node whose result was persisted.
        last_applied: Option<String>,
        /// Node whose operation failed.
        failed: String,
        /// Underlying failure.
        source: Box<StackplanError>,
    },

    /// The run was cancelled after in-flight operations finished.
    #[error("Apply cancelled (last applied: {})", .last_applied.as_deref().unwrap_or("none"))]
    Cancelled {
        /// Last node whose result was persisted.
        last_applied: Option<String>,
    },

    /// The plan violates configured guardrails.
    #[error("Plan for unit '{unit}' violates guardrails: {}", .violations.join("; "))]
    GuardrailViolation {
        /// Unit the plan belongs to.
        unit: String,
        /// Individual violations.
        violations: Vec<String>,
    },
}

/// Result type alias for stackplan operations.
pub type Result<T> = std::result::Result<T, StackplanError>;

impl StackplanError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockedByOther { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(e) => e.retry_after_secs(),
            Self::State(StateError::LockedByOther { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if this is a concurrent state modification.
    #[must_use]
    pub const fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::State(StateError::ConcurrentModification { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transient { .. })
    }

    /// Returns the provider-requested delay, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Throttled { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttled_is_retryable() {
        let err = StackplanError::from(ProviderError::Throttled { retry_after_secs: 7 });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(7));
    }

    #[test]
    fn test_rejected_is_not_retryable() {
        let err = StackplanError::from(ProviderError::rejected(400, "bad cidr"));
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }

    #[test]
    fn test_cycle_message_names_ids() {
        let err = GraphError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_partial_apply_message() {
        let err = ApplyError::PartialApply {
            last_applied: Some(String::from("storage")),
            failed: String::from("service"),
            source: Box::new(ProviderError::rejected(409, "conflict").into()),
        };
        let message = err.to_string();
        assert!(message.contains("'service'"));
        assert!(message.contains("last applied: storage"));
    }
}
