// ⚠️ Error Taxonomy
// Registry-time errors are fatal (programming errors, fail at startup).
// Per-entity failures are recorded in batch outcomes, never thrown.

use serde::{Deserialize, Serialize};

// ============================================================================
// REGISTRY-TIME ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Layer id was never registered
    UnknownLayer(String),

    /// Layer id registered twice
    DuplicateLayer(String),

    /// A produced field is already owned by another layer
    FieldOwnershipConflict {
        field: String,
        owner: String,
        claimant: String,
    },
}

impl CacheError {
    pub fn layer_id(&self) -> &str {
        match self {
            CacheError::UnknownLayer(id) => id,
            CacheError::DuplicateLayer(id) => id,
            CacheError::FieldOwnershipConflict { claimant, .. } => claimant,
        }
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::UnknownLayer(id) => write!(f, "unknown cache layer: {}", id),
            CacheError::DuplicateLayer(id) => write!(f, "cache layer already registered: {}", id),
            CacheError::FieldOwnershipConflict {
                field,
                owner,
                claimant,
            } => write!(
                f,
                "field '{}' is already produced by layer '{}' (claimed by '{}')",
                field, owner, claimant
            ),
        }
    }
}

impl std::error::Error for CacheError {}

// ============================================================================
// PER-ENTITY FAILURES
// ============================================================================

/// Why one entity failed inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum FailureReason {
    /// A required source field is missing or blank (permanent until the row changes)
    MissingSourceField { field: String },

    /// The source has no row for this key
    UnknownEntity,

    /// Compute function failed (transient, retry by re-running)
    ComputeError(String),

    /// Cache entry could not be written
    StoreError(String),
}

impl FailureReason {
    /// Short, stable name used in reports and counts
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::MissingSourceField { .. } => "MissingSourceField",
            FailureReason::UnknownEntity => "UnknownEntity",
            FailureReason::ComputeError(_) => "ComputeError",
            FailureReason::StoreError(_) => "StoreError",
        }
    }

    /// Source-side failures stay until the row changes; re-running will not help
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FailureReason::MissingSourceField { .. } | FailureReason::UnknownEntity
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MissingSourceField { field } => {
                write!(f, "MissingSourceField({})", field)
            }
            FailureReason::UnknownEntity => f.write_str("UnknownEntity"),
            FailureReason::ComputeError(detail) => write!(f, "ComputeError({})", detail),
            FailureReason::StoreError(detail) => write!(f, "StoreError({})", detail),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::FieldOwnershipConflict {
            field: "hr".to_string(),
            owner: "vitals".to_string(),
            claimant: "monitor".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("'hr'"));
        assert!(message.contains("'vitals'"));
        assert_eq!(err.layer_id(), "monitor");
    }

    #[test]
    fn test_cache_error_is_anyhow_compatible() {
        let err: anyhow::Error = CacheError::UnknownLayer("ghost".to_string()).into();

        assert_eq!(
            err.downcast_ref::<CacheError>(),
            Some(&CacheError::UnknownLayer("ghost".to_string()))
        );
    }

    #[test]
    fn test_failure_reason_kinds() {
        let missing = FailureReason::MissingSourceField {
            field: "raw_vitals_json".to_string(),
        };
        let compute = FailureReason::ComputeError("timeout".to_string());

        assert_eq!(missing.kind(), "MissingSourceField");
        assert_eq!(compute.kind(), "ComputeError");
        assert!(!missing.is_retryable());
        assert!(!FailureReason::UnknownEntity.is_retryable());
        assert!(compute.is_retryable());
        assert_eq!(compute.to_string(), "ComputeError(timeout)");
    }

    #[test]
    fn test_failure_reason_serializes_tagged() {
        let reason = FailureReason::ComputeError("boom".to_string());
        let json = serde_json::to_value(&reason).unwrap();

        assert_eq!(json["kind"], "ComputeError");
        assert_eq!(json["detail"], "boom");
    }
}
