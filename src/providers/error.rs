/// Provider-specific error with retry classification
///
/// Storage engines return this error type so the instance store can decide
/// whether to retry an operation and how to surface it to the dispatcher.
///
/// # Error Classification
///
/// **Retryable (`is_retryable() == true`)**:
/// - Database busy/locked
/// - Connection timeouts
/// - Network failures
///
/// **Non-retryable**:
/// - Missing instance (`NotFound`)
/// - Stale version on write (`VersionConflict`)
/// - Owner lease no longer valid (`LeaseLost`)
/// - Constraint violations, corrupt rows, configuration errors (`Permanent`)
///
/// # Example Usage
///
/// ```rust,no_run
/// use durohost::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("write_instance", "Database is busy"));
/// # }
/// # fn example2() -> Result<(), ProviderError> {
/// return Err(ProviderError::version_conflict("write_instance", "expected version 3"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "read_instance", "claim_runnable")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transient,
    Permanent,
    NotFound,
    VersionConflict,
    LeaseLost,
}

impl ProviderError {
    fn with_kind(operation: impl Into<String>, message: impl Into<String>, kind: ProviderErrorKind) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(operation, message, ProviderErrorKind::Transient)
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(operation, message, ProviderErrorKind::Permanent)
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(operation, message, ProviderErrorKind::NotFound)
    }

    pub fn version_conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(operation, message, ProviderErrorKind::VersionConflict)
    }

    /// The owner named in the call is unknown or expired.
    pub fn lease_lost(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(operation, message, ProviderErrorKind::LeaseLost)
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_error() {
        let err = ProviderError::retryable("test_op", "Database busy");
        assert!(err.is_retryable());
        assert_eq!(err.operation, "test_op");
        assert_eq!(err.message, "Database busy");
        assert_eq!(err.kind, ProviderErrorKind::Transient);
    }

    #[test]
    fn test_non_retryable_kinds() {
        for err in [
            ProviderError::permanent("op", "corrupt"),
            ProviderError::not_found("op", "missing"),
            ProviderError::version_conflict("op", "stale"),
            ProviderError::lease_lost("op", "expired"),
        ] {
            assert!(!err.is_retryable(), "{err:?}");
        }
    }

    #[test]
    fn test_display() {
        let err = ProviderError::retryable("write_instance", "Database busy");
        assert_eq!(err.to_string(), "write_instance: Database busy");
    }
}
