use std::fmt;

/// What went wrong in the store, as far as the runtime cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Busy, locked or unreachable database. The only kind worth repeating.
    Unavailable,
    /// A uniqueness or key constraint rejected the write.
    Conflict,
    /// The committing executor no longer owns the instance; it was released
    /// or recovered by a peer.
    NotOwned,
    /// A referenced row does not exist.
    NotFound,
    /// A stored row cannot be decoded (unknown status, malformed variables).
    Corrupt,
    /// The request itself is malformed (unresolved initial state, unencodable
    /// variables).
    Invalid,
}

/// Error returned by every [`Provider`](super::Provider) operation.
///
/// The dispatcher never stops on one of these. `Unavailable` errors are
/// logged and retried after the error backoff; `NotOwned` from `persist`
/// means another executor holds the instance now, so the caller drops its
/// result instead of releasing anything.
///
/// ```rust
/// use durastate::providers::{ProviderError, ProviderErrorKind};
///
/// let lost = ProviderError::not_owned("persist", 42, 7);
/// assert_eq!(lost.kind, ProviderErrorKind::NotOwned);
/// assert!(!lost.is_retryable());
/// assert_eq!(lost.to_string(), "persist: instance 42 is not owned by executor 7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, operation, message)
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Conflict, operation, message)
    }

    pub fn not_owned(operation: impl Into<String>, instance_id: i64, executor_id: i64) -> Self {
        Self::new(
            ProviderErrorKind::NotOwned,
            operation,
            format!("instance {instance_id} is not owned by executor {executor_id}"),
        )
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, operation, message)
    }

    pub fn corrupt(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Corrupt, operation, message)
    }

    pub fn invalid(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Invalid, operation, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Unavailable
    }

    pub fn is_not_owned(&self) -> bool {
        self.kind == ProviderErrorKind::NotOwned
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
