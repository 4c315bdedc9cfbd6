//! Error types for ledgerlink.
//!
//! Every fallible operation in the crate returns [`Result`]. Expected business
//! outcomes (insufficient balance, a reference that could not be matched) are
//! NOT errors: they are typed outcome enums on the engine that produced them.

use serde::Serialize;

/// The main error type for ledgerlink.
#[derive(Debug, thiserror::Error)]
pub enum LedgerLinkError {
    /// Input rejected before any mutation.
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// A customer link already exists for the reference or for the user.
    #[error("Link conflict for '{external_ref}' -> '{user_id}': {existing}")]
    Conflict {
        external_ref: String,
        user_id: String,
        existing: LinkOwner,
    },

    /// More than one local user is an equally valid candidate.
    #[error("Ambiguous match for '{external_ref}': {} candidates", .candidates.len())]
    AmbiguousMatch {
        external_ref: String,
        candidates: Vec<String>,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The payment processor could not be reached (retryable).
    #[error("Upstream unavailable during '{operation}': {message}")]
    UpstreamUnavailable { operation: String, message: String },

    /// A retryable operation kept failing until the retry budget ran out.
    #[error("Operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetryLimitExceeded {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// An inbound event could not be interpreted.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A store rejected or failed an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// The side of a link that caused a [`LedgerLinkError::Conflict`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkOwner {
    /// The reference is already linked to another user.
    ReferenceClaimedBy { user_id: String },
    /// The user is already linked to another reference.
    UserLinkedTo { external_ref: String },
}

impl std::fmt::Display for LinkOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReferenceClaimedBy { user_id } => {
                write!(f, "reference already linked to user '{}'", user_id)
            }
            Self::UserLinkedTo { external_ref } => {
                write!(f, "user already linked to '{}'", external_ref)
            }
        }
    }
}

/// Result type alias for ledgerlink operations.
pub type Result<T> = std::result::Result<T, LedgerLinkError>;

impl LedgerLinkError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn upstream(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable reason code used in admin results.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Conflict { .. } => "conflict",
            Self::AmbiguousMatch { .. } => "ambiguous_match",
            Self::NotFound { .. } => "not_found",
            Self::UpstreamUnavailable { .. } | Self::RetryLimitExceeded { .. } => {
                "upstream_unavailable"
            }
            Self::InvalidEvent(_) => "invalid_event",
            Self::Storage(_) => "storage_error",
            #[cfg(feature = "database")]
            Self::Database(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Check if this error is caused by the caller's input or by matching state.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::Conflict { .. }
                | Self::AmbiguousMatch { .. }
                | Self::NotFound { .. }
                | Self::InvalidEvent(_)
        )
    }

    /// Check if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }

    /// Check if the processor was unreachable, whether or not retries remain.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::RetryLimitExceeded { .. }
        )
    }
}
