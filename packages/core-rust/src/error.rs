//! Error taxonomy shared by every entity metadata provider.
//!
//! Expected control-flow outcomes (`NotFound`, `Conflict`,
//! `ConcurrencyConflict`) are ordinary variants so callers can match on them
//! and decide between retry-with-refetch and abort.

use thiserror::Error;

/// Errors returned by provider construction and provider operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Unknown provider type, missing or invalid backend options, or a
    /// backend schema that does not match the registered field schema.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection, open or authentication failure, or the provider is not
    /// initialized (or already closed).
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// Any other failure reported by the backend.
    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("{entity_type} entity '{entity_id}' not found")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },

    #[error("{entity_type} entity '{entity_id}' already exists")]
    Conflict {
        entity_type: String,
        entity_id: String,
    },

    #[error(
        "{entity_type} entity '{entity_id}' was modified: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        entity_type: String,
        entity_id: String,
        expected: String,
        actual: String,
    },

    /// Malformed query descriptor or a continuation token issued for a
    /// different query or provider instance.
    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    /// Field map or identifier rejected by the field type mapper.
    #[error("validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// A stored record could not be decoded into its logical fields.
    #[error("stored {entity_type} entity '{entity_id}' is unreadable: {message}")]
    CorruptRecord {
        entity_type: String,
        entity_id: String,
        message: String,
    },

    /// A bulk clear failed part-way through; `deleted` records are gone.
    #[error("clearing {entity_type} stopped after {deleted} deletions: {message}")]
    PartialClear {
        entity_type: String,
        deleted: u64,
        message: String,
    },
}

impl ProviderError {
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    #[must_use]
    pub fn conflict(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::Conflict {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    #[must_use]
    pub fn concurrency_conflict(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ConcurrencyConflict {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    #[must_use]
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![message.into()],
        }
    }

    #[must_use]
    pub fn corrupt(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::CorruptRecord {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;
