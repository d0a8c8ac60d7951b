//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, missing rows). Concurrency conflicts are not domain errors; they
/// surface from the persistence layer as optimistic locking failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested row does not exist.
    #[error("{entity} with id '{id}' not found")]
    NotFound { entity: String, id: String },

    /// An execution was targeted by a correlation but holds no matching subscription.
    #[error("execution with id '{execution_id}' does not have a subscription to a message event with name '{event_name}'")]
    NoMatchingSubscription {
        execution_id: String,
        event_name: String,
    },

    /// A correlation matched zero or several targets where exactly one was required.
    #[error("cannot correlate message '{message_name}': {reason}")]
    MismatchingCorrelation {
        message_name: String,
        reason: String,
    },

    /// The entity is in a state that does not permit the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Another worker currently holds the lock.
    #[error("{entity} '{id}' is locked by worker '{holder}'")]
    LockedByOtherWorker {
        entity: String,
        id: String,
        holder: String,
    },

    /// Cross-tenant access at the domain boundary.
    #[error("tenant mismatch: {0}")]
    TenantMismatch(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn no_matching_subscription(execution_id: impl ToString, event_name: impl Into<String>) -> Self {
        Self::NoMatchingSubscription {
            execution_id: execution_id.to_string(),
            event_name: event_name.into(),
        }
    }

    pub fn mismatching_correlation(message_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MismatchingCorrelation {
            message_name: message_name.into(),
            reason: reason.into(),
        }
    }

    pub fn locked_by_other(entity: impl Into<String>, id: impl ToString, holder: impl Into<String>) -> Self {
        Self::LockedByOtherWorker {
            entity: entity.into(),
            id: id.to_string(),
            holder: holder.into(),
        }
    }

    pub fn tenant_mismatch(msg: impl Into<String>) -> Self {
        Self::TenantMismatch(msg.into())
    }
}
