//! Engine error model.
//!
//! ```text
//!   DomainError ──────────────┐
//!   StoreError ──► (FK?) ─────┼──► EngineError
//!   flush: 0 rows affected ───┘        │
//!                                      ├─ is_optimistic_locking()  → safe to retry from scratch
//!                                      └─ is_retryable()
//! ```

use thiserror::Error;
use uuid::Uuid;

use txflow_core::{DomainError, EntityType};

use crate::db::operation::OperationKind;
use crate::store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

/// A revision-checked statement affected no row, or a foreign key violation
/// was mapped to a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Execution of '{operation} {entity_type}[{entity_id}]' failed. {reason}")]
pub struct OptimisticLockingError {
    pub operation: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub reason: String,
}

impl OptimisticLockingError {
    pub const CONCURRENT_UPDATE: &'static str = "Entity was updated by another transaction concurrently.";

    pub fn concurrent_update(operation: OperationKind, entity_type: EntityType, entity_id: Uuid) -> Self {
        Self {
            operation,
            entity_type,
            entity_id,
            reason: Self::CONCURRENT_UPDATE.to_string(),
        }
    }

    pub fn foreign_key(operation: OperationKind, entity_type: EntityType, entity_id: Uuid, code: &str) -> Self {
        Self {
            operation,
            entity_type,
            entity_id,
            reason: format!(
                "Foreign key constraint {code} violated; a referenced entity was modified by another transaction concurrently."
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    OptimisticLocking(#[from] OptimisticLockingError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Referential integrity violation that was not mapped to a conflict.
    #[error("foreign key violation ({code}): {message}")]
    ForeignKeyViolation { code: String, message: String },

    #[error("store error: {0}")]
    Store(StoreError),

    /// A job handler or event trigger reported a failure.
    #[error("handler failed: {message}")]
    Handler {
        message: String,
        details: Option<String>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::ForeignKeyViolation { code, message } => {
                EngineError::ForeignKeyViolation { code, message }
            }
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            details: None,
        }
    }

    pub fn handler_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, EngineError::OptimisticLocking(_))
    }

    /// Whether re-running the whole command from fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::OptimisticLocking(_)
                | EngineError::Store(StoreError::LockWaitTimeout { .. })
        )
    }

    /// Detail text recorded alongside the message on a failed job.
    pub fn details(&self) -> Option<String> {
        match self {
            EngineError::Handler { details, .. } => details.clone(),
            other => Some(format!("{other:?}")),
        }
    }
}
