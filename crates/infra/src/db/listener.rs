//! Hooks consulted when a flush statement hits a conflict.
//!
//! Listeners are registered on a single command context; there is no global
//! registry. A conflict is thrown unless at least one applicable listener
//! answers [`OptimisticLockingResult::Ignore`].

use txflow_core::{EntityKey, EntityType};

use super::operation::DbOperation;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OptimisticLockingResult {
    Throw,
    Ignore,
}

pub trait OptimisticLockingListener: Send {
    /// Restrict to one entity type; `None` receives every failed operation.
    fn entity_type(&self) -> Option<EntityType> {
        None
    }

    fn failed_operation(&self, operation: &DbOperation) -> OptimisticLockingResult;
}

impl<F> OptimisticLockingListener for F
where
    F: Fn(&DbOperation) -> OptimisticLockingResult + Send,
{
    fn failed_operation(&self, operation: &DbOperation) -> OptimisticLockingResult {
        self(operation)
    }
}

/// Ignores conflicts on exactly one row.
#[derive(Debug, Clone, Copy)]
pub struct IgnoreConflictsOn(pub EntityKey);

impl OptimisticLockingListener for IgnoreConflictsOn {
    fn entity_type(&self) -> Option<EntityType> {
        Some(self.0.entity_type)
    }

    fn failed_operation(&self, operation: &DbOperation) -> OptimisticLockingResult {
        if operation.key() == Some(self.0) {
            OptimisticLockingResult::Ignore
        } else {
            OptimisticLockingResult::Throw
        }
    }
}
