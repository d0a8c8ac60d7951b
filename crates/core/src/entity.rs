//! The versioned-entity contract every persisted row satisfies.
//!
//! Rows are addressed by `(EntityType, Uuid)` and carry an integer `revision`
//! column. A row starts at revision 1 when inserted and every successful update
//! increments it by one. Update and delete statements are conditioned on the
//! revision that was read when the row was loaded; a statement that matches no
//! row means somebody else changed or removed it in the meantime.
//!
//! ```text
//!   load (rev = 3) ──► mutate in cache ──► UPDATE … WHERE id = ? AND rev = 3
//!                                               │
//!                                   1 row ◄─────┴─────► 0 rows
//!                               (rev becomes 4)      (optimistic locking failure)
//! ```

use core::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

/// Persisted entity kinds ("tables").
///
/// The declaration order is the canonical ordering used by the flush planner
/// for statements that do not depend on each other.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Execution,
    JobDefinition,
    ByteArray,
    EventSubscription,
    Variable,
    Job,
    ExternalTask,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::Execution,
        EntityType::JobDefinition,
        EntityType::ByteArray,
        EntityType::EventSubscription,
        EntityType::Variable,
        EntityType::Job,
        EntityType::ExternalTask,
    ];

    /// Name used in conflict messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            EntityType::Execution => "ExecutionEntity",
            EntityType::JobDefinition => "JobDefinitionEntity",
            EntityType::ByteArray => "ByteArrayEntity",
            EntityType::EventSubscription => "EventSubscriptionEntity",
            EntityType::Variable => "VariableInstanceEntity",
            EntityType::Job => "JobEntity",
            EntityType::ExternalTask => "ExternalTaskEntity",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address of a single row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: Uuid,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<Uuid>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity_type, self.id)
    }
}

/// A persisted record with a monotonically incrementing revision.
///
/// The serialized form (`serde`) is the row payload and doubles as the
/// "persistent state" used for dirty checking: an entity whose serialized form
/// did not change since it was loaded is not written back. Transient values
/// (lazily loaded caches etc.) must therefore be `#[serde(skip)]`.
pub trait VersionedEntity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const ENTITY_TYPE: EntityType;

    fn entity_id(&self) -> Uuid;

    fn revision(&self) -> u32;

    fn set_revision(&mut self, revision: u32);

    /// Revision the row will have after the next successful update.
    fn revision_next(&self) -> u32 {
        self.revision() + 1
    }

    /// Rows this entity references (foreign keys). Parents must exist before
    /// this row is inserted and may not be deleted while it exists.
    fn references(&self) -> Vec<EntityKey> {
        Vec::new()
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(Self::ENTITY_TYPE, self.entity_id())
    }
}

/// Revision expectation for a conditional write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Skip revision checking (bulk statements).
    Any,
    /// Require the row to be at an exact revision.
    Exact(u32),
}

impl ExpectedRevision {
    pub fn matches(self, actual: u32) -> bool {
        match self {
            ExpectedRevision::Any => true,
            ExpectedRevision::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u32) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::invalid_state(format!(
                "revision check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
