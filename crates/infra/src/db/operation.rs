use core::fmt;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use txflow_core::{EntityKey, EntityType};

use crate::store::{FieldFilter, FieldPatch};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    BulkUpdate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::BulkUpdate => "UPDATE_BULK",
        })
    }
}

/// Set-oriented statement registered by a command (cascades).
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    pub entity_type: EntityType,
    pub filter: FieldFilter,
    pub patch: FieldPatch,
    /// Bump the revision of every affected row so that concurrent
    /// revision-checked writers of those rows lose.
    pub increment_revision: bool,
}

/// One statement of a flush.
#[derive(Debug, Clone, PartialEq)]
pub enum DbOperation {
    Insert {
        key: EntityKey,
        payload: JsonValue,
        references: Vec<EntityKey>,
    },
    Update {
        key: EntityKey,
        expected_revision: u32,
        payload: JsonValue,
        references: Vec<EntityKey>,
    },
    Delete {
        key: EntityKey,
        expected_revision: u32,
    },
    BulkUpdate(BulkUpdate),
}

impl DbOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            DbOperation::Insert { .. } => OperationKind::Insert,
            DbOperation::Update { .. } => OperationKind::Update,
            DbOperation::Delete { .. } => OperationKind::Delete,
            DbOperation::BulkUpdate(_) => OperationKind::BulkUpdate,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            DbOperation::Insert { key, .. }
            | DbOperation::Update { key, .. }
            | DbOperation::Delete { key, .. } => key.entity_type,
            DbOperation::BulkUpdate(bulk) => bulk.entity_type,
        }
    }

    /// Target row; `None` for bulk statements.
    pub fn key(&self) -> Option<EntityKey> {
        match self {
            DbOperation::Insert { key, .. }
            | DbOperation::Update { key, .. }
            | DbOperation::Delete { key, .. } => Some(*key),
            DbOperation::BulkUpdate(_) => None,
        }
    }

    pub fn entity_id(&self) -> Option<Uuid> {
        self.key().map(|k| k.id)
    }
}

impl fmt::Display for DbOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{} {}", self.kind(), key),
            None => write!(f, "{} {}", self.kind(), self.entity_type()),
        }
    }
}
