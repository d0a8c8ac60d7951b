use core::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use txflow_core::{EntityKey, EntityType};

/// Handle of an open storage transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub(crate) u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// A stored row: revision column, JSON payload and outgoing foreign keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub revision: u32,
    pub payload: JsonValue,
    pub references: Vec<EntityKey>,
}

/// Equality conditions on top-level payload fields (`WHERE a = ? AND b = ?`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldFilter {
    conditions: Vec<(String, JsonValue)>,
}

impl FieldFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, payload: &JsonValue) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| payload.get(field) == Some(value))
    }
}

/// Field assignments (`SET a = ?, b = ?`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    assignments: Vec<(String, JsonValue)>,
}

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.assignments.push((field.into(), value.into()));
        self
    }

    pub fn apply(&self, payload: &mut JsonValue) {
        if let JsonValue::Object(map) = payload {
            for (field, value) in &self.assignments {
                map.insert(field.clone(), value.clone());
            }
        }
    }
}

/// Storage-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("foreign key constraint {code} violated: {message}")]
    ForeignKeyViolation { code: String, message: String },

    #[error("duplicate key {key}")]
    DuplicateKey { key: EntityKey },

    #[error("timed out waiting for row lock on {key}")]
    LockWaitTimeout { key: EntityKey },

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxId),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("store state poisoned by a panicking writer")]
    Poisoned,
}

impl StoreError {
    pub fn foreign_key(child: EntityType, parent: EntityType, message: impl Into<String>) -> Self {
        Self::ForeignKeyViolation {
            code: format!("FK_{}_{}", child.name(), parent.name()),
            message: message.into(),
        }
    }
}

/// Transactional row store with revision-checked writes.
///
/// ## Visibility
///
/// Reads see committed rows plus the transaction's own pending writes
/// (read-committed). Nothing a transaction writes is visible to others before
/// `commit`.
///
/// ## Row locks
///
/// Every write takes a row lock that is held until the transaction ends. A
/// writer that finds the row locked by another transaction waits until it is
/// released (bounded by the lock wait timeout) and then evaluates its condition
/// against the latest committed row. This is what turns a racing write into a
/// zero-row update instead of a lost update.
///
/// ## Affected rows
///
/// `update` and `delete` return the number of affected rows (0 or 1). A caller
/// that gets 0 knows the row was changed or removed since it read it.
pub trait EntityStore: Send + Sync {
    fn begin(&self) -> Result<TxId, StoreError>;

    fn commit(&self, tx: TxId) -> Result<(), StoreError>;

    fn rollback(&self, tx: TxId) -> Result<(), StoreError>;

    /// Plain read, never blocks.
    fn select(&self, tx: TxId, key: EntityKey) -> Result<Option<Row>, StoreError>;

    /// Forced read that takes the row lock first (`SELECT … FOR UPDATE`).
    ///
    /// Blocks while another transaction holds the lock and then returns the
    /// latest committed row, or `None` if it was deleted meanwhile.
    fn select_for_update(&self, tx: TxId, key: EntityKey) -> Result<Option<Row>, StoreError>;

    /// All rows of a type visible to `tx`, ordered by id.
    fn select_all(&self, tx: TxId, entity_type: EntityType) -> Result<Vec<(Uuid, Row)>, StoreError>;

    fn insert(
        &self,
        tx: TxId,
        key: EntityKey,
        payload: JsonValue,
        references: Vec<EntityKey>,
    ) -> Result<(), StoreError>;

    fn update(
        &self,
        tx: TxId,
        key: EntityKey,
        expected_revision: u32,
        payload: JsonValue,
        references: Vec<EntityKey>,
    ) -> Result<usize, StoreError>;

    fn delete(&self, tx: TxId, key: EntityKey, expected_revision: u32) -> Result<usize, StoreError>;

    /// Patch every row of `entity_type` matching `filter`.
    ///
    /// When `increment_revision` is false the statement does not interfere with
    /// concurrent revision-checked writers of the same rows.
    fn bulk_update(
        &self,
        tx: TxId,
        entity_type: EntityType,
        filter: &FieldFilter,
        patch: &FieldPatch,
        increment_revision: bool,
    ) -> Result<usize, StoreError>;
}

impl<S> EntityStore for Arc<S>
where
    S: EntityStore + ?Sized,
{
    fn begin(&self) -> Result<TxId, StoreError> {
        (**self).begin()
    }

    fn commit(&self, tx: TxId) -> Result<(), StoreError> {
        (**self).commit(tx)
    }

    fn rollback(&self, tx: TxId) -> Result<(), StoreError> {
        (**self).rollback(tx)
    }

    fn select(&self, tx: TxId, key: EntityKey) -> Result<Option<Row>, StoreError> {
        (**self).select(tx, key)
    }

    fn select_for_update(&self, tx: TxId, key: EntityKey) -> Result<Option<Row>, StoreError> {
        (**self).select_for_update(tx, key)
    }

    fn select_all(&self, tx: TxId, entity_type: EntityType) -> Result<Vec<(Uuid, Row)>, StoreError> {
        (**self).select_all(tx, entity_type)
    }

    fn insert(
        &self,
        tx: TxId,
        key: EntityKey,
        payload: JsonValue,
        references: Vec<EntityKey>,
    ) -> Result<(), StoreError> {
        (**self).insert(tx, key, payload, references)
    }

    fn update(
        &self,
        tx: TxId,
        key: EntityKey,
        expected_revision: u32,
        payload: JsonValue,
        references: Vec<EntityKey>,
    ) -> Result<usize, StoreError> {
        (**self).update(tx, key, expected_revision, payload, references)
    }

    fn delete(&self, tx: TxId, key: EntityKey, expected_revision: u32) -> Result<usize, StoreError> {
        (**self).delete(tx, key, expected_revision)
    }

    fn bulk_update(
        &self,
        tx: TxId,
        entity_type: EntityType,
        filter: &FieldFilter,
        patch: &FieldPatch,
        increment_revision: bool,
    ) -> Result<usize, StoreError> {
        (**self).bulk_update(tx, entity_type, filter, patch, increment_revision)
    }
}
