//! Flush planning and execution.
//!
//! ```text
//! EntityCache + registered bulk statements
//!   ↓ plan()
//! 1. INSERT   parents before children (foreign keys among inserted rows)
//! 2. UPDATE   dirty or force-updated rows, ordered by (type, id)
//! 3. BULK     in registration order
//! 4. DELETE   children before parents
//!   ↓ FlushExecutor::execute()
//! revision-checked statements; 0 rows ⇒ conflict ⇒ listeners ⇒ throw / ignore
//! ```

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use txflow_core::EntityKey;

use super::cache::{EntityCache, EntityState, FlushedAs};
use super::listener::{OptimisticLockingListener, OptimisticLockingResult};
use super::operation::{BulkUpdate, DbOperation};
use crate::error::{EngineError, EngineResult, OptimisticLockingError};
use crate::store::{EntityStore, StoreError, TxId};

/// Order `items` so every key comes after the keys it depends on.
///
/// Dependencies outside the set are ignored. Cycles (which the store will
/// reject anyway) are emitted in key order.
fn dependency_order(deps: BTreeMap<EntityKey, BTreeSet<EntityKey>>) -> Vec<EntityKey> {
    let mut pending = deps;
    let mut emitted: BTreeSet<EntityKey> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready: Vec<EntityKey> = pending
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| emitted.contains(d)))
            .map(|(k, _)| *k)
            .collect();
        if ready.is_empty() {
            ordered.extend(pending.keys().copied());
            break;
        }
        for key in ready {
            pending.remove(&key);
            emitted.insert(key);
            ordered.push(key);
        }
    }
    ordered
}

/// Parents first: a row depends on the rows it references.
pub fn parents_first(rows: &[(EntityKey, Vec<EntityKey>)]) -> Vec<EntityKey> {
    let set: BTreeSet<EntityKey> = rows.iter().map(|(k, _)| *k).collect();
    let deps = rows
        .iter()
        .map(|(key, refs)| {
            let inside = refs
                .iter()
                .filter(|r| *r != key && set.contains(*r))
                .copied()
                .collect::<BTreeSet<EntityKey>>();
            (*key, inside)
        })
        .collect();
    dependency_order(deps)
}

/// Children first: a row depends on the rows that reference it.
pub fn children_first(rows: &[(EntityKey, Vec<EntityKey>)]) -> Vec<EntityKey> {
    let set: BTreeSet<EntityKey> = rows.iter().map(|(k, _)| *k).collect();
    let mut deps: BTreeMap<EntityKey, BTreeSet<EntityKey>> =
        rows.iter().map(|(k, _)| (*k, BTreeSet::new())).collect();
    for (child, refs) in rows {
        for parent in refs.iter().filter(|p| *p != child && set.contains(*p)) {
            if let Some(waiting) = deps.get_mut(parent) {
                waiting.insert(*child);
            }
        }
    }
    dependency_order(deps)
}

/// Turn the cache and registered bulk statements into an ordered statement list.
pub fn plan(cache: &EntityCache, bulk: &[BulkUpdate]) -> Result<Vec<DbOperation>, StoreError> {
    let mut inserts: BTreeMap<EntityKey, DbOperation> = BTreeMap::new();
    let mut insert_refs = Vec::new();
    let mut updates = Vec::new();
    let mut deletes: BTreeMap<EntityKey, DbOperation> = BTreeMap::new();
    let mut delete_refs = Vec::new();

    for (key, entry) in cache.entries() {
        match entry.state {
            EntityState::Transient => {
                let references = entry.entity.references();
                insert_refs.push((*key, references.clone()));
                inserts.insert(
                    *key,
                    DbOperation::Insert {
                        key: *key,
                        payload: entry.entity.persistent_state()?,
                        references,
                    },
                );
            }
            EntityState::Persistent => {
                let state = entry.entity.persistent_state()?;
                if entry.force_update || entry.snapshot.as_ref() != Some(&state) {
                    updates.push(DbOperation::Update {
                        key: *key,
                        expected_revision: entry.entity.revision(),
                        payload: state,
                        references: entry.entity.references(),
                    });
                }
            }
            EntityState::Deleted => {
                // Row references as last read: those are what the store checks.
                delete_refs.push((*key, entry.entity.references()));
                deletes.insert(
                    *key,
                    DbOperation::Delete {
                        key: *key,
                        expected_revision: entry.entity.revision(),
                    },
                );
            }
        }
    }

    let mut operations = Vec::with_capacity(inserts.len() + updates.len() + bulk.len() + deletes.len());
    for key in parents_first(&insert_refs) {
        if let Some(op) = inserts.remove(&key) {
            operations.push(op);
        }
    }
    operations.extend(updates);
    operations.extend(bulk.iter().cloned().map(DbOperation::BulkUpdate));
    for key in children_first(&delete_refs) {
        if let Some(op) = deletes.remove(&key) {
            operations.push(op);
        }
    }
    Ok(operations)
}

/// Outcome of one executed statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Flushed {
    pub(crate) key: EntityKey,
    pub(crate) as_: FlushedAs,
}

/// Issues planned statements against the store for one transaction.
pub struct FlushExecutor<'a> {
    store: &'a dyn EntityStore,
    tx: TxId,
    listeners: &'a [Box<dyn OptimisticLockingListener>],
    foreign_key_as_conflict: bool,
}

impl<'a> FlushExecutor<'a> {
    pub fn new(
        store: &'a dyn EntityStore,
        tx: TxId,
        listeners: &'a [Box<dyn OptimisticLockingListener>],
        foreign_key_as_conflict: bool,
    ) -> Self {
        Self {
            store,
            tx,
            listeners,
            foreign_key_as_conflict,
        }
    }

    pub(crate) fn execute(&self, operations: Vec<DbOperation>) -> EngineResult<Vec<Flushed>> {
        let mut flushed = Vec::with_capacity(operations.len());
        for operation in operations {
            debug!(tx = %self.tx, operation = %operation, "flush");
            let result = match &operation {
                DbOperation::Insert {
                    key,
                    payload,
                    references,
                } => self
                    .store
                    .insert(self.tx, *key, payload.clone(), references.clone())
                    .map(|()| 1),
                DbOperation::Update {
                    key,
                    expected_revision,
                    payload,
                    references,
                } => self.store.update(
                    self.tx,
                    *key,
                    *expected_revision,
                    payload.clone(),
                    references.clone(),
                ),
                DbOperation::Delete {
                    key,
                    expected_revision,
                } => self.store.delete(self.tx, *key, *expected_revision),
                DbOperation::BulkUpdate(bulk) => {
                    self.store
                        .bulk_update(
                            self.tx,
                            bulk.entity_type,
                            &bulk.filter,
                            &bulk.patch,
                            bulk.increment_revision,
                        )?;
                    continue;
                }
            };

            let Some(key) = operation.key() else {
                continue;
            };
            match result {
                Ok(0) => {
                    let conflict = OptimisticLockingError::concurrent_update(
                        operation.kind(),
                        key.entity_type,
                        key.id,
                    );
                    self.handle_conflict(&operation, conflict)?;
                    flushed.push(Flushed {
                        key,
                        as_: FlushedAs::Conflicted,
                    });
                }
                Ok(_) => flushed.push(Flushed {
                    key,
                    as_: match &operation {
                        DbOperation::Delete { .. } => FlushedAs::Deleted,
                        DbOperation::Update {
                            expected_revision, ..
                        } => FlushedAs::Written {
                            revision: expected_revision + 1,
                        },
                        _ => FlushedAs::Written { revision: 1 },
                    },
                }),
                Err(StoreError::ForeignKeyViolation { code, message }) => {
                    if !self.foreign_key_as_conflict {
                        return Err(EngineError::ForeignKeyViolation { code, message });
                    }
                    let conflict = OptimisticLockingError::foreign_key(
                        operation.kind(),
                        key.entity_type,
                        key.id,
                        &code,
                    );
                    self.handle_conflict(&operation, conflict)?;
                    flushed.push(Flushed {
                        key,
                        as_: FlushedAs::Conflicted,
                    });
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(flushed)
    }

    fn handle_conflict(
        &self,
        operation: &DbOperation,
        conflict: OptimisticLockingError,
    ) -> EngineResult<()> {
        let entity_type = operation.entity_type();
        let mut ignored = false;
        for listener in self.listeners {
            if listener.entity_type().is_some_and(|t| t != entity_type) {
                continue;
            }
            if listener.failed_operation(operation) == OptimisticLockingResult::Ignore {
                ignored = true;
            }
        }
        if ignored {
            warn!(tx = %self.tx, operation = %operation, "ignoring optimistic locking failure");
            Ok(())
        } else {
            Err(conflict.into())
        }
    }
}
