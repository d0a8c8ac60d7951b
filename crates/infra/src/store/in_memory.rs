use std::collections::{BTreeMap, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, trace};
use uuid::Uuid;

use txflow_core::{EntityKey, EntityType};

use super::r#trait::{EntityStore, FieldFilter, FieldPatch, Row, StoreError, TxId};

#[derive(Debug, Default)]
struct TxState {
    /// Uncommitted writes. `None` marks a pending delete.
    pending: HashMap<EntityKey, Option<Row>>,
    locks: Vec<EntityKey>,
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<EntityKey, Row>,
    transactions: HashMap<TxId, TxState>,
    row_locks: HashMap<EntityKey, TxId>,
    next_tx: u64,
}

impl Tables {
    fn tx_state(&self, tx: TxId) -> Result<&TxState, StoreError> {
        self.transactions
            .get(&tx)
            .ok_or(StoreError::UnknownTransaction(tx))
    }

    fn tx_state_mut(&mut self, tx: TxId) -> Result<&mut TxState, StoreError> {
        self.transactions
            .get_mut(&tx)
            .ok_or(StoreError::UnknownTransaction(tx))
    }

    fn visible(&self, tx: TxId, key: &EntityKey) -> Option<&Row> {
        match self.transactions.get(&tx).and_then(|t| t.pending.get(key)) {
            Some(pending) => pending.as_ref(),
            None => self.rows.get(key),
        }
    }

    fn visible_rows(&self, tx: TxId, entity_type: EntityType) -> BTreeMap<EntityKey, Row> {
        let own = self.transactions.get(&tx);
        let mut out: BTreeMap<EntityKey, Row> = self
            .rows
            .iter()
            .filter(|(k, _)| k.entity_type == entity_type)
            .filter(|(k, _)| own.is_none_or(|s| !s.pending.contains_key(*k)))
            .map(|(k, r)| (*k, r.clone()))
            .collect();
        if let Some(state) = own {
            for (key, row) in &state.pending {
                if let (true, Some(row)) = (key.entity_type == entity_type, row) {
                    out.insert(*key, row.clone());
                }
            }
        }
        out
    }

    fn lock_holder(&self, key: &EntityKey) -> Option<TxId> {
        self.row_locks.get(key).copied()
    }

    /// Another transaction is about to delete `key`.
    fn deleted_by_other(&self, tx: TxId, key: &EntityKey) -> bool {
        self.transactions
            .iter()
            .any(|(id, state)| *id != tx && matches!(state.pending.get(key), Some(None)))
    }

    /// A row written (not yet committed) by another transaction that references `key`.
    fn pending_child_of_other(&self, tx: TxId, key: &EntityKey) -> Option<EntityKey> {
        self.transactions
            .iter()
            .filter(|(id, _)| **id != tx)
            .flat_map(|(_, state)| state.pending.iter())
            .find_map(|(child, row)| {
                row.as_ref()
                    .filter(|r| r.references.contains(key))
                    .map(|_| *child)
            })
    }

    /// A row visible to `tx` that references `key`.
    fn visible_child(&self, tx: TxId, key: &EntityKey) -> Option<EntityKey> {
        let own = self.transactions.get(&tx);
        let committed = self
            .rows
            .iter()
            .filter(|(k, _)| own.is_none_or(|s| !s.pending.contains_key(*k)));
        let pending = own
            .into_iter()
            .flat_map(|s| s.pending.iter())
            .filter_map(|(k, r)| r.as_ref().map(|r| (k, r)));
        committed
            .chain(pending)
            .find(|(k, r)| *k != key && r.references.contains(key))
            .map(|(k, _)| *k)
    }

    fn missing_parent(&self, tx: TxId, references: &[EntityKey]) -> Option<EntityKey> {
        references
            .iter()
            .find(|parent| self.visible(tx, parent).is_none())
            .copied()
    }
}

/// In-memory transactional row store.
///
/// Intended for tests/dev and for embedding. A single mutex guards the tables;
/// it is only held for the duration of one statement, never across a command.
/// Row locks and the condition variable provide the blocking behaviour of a
/// database: writers queue behind the transaction that holds the row.
#[derive(Debug)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    released: Condvar,
    lock_wait_timeout: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new() -> Self {
        Self::with_lock_wait_timeout(Self::DEFAULT_LOCK_WAIT_TIMEOUT)
    }

    pub fn with_lock_wait_timeout(lock_wait_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            released: Condvar::new(),
            lock_wait_timeout,
        }
    }

    /// Committed row, outside of any transaction.
    pub fn committed_row(&self, key: EntityKey) -> Result<Option<Row>, StoreError> {
        Ok(self.tables()?.rows.get(&key).cloned())
    }

    /// Number of committed rows of a type.
    pub fn committed_count(&self, entity_type: EntityType) -> Result<usize, StoreError> {
        Ok(self
            .tables()?
            .rows
            .keys()
            .filter(|k| k.entity_type == entity_type)
            .count())
    }

    /// Number of transactions that have not ended yet.
    pub fn open_transactions(&self) -> Result<usize, StoreError> {
        Ok(self.tables()?.transactions.len())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.lock_wait_timeout
    }

    /// Block until some transaction ends or the deadline passes.
    fn wait<'a>(
        &'a self,
        tables: MutexGuard<'a, Tables>,
        key: EntityKey,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, Tables>, StoreError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(StoreError::LockWaitTimeout { key });
        }
        let (tables, _) = self
            .released
            .wait_timeout(tables, deadline - now)
            .map_err(|_| StoreError::Poisoned)?;
        Ok(tables)
    }

    /// Take the row lock for `tx`, waiting for the current holder to finish.
    fn acquire<'a>(
        &'a self,
        mut tables: MutexGuard<'a, Tables>,
        tx: TxId,
        key: EntityKey,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, Tables>, StoreError> {
        loop {
            tables.tx_state(tx)?;
            let holder = tables.lock_holder(&key);
            match holder {
                Some(holder) if holder == tx => return Ok(tables),
                Some(holder) => {
                    trace!(%tx, %holder, %key, "waiting for row lock");
                    tables = self.wait(tables, key, deadline)?;
                }
                None => {
                    tables.row_locks.insert(key, tx);
                    tables.tx_state_mut(tx)?.locks.push(key);
                    return Ok(tables);
                }
            }
        }
    }

    /// Wait while another transaction is deleting one of `references`.
    fn await_parents<'a>(
        &'a self,
        mut tables: MutexGuard<'a, Tables>,
        tx: TxId,
        references: &[EntityKey],
        deadline: Instant,
    ) -> Result<MutexGuard<'a, Tables>, StoreError> {
        loop {
            let blocked = references
                .iter()
                .copied()
                .find(|parent| tables.deleted_by_other(tx, parent));
            match blocked {
                Some(parent) => tables = self.wait(tables, parent, deadline)?,
                None => return Ok(tables),
            }
        }
    }

    fn end(&self, tx: TxId, apply: bool) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let state = tables
            .transactions
            .remove(&tx)
            .ok_or(StoreError::UnknownTransaction(tx))?;
        if apply {
            for (key, row) in state.pending {
                match row {
                    Some(row) => {
                        tables.rows.insert(key, row);
                    }
                    None => {
                        tables.rows.remove(&key);
                    }
                }
            }
        }
        for key in state.locks {
            if tables.row_locks.get(&key) == Some(&tx) {
                tables.row_locks.remove(&key);
            }
        }
        drop(tables);
        self.released.notify_all();
        Ok(())
    }
}

impl EntityStore for InMemoryStore {
    fn begin(&self) -> Result<TxId, StoreError> {
        let mut tables = self.tables()?;
        tables.next_tx += 1;
        let tx = TxId(tables.next_tx);
        tables.transactions.insert(tx, TxState::default());
        trace!(%tx, "begin");
        Ok(tx)
    }

    fn commit(&self, tx: TxId) -> Result<(), StoreError> {
        self.end(tx, true)?;
        trace!(%tx, "commit");
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> Result<(), StoreError> {
        self.end(tx, false)?;
        trace!(%tx, "rollback");
        Ok(())
    }

    fn select(&self, tx: TxId, key: EntityKey) -> Result<Option<Row>, StoreError> {
        let tables = self.tables()?;
        tables.tx_state(tx)?;
        Ok(tables.visible(tx, &key).cloned())
    }

    fn select_for_update(&self, tx: TxId, key: EntityKey) -> Result<Option<Row>, StoreError> {
        let deadline = self.deadline();
        let tables = self.acquire(self.tables()?, tx, key, deadline)?;
        Ok(tables.visible(tx, &key).cloned())
    }

    fn select_all(&self, tx: TxId, entity_type: EntityType) -> Result<Vec<(Uuid, Row)>, StoreError> {
        let tables = self.tables()?;
        tables.tx_state(tx)?;
        Ok(tables
            .visible_rows(tx, entity_type)
            .into_iter()
            .map(|(k, r)| (k.id, r))
            .collect())
    }

    fn insert(
        &self,
        tx: TxId,
        key: EntityKey,
        payload: JsonValue,
        references: Vec<EntityKey>,
    ) -> Result<(), StoreError> {
        let deadline = self.deadline();
        let tables = self.acquire(self.tables()?, tx, key, deadline)?;
        if tables.visible(tx, &key).is_some() {
            return Err(StoreError::DuplicateKey { key });
        }
        let mut tables = self.await_parents(tables, tx, &references, deadline)?;
        if let Some(parent) = tables.missing_parent(tx, &references) {
            return Err(StoreError::foreign_key(
                key.entity_type,
                parent.entity_type,
                format!("{key} references missing {parent}"),
            ));
        }
        tables.tx_state_mut(tx)?.pending.insert(
            key,
            Some(Row {
                revision: 1,
                payload,
                references,
            }),
        );
        debug!(%tx, %key, "insert");
        Ok(())
    }

    fn update(
        &self,
        tx: TxId,
        key: EntityKey,
        expected_revision: u32,
        payload: JsonValue,
        references: Vec<EntityKey>,
    ) -> Result<usize, StoreError> {
        let deadline = self.deadline();
        let tables = self.acquire(self.tables()?, tx, key, deadline)?;
        let added: Vec<EntityKey> = match tables.visible(tx, &key) {
            Some(row) if row.revision == expected_revision => references
                .iter()
                .filter(|r| !row.references.contains(r))
                .copied()
                .collect(),
            _ => {
                debug!(%tx, %key, expected_revision, "update matched no row");
                return Ok(0);
            }
        };
        let mut tables = self.await_parents(tables, tx, &added, deadline)?;
        if let Some(parent) = tables.missing_parent(tx, &added) {
            return Err(StoreError::foreign_key(
                key.entity_type,
                parent.entity_type,
                format!("{key} references missing {parent}"),
            ));
        }
        tables.tx_state_mut(tx)?.pending.insert(
            key,
            Some(Row {
                revision: expected_revision + 1,
                payload,
                references,
            }),
        );
        debug!(%tx, %key, revision = expected_revision + 1, "update");
        Ok(1)
    }

    fn delete(&self, tx: TxId, key: EntityKey, expected_revision: u32) -> Result<usize, StoreError> {
        let deadline = self.deadline();
        let mut tables = self.acquire(self.tables()?, tx, key, deadline)?;
        loop {
            let blocker = tables.pending_child_of_other(tx, &key);
            match blocker {
                Some(child) => tables = self.wait(tables, child, deadline)?,
                None => break,
            }
        }
        match tables.visible(tx, &key) {
            Some(row) if row.revision == expected_revision => {}
            _ => {
                debug!(%tx, %key, expected_revision, "delete matched no row");
                return Ok(0);
            }
        }
        if let Some(child) = tables.visible_child(tx, &key) {
            return Err(StoreError::foreign_key(
                child.entity_type,
                key.entity_type,
                format!("{key} is still referenced by {child}"),
            ));
        }
        tables.tx_state_mut(tx)?.pending.insert(key, None);
        debug!(%tx, %key, "delete");
        Ok(1)
    }

    fn bulk_update(
        &self,
        tx: TxId,
        entity_type: EntityType,
        filter: &FieldFilter,
        patch: &FieldPatch,
        increment_revision: bool,
    ) -> Result<usize, StoreError> {
        let deadline = self.deadline();
        let mut tables = self.tables()?;
        tables.tx_state(tx)?;
        let candidates: Vec<EntityKey> = tables
            .visible_rows(tx, entity_type)
            .into_iter()
            .filter(|(_, row)| filter.matches(&row.payload))
            .map(|(key, _)| key)
            .collect();

        let mut affected = 0;
        for key in candidates {
            tables = self.acquire(tables, tx, key, deadline)?;
            let Some(mut row) = tables.visible(tx, &key).cloned() else {
                continue;
            };
            if !filter.matches(&row.payload) {
                continue;
            }
            patch.apply(&mut row.payload);
            if increment_revision {
                row.revision += 1;
            }
            tables.tx_state_mut(tx)?.pending.insert(key, Some(row));
            affected += 1;
        }
        debug!(%tx, entity_type = %entity_type, affected, increment_revision, "bulk update");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn key(entity_type: EntityType) -> EntityKey {
        EntityKey::new(entity_type, Uuid::now_v7())
    }

    fn insert_committed(store: &InMemoryStore, key: EntityKey, payload: JsonValue, refs: Vec<EntityKey>) {
        let tx = store.begin().unwrap();
        store.insert(tx, key, payload, refs).unwrap();
        store.commit(tx).unwrap();
    }

    #[test]
    fn uncommitted_writes_are_invisible_to_other_transactions() {
        let store = InMemoryStore::new();
        let k = key(EntityType::Job);

        let writer = store.begin().unwrap();
        store.insert(writer, k, json!({"a": 1}), vec![]).unwrap();

        let reader = store.begin().unwrap();
        assert!(store.select(reader, k).unwrap().is_none());
        assert!(store.select(writer, k).unwrap().is_some());

        store.commit(writer).unwrap();
        assert_eq!(store.select(reader, k).unwrap().unwrap().revision, 1);
        store.rollback(reader).unwrap();
    }

    #[test]
    fn stale_revision_updates_nothing() {
        let store = InMemoryStore::new();
        let k = key(EntityType::Job);
        insert_committed(&store, k, json!({"a": 1}), vec![]);

        let tx = store.begin().unwrap();
        assert_eq!(store.update(tx, k, 1, json!({"a": 2}), vec![]).unwrap(), 1);
        store.commit(tx).unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(store.update(tx, k, 1, json!({"a": 3}), vec![]).unwrap(), 0);
        assert_eq!(store.delete(tx, k, 1).unwrap(), 0);
        assert_eq!(store.delete(tx, k, 2).unwrap(), 1);
        store.commit(tx).unwrap();

        assert!(store.committed_row(k).unwrap().is_none());
    }

    #[test]
    fn competing_writer_waits_and_then_sees_new_revision() {
        let store = Arc::new(InMemoryStore::new());
        let k = key(EntityType::Job);
        insert_committed(&store, k, json!({"a": 1}), vec![]);

        let first = store.begin().unwrap();
        assert_eq!(store.update(first, k, 1, json!({"a": 2}), vec![]).unwrap(), 1);

        let competitor = {
            let store = store.clone();
            thread::spawn(move || {
                let second = store.begin().unwrap();
                let affected = store.update(second, k, 1, json!({"a": 3}), vec![]).unwrap();
                store.rollback(second).unwrap();
                affected
            })
        };

        thread::sleep(Duration::from_millis(50));
        store.commit(first).unwrap();

        assert_eq!(competitor.join().unwrap(), 0);
        assert_eq!(store.committed_row(k).unwrap().unwrap().payload, json!({"a": 2}));
    }

    #[test]
    fn lock_wait_is_bounded() {
        let store = Arc::new(InMemoryStore::with_lock_wait_timeout(Duration::from_millis(30)));
        let k = key(EntityType::Job);
        insert_committed(&store, k, json!({}), vec![]);

        let holder = store.begin().unwrap();
        store.select_for_update(holder, k).unwrap();

        let waiter = store.begin().unwrap();
        let err = store.update(waiter, k, 1, json!({}), vec![]).unwrap_err();
        assert_eq!(err, StoreError::LockWaitTimeout { key: k });

        store.rollback(waiter).unwrap();
        store.rollback(holder).unwrap();
    }

    #[test]
    fn foreign_keys_are_checked_on_insert_and_delete() {
        let store = InMemoryStore::new();
        let parent = key(EntityType::Execution);
        let child = key(EntityType::Job);

        let tx = store.begin().unwrap();
        let err = store.insert(tx, child, json!({}), vec![parent]).unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { ref code, .. } if code == "FK_JobEntity_ExecutionEntity"));
        store.rollback(tx).unwrap();

        insert_committed(&store, parent, json!({}), vec![]);
        insert_committed(&store, child, json!({}), vec![parent]);

        let tx = store.begin().unwrap();
        assert!(matches!(
            store.delete(tx, parent, 1),
            Err(StoreError::ForeignKeyViolation { .. })
        ));
        store.rollback(tx).unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(store.delete(tx, child, 1).unwrap(), 1);
        assert_eq!(store.delete(tx, parent, 1).unwrap(), 1);
        store.commit(tx).unwrap();
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryStore::new();
        let k = key(EntityType::Job);
        insert_committed(&store, k, json!({}), vec![]);

        let tx = store.begin().unwrap();
        assert_eq!(
            store.insert(tx, k, json!({}), vec![]).unwrap_err(),
            StoreError::DuplicateKey { key: k }
        );
        store.rollback(tx).unwrap();
    }

    #[test]
    fn bulk_update_patches_matching_rows() {
        let store = InMemoryStore::new();
        let a = key(EntityType::Job);
        let b = key(EntityType::Job);
        insert_committed(&store, a, json!({"def": "x", "suspended": false}), vec![]);
        insert_committed(&store, b, json!({"def": "y", "suspended": false}), vec![]);

        let tx = store.begin().unwrap();
        let affected = store
            .bulk_update(
                tx,
                EntityType::Job,
                &FieldFilter::new().eq("def", "x"),
                &FieldPatch::new().set("suspended", true),
                true,
            )
            .unwrap();
        store.commit(tx).unwrap();

        assert_eq!(affected, 1);
        let row = store.committed_row(a).unwrap().unwrap();
        assert_eq!(row.revision, 2);
        assert_eq!(row.payload["suspended"], json!(true));
        assert_eq!(store.committed_row(b).unwrap().unwrap().revision, 1);
    }

    #[test]
    fn rollback_discards_writes_and_releases_locks() {
        let store = InMemoryStore::new();
        let k = key(EntityType::Job);
        insert_committed(&store, k, json!({"a": 1}), vec![]);

        let tx = store.begin().unwrap();
        store.update(tx, k, 1, json!({"a": 2}), vec![]).unwrap();
        store.rollback(tx).unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(store.update(tx, k, 1, json!({"a": 3}), vec![]).unwrap(), 1);
        store.commit(tx).unwrap();
        assert_eq!(store.open_transactions().unwrap(), 0);
    }
}
