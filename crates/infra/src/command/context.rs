use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use txflow_core::{DomainError, EntityKey, VersionedEntity};

use super::{Command, CommandExecutor, Propagation};
use crate::config::EngineConfig;
use crate::db::cache::EntityCache;
use crate::db::flush::{self, FlushExecutor};
use crate::db::listener::OptimisticLockingListener;
use crate::db::operation::BulkUpdate;
use crate::engine::EngineCore;
use crate::error::EngineResult;
use crate::store::{EntityStore, Row, StoreError, TxId};

/// Transaction phase a listener is attached to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// After a successful flush, before commit. A failing listener rolls back.
    Committing,
    Committed,
    RolledBack,
}

pub type TransactionListener = Box<dyn FnOnce() -> EngineResult<()> + Send>;

/// Per-transaction state handed to every command.
///
/// Holds the storage transaction, the entity cache, and the hooks registered
/// by commands running in this transaction. Dropping a context that has not
/// been committed rolls its transaction back.
pub struct CommandContext {
    core: Arc<EngineCore>,
    tx: TxId,
    cache: EntityCache,
    bulk: Vec<BulkUpdate>,
    conflict_listeners: Vec<Box<dyn OptimisticLockingListener>>,
    transaction_listeners: Vec<(TransactionState, TransactionListener)>,
    finished: bool,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("tx", &self.tx)
            .field("cached", &self.cache.len())
            .field("bulk", &self.bulk.len())
            .finish_non_exhaustive()
    }
}

fn decode<T: VersionedEntity>(row: Row) -> Result<T, StoreError> {
    let mut entity: T =
        serde_json::from_value(row.payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
    entity.set_revision(row.revision);
    Ok(entity)
}

impl CommandContext {
    pub(crate) fn new(core: Arc<EngineCore>, tx: TxId) -> Self {
        Self {
            core,
            tx,
            cache: EntityCache::new(),
            bulk: Vec::new(),
            conflict_listeners: Vec::new(),
            transaction_listeners: Vec::new(),
            finished: false,
        }
    }

    pub fn tx(&self) -> TxId {
        self.tx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.core.clock.now()
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    // ---- reads ----------------------------------------------------------

    /// Load through the cache. Rows deleted in this transaction are `None`.
    pub fn find<T: VersionedEntity>(&mut self, id: impl Into<Uuid>) -> EngineResult<Option<T>> {
        Ok(self.find_mut::<T>(id)?.map(|e| e.clone()))
    }

    pub fn find_mut<T: VersionedEntity>(&mut self, id: impl Into<Uuid>) -> EngineResult<Option<&mut T>> {
        let key = EntityKey::new(T::ENTITY_TYPE, id);
        if !self.cache.contains(&key) {
            if let Some(row) = self.core.store.select(self.tx, key)? {
                self.cache.put_loaded(decode::<T>(row)?)?;
            }
        }
        Ok(self.cache.get_mut::<T>(key.id))
    }

    /// Like [`find`](Self::find) but a missing row is a domain error.
    pub fn get<T: VersionedEntity>(&mut self, id: impl Into<Uuid>) -> EngineResult<T> {
        let id = id.into();
        self.find::<T>(id)?
            .ok_or_else(|| DomainError::not_found(T::ENTITY_TYPE.name(), id).into())
    }

    /// All visible rows of a type matching `predicate`, in id order.
    ///
    /// Cached copies take precedence over stored rows; entities created in this
    /// transaction are included.
    pub fn find_where<T: VersionedEntity>(&mut self, predicate: impl Fn(&T) -> bool) -> EngineResult<Vec<T>> {
        for (id, row) in self.core.store.select_all(self.tx, T::ENTITY_TYPE)? {
            let key = EntityKey::new(T::ENTITY_TYPE, id);
            if self.cache.contains(&key) {
                continue;
            }
            let entity = decode::<T>(row)?;
            if predicate(&entity) {
                self.cache.put_loaded(entity)?;
            }
        }
        Ok(self.cache.all::<T>().filter(|e| predicate(*e)).cloned().collect())
    }

    /// Forced read under a row lock held until this transaction ends.
    ///
    /// Waits for a competing holder and then returns the latest committed
    /// state, replacing any cached copy. `None` if the row is gone.
    pub fn find_for_update<T: VersionedEntity>(&mut self, id: impl Into<Uuid>) -> EngineResult<Option<T>> {
        let key = EntityKey::new(T::ENTITY_TYPE, id);
        let row = self.core.store.select_for_update(self.tx, key)?;
        self.cache.evict(&key);
        match row {
            Some(row) => {
                let entity = decode::<T>(row)?;
                self.cache.put_loaded(entity.clone())?;
                Ok(Some(entity))
            }
            None => {
                debug!(tx = %self.tx, %key, "locked row no longer exists");
                Ok(None)
            }
        }
    }

    // ---- writes ---------------------------------------------------------

    pub fn insert<T: VersionedEntity>(&mut self, entity: T) -> EngineResult<()> {
        self.cache.put_new(entity)?;
        Ok(())
    }

    /// Record `entity` as the new state of its row.
    ///
    /// The update is checked against `entity.revision()`, i.e. the revision the
    /// caller read.
    pub fn update<T: VersionedEntity>(&mut self, entity: T) -> EngineResult<()> {
        let key = entity.key();
        if !self.cache.replace(entity.clone()) {
            self.cache.put_loaded(entity)?;
            self.cache.force_update(key);
        }
        Ok(())
    }

    pub fn delete<T: VersionedEntity>(&mut self, entity: &T) -> EngineResult<()> {
        let key = entity.key();
        if !self.cache.contains(&key) {
            self.cache.put_loaded(entity.clone())?;
        }
        self.cache.remove(key);
        Ok(())
    }

    /// Delete by id. Returns false if the row does not exist.
    pub fn delete_by_id<T: VersionedEntity>(&mut self, id: impl Into<Uuid>) -> EngineResult<bool> {
        let id = id.into();
        if self.find_mut::<T>(id)?.is_none() {
            return Ok(false);
        }
        Ok(self.cache.remove(EntityKey::new(T::ENTITY_TYPE, id)))
    }

    /// Issue a revision-checked update for a loaded row even if unchanged.
    pub fn force_update<T: VersionedEntity>(&mut self, id: impl Into<Uuid>) -> EngineResult<()> {
        let id = id.into();
        if self.find_mut::<T>(id)?.is_none() {
            return Err(DomainError::not_found(T::ENTITY_TYPE.name(), id).into());
        }
        self.cache.force_update(EntityKey::new(T::ENTITY_TYPE, id));
        Ok(())
    }

    /// Register a set-oriented statement executed at flush, after updates.
    pub fn bulk_update(&mut self, bulk: BulkUpdate) {
        self.bulk.push(bulk);
    }

    // ---- hooks ----------------------------------------------------------

    pub fn add_conflict_listener(&mut self, listener: impl OptimisticLockingListener + 'static) {
        self.conflict_listeners.push(Box::new(listener));
    }

    pub fn add_transaction_listener(
        &mut self,
        state: TransactionState,
        listener: impl FnOnce() -> EngineResult<()> + Send + 'static,
    ) {
        self.transaction_listeners.push((state, Box::new(listener)));
    }

    // ---- nesting --------------------------------------------------------

    pub fn execute<T, C>(&mut self, propagation: Propagation, command: &C) -> EngineResult<T>
    where
        C: Command<T> + ?Sized,
    {
        match propagation {
            Propagation::Required => command.execute(self),
            Propagation::RequiresNew => CommandExecutor::new(self.core.clone()).execute(command),
        }
    }

    pub fn run<T, F>(&mut self, propagation: Propagation, f: F) -> EngineResult<T>
    where
        F: Fn(&mut CommandContext) -> EngineResult<T>,
    {
        self.execute(propagation, &f)
    }

    // ---- transaction boundary --------------------------------------------

    /// Write all pending changes of this transaction to the store.
    pub fn flush(&mut self) -> EngineResult<()> {
        let operations = flush::plan(&self.cache, &self.bulk)?;
        self.bulk.clear();
        if operations.is_empty() {
            return Ok(());
        }
        let executor = FlushExecutor::new(
            self.core.store.as_ref(),
            self.tx,
            &self.conflict_listeners,
            self.core.config.optimistic_locking_on_foreign_key_violation,
        );
        for flushed in executor.execute(operations)? {
            self.cache.apply_flushed(flushed.key, flushed.as_)?;
        }
        Ok(())
    }

    pub(crate) fn fire(&mut self, state: TransactionState) -> EngineResult<()> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.transaction_listeners)
            .into_iter()
            .partition(|(s, _)| *s == state);
        self.transaction_listeners = rest;
        for (_, listener) in matching {
            listener()?;
        }
        Ok(())
    }

    /// Run listeners after the outcome is final; failures are only logged.
    pub(crate) fn fire_after(&mut self, state: TransactionState) {
        if let Err(err) = self.fire(state) {
            warn!(tx = %self.tx, ?state, error = %err, "transaction listener failed");
        }
    }

    pub(crate) fn commit(&mut self) -> EngineResult<()> {
        self.finished = true;
        self.core.store.commit(self.tx)?;
        Ok(())
    }

    pub(crate) fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(err) = self.core.store.rollback(self.tx) {
            warn!(tx = %self.tx, error = %err, "rollback failed");
        }
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        self.rollback();
    }
}
