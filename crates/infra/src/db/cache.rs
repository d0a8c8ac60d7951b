//! Per-transaction entity cache.
//!
//! Every entity a command touches goes through the cache: loads, inserts,
//! updates and deletes are recorded here and only turned into statements when
//! the context flushes. The cache lives exactly as long as one command context
//! and is never shared between threads.
//!
//! ```text
//!   insert ──► Transient ──flush──► Persistent ◄── load
//!                 │                     │
//!             delete (dropped)      delete
//!                                       ▼
//!                                    Deleted ──flush──► (evicted)
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use txflow_core::{EntityKey, EntityType, VersionedEntity};

use crate::store::StoreError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntityState {
    /// Created in this transaction, not yet inserted.
    Transient,
    /// Loaded from (or already flushed to) the store.
    Persistent,
    /// Loaded, then marked for deletion.
    Deleted,
}

pub(crate) trait ErasedEntity: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn persistent_state(&self) -> Result<JsonValue, StoreError>;
    fn revision(&self) -> u32;
    fn set_revision(&mut self, revision: u32);
    fn references(&self) -> Vec<EntityKey>;
}

impl<T: VersionedEntity> ErasedEntity for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn persistent_state(&self) -> Result<JsonValue, StoreError> {
        serde_json::to_value(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn revision(&self) -> u32 {
        VersionedEntity::revision(self)
    }

    fn set_revision(&mut self, revision: u32) {
        VersionedEntity::set_revision(self, revision)
    }

    fn references(&self) -> Vec<EntityKey> {
        VersionedEntity::references(self)
    }
}

#[derive(Debug)]
pub(crate) struct CachedEntity {
    pub(crate) state: EntityState,
    pub(crate) entity: Box<dyn ErasedEntity>,
    /// Persistent state as last read from or written to the store.
    pub(crate) snapshot: Option<JsonValue>,
    /// Issue a revision-checked update at flush even without changes.
    pub(crate) force_update: bool,
}

#[derive(Debug, Default)]
pub struct EntityCache {
    entries: BTreeMap<EntityKey, CachedEntity>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, key: &EntityKey) -> Option<EntityState> {
        self.entries.get(key).map(|e| e.state)
    }

    /// Whether the cache knows this row (including rows marked deleted).
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Cached entity unless it was deleted in this transaction.
    pub fn get<T: VersionedEntity>(&self, id: Uuid) -> Option<&T> {
        let entry = self.entries.get(&EntityKey::new(T::ENTITY_TYPE, id))?;
        if entry.state == EntityState::Deleted {
            return None;
        }
        entry.entity.as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: VersionedEntity>(&mut self, id: Uuid) -> Option<&mut T> {
        let entry = self.entries.get_mut(&EntityKey::new(T::ENTITY_TYPE, id))?;
        if entry.state == EntityState::Deleted {
            return None;
        }
        entry.entity.as_any_mut().downcast_mut::<T>()
    }

    /// All live cached entities of a type.
    pub fn all<T: VersionedEntity>(&self) -> impl Iterator<Item = &T> {
        self.entries
            .iter()
            .filter(|(k, e)| k.entity_type == T::ENTITY_TYPE && e.state != EntityState::Deleted)
            .filter_map(|(_, e)| e.entity.as_any().downcast_ref::<T>())
    }

    /// Register an entity read from the store.
    ///
    /// An entity already in the cache wins over the freshly read row, so that a
    /// transaction keeps working with its own (possibly modified) copy.
    pub fn put_loaded<T: VersionedEntity>(&mut self, entity: T) -> Result<(), StoreError> {
        let key = entity.key();
        if self.entries.contains_key(&key) {
            return Ok(());
        }
        let snapshot = ErasedEntity::persistent_state(&entity)?;
        self.entries.insert(
            key,
            CachedEntity {
                state: EntityState::Persistent,
                entity: Box::new(entity),
                snapshot: Some(snapshot),
                force_update: false,
            },
        );
        Ok(())
    }

    /// Register a new entity to be inserted at flush.
    pub fn put_new<T: VersionedEntity>(&mut self, mut entity: T) -> Result<(), StoreError> {
        let key = entity.key();
        if self.entries.contains_key(&key) {
            return Err(StoreError::DuplicateKey { key });
        }
        VersionedEntity::set_revision(&mut entity, 1);
        self.entries.insert(
            key,
            CachedEntity {
                state: EntityState::Transient,
                entity: Box::new(entity),
                snapshot: None,
                force_update: false,
            },
        );
        Ok(())
    }

    /// Overwrite the cached copy with `entity`. Returns false if not cached.
    pub fn replace<T: VersionedEntity>(&mut self, entity: T) -> bool {
        match self.get_mut::<T>(entity.entity_id()) {
            Some(slot) => {
                *slot = entity;
                true
            }
            None => false,
        }
    }

    /// Mark for deletion. Entities created in this transaction are simply dropped.
    /// Returns false if the entity is not cached.
    pub fn remove(&mut self, key: EntityKey) -> bool {
        match self.entries.get(&key).map(|e| e.state) {
            Some(EntityState::Transient) => {
                self.entries.remove(&key);
                true
            }
            Some(EntityState::Persistent) => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.state = EntityState::Deleted;
                }
                true
            }
            Some(EntityState::Deleted) => true,
            None => false,
        }
    }

    /// Force a revision-checked update of a persistent entity at flush.
    pub fn force_update(&mut self, key: EntityKey) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.state == EntityState::Persistent => {
                entry.force_update = true;
                true
            }
            _ => false,
        }
    }

    /// Forget a row entirely (used before a forced re-read).
    pub(crate) fn evict(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&EntityKey, &CachedEntity)> {
        self.entries.iter()
    }

    /// Bring the cache in line with statements that reached the store.
    pub(crate) fn apply_flushed(&mut self, key: EntityKey, kind: FlushedAs) -> Result<(), StoreError> {
        match kind {
            FlushedAs::Deleted => {
                self.entries.remove(&key);
            }
            FlushedAs::Written { revision } => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.entity.set_revision(revision);
                    entry.snapshot = Some(entry.entity.persistent_state()?);
                    entry.state = EntityState::Persistent;
                    entry.force_update = false;
                }
            }
            FlushedAs::Conflicted => {
                // The row no longer matches what we hold; stop writing it.
                self.entries.remove(&key);
            }
        }
        Ok(())
    }

    /// Live entities of a type, used by query helpers to overlay store results.
    pub(crate) fn keys_of(&self, entity_type: EntityType) -> impl Iterator<Item = (&EntityKey, EntityState)> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.entity_type == entity_type)
            .map(|(k, e)| (k, e.state))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FlushedAs {
    Written { revision: u32 },
    Deleted,
    Conflicted,
}
