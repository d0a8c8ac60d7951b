//! Scope/execution tree nodes.
//!
//! A process instance is a root execution (`parent_id == None`, its
//! `process_instance_id` is its own id). Parallel branches are concurrent
//! children; when only one concurrent child remains the tree is compacted and
//! the child's state is merged back into its parent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityKey, EntityType, VersionedEntity};
use crate::id::{ExecutionId, TenantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEntity {
    pub id: ExecutionId,
    pub revision: u32,
    pub parent_id: Option<ExecutionId>,
    pub process_instance_id: ExecutionId,
    pub business_key: Option<String>,
    pub activity_id: Option<String>,
    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    pub tenant_id: Option<TenantId>,
}

impl ExecutionEntity {
    /// New root execution (process instance).
    pub fn new_process_instance(activity_id: Option<String>) -> Self {
        let id = ExecutionId::new();
        Self {
            id,
            revision: 1,
            parent_id: None,
            process_instance_id: id,
            business_key: None,
            activity_id,
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            tenant_id: None,
        }
    }

    /// New concurrent child of `parent`.
    pub fn new_concurrent_child(parent: &ExecutionEntity, activity_id: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            revision: 1,
            parent_id: Some(parent.id),
            process_instance_id: parent.process_instance_id,
            business_key: None,
            activity_id: Some(activity_id.into()),
            is_active: true,
            is_concurrent: true,
            is_scope: false,
            tenant_id: parent.tenant_id,
        }
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl VersionedEntity for ExecutionEntity {
    const ENTITY_TYPE: EntityType = EntityType::Execution;

    fn entity_id(&self) -> Uuid {
        *self.id.as_uuid()
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    fn references(&self) -> Vec<EntityKey> {
        let mut refs = Vec::new();
        if let Some(parent) = self.parent_id {
            refs.push(EntityKey::new(EntityType::Execution, parent));
        }
        if self.process_instance_id != self.id && Some(self.process_instance_id) != self.parent_id {
            refs.push(EntityKey::new(EntityType::Execution, self.process_instance_id));
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_instance_references_nothing() {
        let pi = ExecutionEntity::new_process_instance(None);
        assert!(pi.is_process_instance());
        assert!(pi.references().is_empty());
    }

    #[test]
    fn concurrent_child_references_parent_once() {
        let pi = ExecutionEntity::new_process_instance(None);
        let child = ExecutionEntity::new_concurrent_child(&pi, "task");
        assert_eq!(child.process_instance_id, pi.id);
        assert_eq!(child.references(), vec![EntityKey::new(EntityType::Execution, pi.id)]);
    }
}
