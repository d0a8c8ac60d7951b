use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityType, VersionedEntity};
use crate::id::{JobDefinitionId, TenantId};

/// Shared configuration of all jobs created for one activity.
///
/// Changes to the definition do not touch existing jobs by themselves; cascading
/// to jobs is an explicit bulk statement issued by the management operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinitionEntity {
    pub id: JobDefinitionId,
    pub revision: u32,
    pub job_type: String,
    pub activity_id: String,
    pub suspended: bool,
    /// Overrides the priority of newly created jobs when set.
    pub overriding_priority: Option<i64>,
    /// Retry cycle (`R3/PT5M` or `PT1M,PT5M`) applied to failing jobs of this definition.
    pub retry_time_cycle: Option<String>,
    pub tenant_id: Option<TenantId>,
}

impl JobDefinitionEntity {
    pub fn new(job_type: impl Into<String>, activity_id: impl Into<String>) -> Self {
        Self {
            id: JobDefinitionId::new(),
            revision: 1,
            job_type: job_type.into(),
            activity_id: activity_id.into(),
            suspended: false,
            overriding_priority: None,
            retry_time_cycle: None,
            tenant_id: None,
        }
    }

    pub fn with_retry_time_cycle(mut self, cycle: impl Into<String>) -> Self {
        self.retry_time_cycle = Some(cycle.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.overriding_priority = Some(priority);
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

impl VersionedEntity for JobDefinitionEntity {
    const ENTITY_TYPE: EntityType = EntityType::JobDefinition;

    fn entity_id(&self) -> Uuid {
        *self.id.as_uuid()
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }
}
