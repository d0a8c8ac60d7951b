use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityKey, EntityType, VersionedEntity};
use crate::id::{EventSubscriptionId, ExecutionId, TenantId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Signal,
}

/// Durable correlation target: "execution X waits for event Y".
///
/// Correlating an event triggers the subscription and deletes it in the same
/// transaction, so two correlators racing for the same subscription conflict
/// on the delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscriptionEntity {
    pub id: EventSubscriptionId,
    pub revision: u32,
    pub event_type: EventType,
    pub event_name: String,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ExecutionId>,
    pub activity_id: Option<String>,
    pub configuration: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub created_at: DateTime<Utc>,
}

impl EventSubscriptionEntity {
    pub fn message(event_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: EventSubscriptionId::new(),
            revision: 1,
            event_type: EventType::Message,
            event_name: event_name.into(),
            execution_id: None,
            process_instance_id: None,
            activity_id: None,
            configuration: None,
            tenant_id: None,
            created_at: now,
        }
    }

    pub fn on_execution(mut self, execution_id: ExecutionId, process_instance_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

impl VersionedEntity for EventSubscriptionEntity {
    const ENTITY_TYPE: EntityType = EntityType::EventSubscription;

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
        self.execution_id
            .map(|exec| vec![EntityKey::new(EntityType::Execution, exec)])
            .unwrap_or_default()
    }
}
