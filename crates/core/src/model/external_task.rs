use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityKey, EntityType, VersionedEntity};
use crate::id::{ExecutionId, ExternalTaskId, TenantId};

/// Unit of work fetched and completed by an out-of-process worker.
///
/// Locking follows the same protocol as jobs: a worker id plus an expiration,
/// where an expired lock is free for anyone to take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTaskEntity {
    pub id: ExternalTaskId,
    pub revision: u32,
    pub topic_name: String,
    pub worker_id: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// `None` until the first failure is reported.
    pub retries: Option<i32>,
    pub priority: i64,
    pub suspended: bool,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub activity_id: Option<String>,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ExecutionId>,
    pub tenant_id: Option<TenantId>,
    pub created_at: DateTime<Utc>,
}

impl ExternalTaskEntity {
    pub fn new(topic_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ExternalTaskId::new(),
            revision: 1,
            topic_name: topic_name.into(),
            worker_id: None,
            lock_expiration_time: None,
            retries: None,
            priority: 0,
            suspended: false,
            error_message: None,
            error_details: None,
            activity_id: None,
            execution_id: None,
            process_instance_id: None,
            tenant_id: None,
            created_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_execution(mut self, execution_id: ExecutionId, process_instance_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiration_time.is_some_and(|expiration| expiration > now)
    }

    /// Whether `worker_id` holds the current, unexpired lock.
    pub fn is_locked_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.is_locked(now) && self.worker_id.as_deref() == Some(worker_id)
    }

    /// Active, unlocked and not exhausted.
    pub fn is_fetchable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && !self.is_locked(now) && self.retries.is_none_or(|r| r > 0)
    }

    pub fn lock(&mut self, worker_id: impl Into<String>, expiration: DateTime<Utc>) {
        self.worker_id = Some(worker_id.into());
        self.lock_expiration_time = Some(expiration);
    }

    pub fn unlock(&mut self) {
        self.worker_id = None;
        self.lock_expiration_time = None;
    }
}

impl VersionedEntity for ExternalTaskEntity {
    const ENTITY_TYPE: EntityType = EntityType::ExternalTask;

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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn lock_holder_is_tracked_until_expiration() {
        let now = Utc::now();
        let mut task = ExternalTaskEntity::new("billing", now);
        assert!(task.is_fetchable(now));

        task.lock("worker-a", now + Duration::seconds(30));
        assert!(task.is_locked_by("worker-a", now));
        assert!(!task.is_locked_by("worker-b", now));
        assert!(!task.is_fetchable(now));

        let later = now + Duration::seconds(31);
        assert!(!task.is_locked_by("worker-a", later));
        assert!(task.is_fetchable(later));
    }

    #[test]
    fn exhausted_task_is_not_fetchable() {
        let now = Utc::now();
        let mut task = ExternalTaskEntity::new("billing", now);
        task.retries = Some(0);
        assert!(!task.is_fetchable(now));
    }
}
