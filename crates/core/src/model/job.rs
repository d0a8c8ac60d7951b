//! Job rows and the lock protocol.
//!
//! ```text
//!            acquire (lock owner + expiration)
//!  PENDING ─────────────────────────────────────► LOCKED
//!     ▲                                             │
//!     │ unlock (retries left / due date delayed)    ├──► COMPLETED (row deleted)
//!     └─────────────────────────────────────────────┤
//!                                                   └──► EXHAUSTED (retries = 0)
//! ```
//!
//! A lock whose expiration lies in the past is not held: the job becomes
//! acquirable again and a stale holder loses on its next revision-checked write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityKey, EntityType, VersionedEntity};
use crate::id::{ExecutionId, JobDefinitionId, JobId, TenantId};

/// How a job came to be scheduled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Asynchronous continuation, due immediately.
    Message,
    /// Due at a point in time.
    Timer,
    /// Reschedules itself after every execution instead of being deleted.
    EverLiving,
}

/// Derived lifecycle state of a job row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Locked,
    Suspended,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: JobId,
    pub revision: u32,
    pub kind: JobKind,
    /// Handler routing key.
    pub job_type: String,
    pub handler_configuration: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub retries: i32,
    pub priority: i64,
    pub suspended: bool,
    pub exclusive: bool,
    pub exception_message: Option<String>,
    pub exception_stacktrace: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub job_definition_id: Option<JobDefinitionId>,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
}

impl JobEntity {
    pub fn new(kind: JobKind, job_type: impl Into<String>, retries: i32, now: DateTime<Utc>) -> Self {
        let due_date = match kind {
            JobKind::Message => None,
            JobKind::Timer | JobKind::EverLiving => Some(now),
        };
        Self {
            id: JobId::new(),
            revision: 1,
            kind,
            job_type: job_type.into(),
            handler_configuration: None,
            due_date,
            lock_owner: None,
            lock_expiration_time: None,
            retries,
            priority: 0,
            suspended: false,
            exclusive: true,
            exception_message: None,
            exception_stacktrace: None,
            tenant_id: None,
            job_definition_id: None,
            execution_id: None,
            process_instance_id: None,
            created_at: now,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.handler_configuration = Some(configuration.into());
        self
    }

    pub fn with_definition(mut self, job_definition_id: JobDefinitionId) -> Self {
        self.job_definition_id = Some(job_definition_id);
        self
    }

    pub fn with_execution(mut self, execution_id: ExecutionId, process_instance_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    /// Whether some executor currently holds an unexpired lock.
    pub fn is_lock_held(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expiration)) => expiration > now,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Candidate for acquisition: due, not locked (or lock expired), retries left, active.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.retries > 0 && self.is_due(now) && !self.is_lock_held(now)
    }

    pub fn lock(&mut self, owner: impl Into<String>, expiration: DateTime<Utc>) {
        self.lock_owner = Some(owner.into());
        self.lock_expiration_time = Some(expiration);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// No failure has been recorded on this job yet.
    pub fn is_first_execution(&self) -> bool {
        self.exception_message.is_none() && self.exception_stacktrace.is_none()
    }

    pub fn record_exception(&mut self, message: impl Into<String>, stacktrace: Option<String>) {
        self.exception_message = Some(message.into());
        self.exception_stacktrace = stacktrace;
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.suspended {
            JobState::Suspended
        } else if self.retries <= 0 {
            JobState::Exhausted
        } else if self.is_lock_held(now) {
            JobState::Locked
        } else {
            JobState::Pending
        }
    }
}

impl VersionedEntity for JobEntity {
    const ENTITY_TYPE: EntityType = EntityType::Job;

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
        if let Some(def) = self.job_definition_id {
            refs.push(EntityKey::new(EntityType::JobDefinition, def));
        }
        if let Some(exec) = self.execution_id {
            refs.push(EntityKey::new(EntityType::Execution, exec));
        }
        refs
    }
}
