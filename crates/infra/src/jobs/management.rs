//! Administrative job operations and queries.
//!
//! Cascades from a job definition to its jobs are bulk statements. Suspension
//! bumps the revision of every affected job so that an execution holding a
//! stale copy loses; a priority change does not, so a running execution still
//! completes.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use txflow_core::model::{JobDefinitionEntity, JobEntity};
use txflow_core::{DomainError, EntityType, ExecutionId, JobDefinitionId, JobId, VersionedEntity};

use crate::command::{Command, CommandContext, CommandExecutor};
use crate::db::{BulkUpdate, IgnoreConflictsOn};
use crate::error::EngineResult;
use crate::store::{FieldFilter, FieldPatch};

fn jobs_of(definition_id: JobDefinitionId) -> FieldFilter {
    FieldFilter::new().eq("job_definition_id", definition_id.to_string())
}

/// Suspend or activate a job definition, optionally with all of its jobs.
#[derive(Debug, Clone)]
pub struct SuspendJobDefinition {
    definition_id: JobDefinitionId,
    suspend: bool,
    include_jobs: bool,
}

impl SuspendJobDefinition {
    pub fn suspend(definition_id: JobDefinitionId) -> Self {
        Self {
            definition_id,
            suspend: true,
            include_jobs: false,
        }
    }

    pub fn activate(definition_id: JobDefinitionId) -> Self {
        Self {
            suspend: false,
            ..Self::suspend(definition_id)
        }
    }

    pub fn including_jobs(mut self) -> Self {
        self.include_jobs = true;
        self
    }
}

impl Command<()> for SuspendJobDefinition {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let mut definition: JobDefinitionEntity = ctx.get(self.definition_id)?;
        definition.suspended = self.suspend;
        ctx.update(definition)?;

        if self.include_jobs {
            ctx.bulk_update(BulkUpdate {
                entity_type: EntityType::Job,
                filter: jobs_of(self.definition_id),
                patch: FieldPatch::new().set("suspended", self.suspend),
                increment_revision: true,
            });
        }
        info!(definition_id = %self.definition_id, suspended = self.suspend, include_jobs = self.include_jobs, "job definition suspension state changed");
        Ok(())
    }

    fn name(&self) -> &str {
        "SuspendJobDefinition"
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum JobTarget {
    One(JobId),
    OfDefinition(JobDefinitionId),
}

/// Suspend or activate one job, or every job of a definition without
/// touching the definition itself.
#[derive(Debug, Clone)]
pub struct SuspendJob {
    target: JobTarget,
    suspend: bool,
}

impl SuspendJob {
    pub fn suspend(job_id: JobId) -> Self {
        Self {
            target: JobTarget::One(job_id),
            suspend: true,
        }
    }

    pub fn activate(job_id: JobId) -> Self {
        Self {
            target: JobTarget::One(job_id),
            suspend: false,
        }
    }

    pub fn suspend_by_definition(definition_id: JobDefinitionId) -> Self {
        Self {
            target: JobTarget::OfDefinition(definition_id),
            suspend: true,
        }
    }

    pub fn activate_by_definition(definition_id: JobDefinitionId) -> Self {
        Self {
            target: JobTarget::OfDefinition(definition_id),
            suspend: false,
        }
    }
}

impl Command<()> for SuspendJob {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        match self.target {
            JobTarget::One(job_id) => {
                let mut job: JobEntity = ctx.get(job_id)?;
                job.suspended = self.suspend;
                ctx.update(job)
            }
            JobTarget::OfDefinition(definition_id) => {
                ctx.bulk_update(BulkUpdate {
                    entity_type: EntityType::Job,
                    filter: jobs_of(definition_id),
                    patch: FieldPatch::new().set("suspended", self.suspend),
                    increment_revision: true,
                });
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "SuspendJob"
    }
}

/// Set (or clear) the overriding priority of a job definition.
#[derive(Debug, Clone)]
pub struct SetJobDefinitionPriority {
    definition_id: JobDefinitionId,
    priority: Option<i64>,
    cascade: bool,
}

impl SetJobDefinitionPriority {
    pub fn new(definition_id: JobDefinitionId, priority: Option<i64>) -> Self {
        Self {
            definition_id,
            priority,
            cascade: false,
        }
    }

    /// Also apply the priority to the definition's existing jobs.
    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }
}

impl Command<()> for SetJobDefinitionPriority {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let mut definition: JobDefinitionEntity = ctx.get(self.definition_id)?;
        definition.overriding_priority = self.priority;
        ctx.update(definition)?;

        if let (true, Some(priority)) = (self.cascade, self.priority) {
            ctx.bulk_update(BulkUpdate {
                entity_type: EntityType::Job,
                filter: jobs_of(self.definition_id),
                patch: FieldPatch::new().set("priority", priority),
                increment_revision: false,
            });
        }
        debug!(definition_id = %self.definition_id, priority = ?self.priority, cascade = self.cascade, "job definition priority set");
        Ok(())
    }

    fn name(&self) -> &str {
        "SetJobDefinitionPriority"
    }
}

/// Give a job a new number of retries; restores a permanently failed job.
#[derive(Debug, Clone)]
pub struct SetJobRetries {
    job_id: JobId,
    retries: i32,
}

impl SetJobRetries {
    pub fn new(job_id: JobId, retries: i32) -> Self {
        Self { job_id, retries }
    }
}

impl Command<()> for SetJobRetries {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        if self.retries < 0 {
            return Err(DomainError::validation(format!("retries must not be negative, got {}", self.retries)).into());
        }
        let mut job: JobEntity = ctx.get(self.job_id)?;
        job.retries = self.retries;
        ctx.update(job)
    }

    fn name(&self) -> &str {
        "SetJobRetries"
    }
}

/// Move a job's due date.
#[derive(Debug, Clone)]
pub struct SetJobDueDate {
    job_id: JobId,
    due_date: Option<DateTime<Utc>>,
    ignore_conflicts: bool,
}

impl SetJobDueDate {
    pub fn new(job_id: JobId, due_date: Option<DateTime<Utc>>) -> Self {
        Self {
            job_id,
            due_date,
            ignore_conflicts: false,
        }
    }

    /// Treat a concurrent write of the job row as having won: the due date
    /// that row carries now stands.
    pub fn ignoring_conflicts(mut self) -> Self {
        self.ignore_conflicts = true;
        self
    }
}

impl Command<()> for SetJobDueDate {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let mut job: JobEntity = ctx.get(self.job_id)?;
        if self.ignore_conflicts {
            ctx.add_conflict_listener(IgnoreConflictsOn(job.key()));
        }
        job.due_date = self.due_date;
        ctx.update(job)
    }

    fn name(&self) -> &str {
        "SetJobDueDate"
    }
}

#[derive(Debug, Clone)]
pub struct DeleteJob {
    job_id: JobId,
}

impl DeleteJob {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

impl Command<()> for DeleteJob {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        if !ctx.delete_by_id::<JobEntity>(self.job_id)? {
            return Err(DomainError::not_found(EntityType::Job.name(), self.job_id).into());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "DeleteJob"
    }
}

/// Filter over jobs. Every criterion that is set must match.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    definition_id: Option<JobDefinitionId>,
    process_instance_id: Option<ExecutionId>,
    job_type: Option<String>,
    executable: bool,
    locked: bool,
    with_retries_left: bool,
    no_retries_left: bool,
    suspended: Option<bool>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_definition(mut self, id: JobDefinitionId) -> Self {
        self.definition_id = Some(id);
        self
    }

    pub fn process_instance(mut self, id: ExecutionId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Due, with retries left (suspension is not considered).
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    /// Holding an unexpired lock.
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn with_retries_left(mut self) -> Self {
        self.with_retries_left = true;
        self
    }

    pub fn no_retries_left(mut self) -> Self {
        self.no_retries_left = true;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = Some(true);
        self
    }

    pub fn active(mut self) -> Self {
        self.suspended = Some(false);
        self
    }

    pub fn matches(&self, job: &JobEntity, now: DateTime<Utc>) -> bool {
        self.definition_id.is_none_or(|id| job.job_definition_id == Some(id))
            && self.process_instance_id.is_none_or(|id| job.process_instance_id == Some(id))
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
            && (!self.executable || (job.retries > 0 && job.is_due(now)))
            && (!self.locked || job.is_lock_held(now))
            && (!self.with_retries_left || job.retries > 0)
            && (!self.no_retries_left || job.retries == 0)
            && self.suspended.is_none_or(|s| job.suspended == s)
    }
}

/// Management entry points; each call is one transaction.
#[derive(Debug, Clone)]
pub struct ManagementService {
    executor: CommandExecutor,
}

impl ManagementService {
    pub(crate) fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    pub fn create_job_definition(&self, definition: JobDefinitionEntity) -> EngineResult<JobDefinitionId> {
        let id = definition.id;
        self.executor.run(|ctx| ctx.insert(definition.clone()))?;
        Ok(id)
    }

    pub fn job_definition(&self, id: JobDefinitionId) -> EngineResult<Option<JobDefinitionEntity>> {
        self.executor.run(|ctx| ctx.find(id))
    }

    /// Delete a definition; with `cascade` its jobs go in the same flush.
    pub fn delete_job_definition(&self, id: JobDefinitionId, cascade: bool) -> EngineResult<()> {
        self.executor.run(|ctx| {
            if cascade {
                for job in ctx.find_where::<JobEntity>(|j| j.job_definition_id == Some(id))? {
                    ctx.delete(&job)?;
                }
            }
            if !ctx.delete_by_id::<JobDefinitionEntity>(id)? {
                return Err(DomainError::not_found(EntityType::JobDefinition.name(), id).into());
            }
            Ok(())
        })
    }

    /// Schedule a job. Priority override and suspension of its definition
    /// are inherited.
    pub fn create_job(&self, job: JobEntity) -> EngineResult<JobId> {
        let id = job.id;
        self.executor.run(|ctx| {
            let mut job = job.clone();
            if let Some(def_id) = job.job_definition_id {
                let definition: JobDefinitionEntity = ctx.get(def_id)?;
                if let Some(priority) = definition.overriding_priority {
                    job.priority = priority;
                }
                job.suspended |= definition.suspended;
                if job.tenant_id.is_none() {
                    job.tenant_id = definition.tenant_id;
                }
            }
            ctx.insert(job)
        })?;
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> EngineResult<Option<JobEntity>> {
        self.executor.run(|ctx| ctx.find(id))
    }

    pub fn jobs(&self, query: &JobQuery) -> EngineResult<Vec<JobEntity>> {
        self.executor.run(|ctx| {
            let now = ctx.now();
            ctx.find_where::<JobEntity>(|j| query.matches(j, now))
        })
    }

    pub fn count_jobs(&self, query: &JobQuery) -> EngineResult<usize> {
        Ok(self.jobs(query)?.len())
    }

    pub fn delete_job(&self, id: JobId) -> EngineResult<()> {
        self.executor.execute(&DeleteJob::new(id))
    }

    pub fn suspend_job_definition(&self, id: JobDefinitionId, include_jobs: bool) -> EngineResult<()> {
        let command = SuspendJobDefinition::suspend(id);
        self.executor
            .execute(&if include_jobs { command.including_jobs() } else { command })
    }

    pub fn activate_job_definition(&self, id: JobDefinitionId, include_jobs: bool) -> EngineResult<()> {
        let command = SuspendJobDefinition::activate(id);
        self.executor
            .execute(&if include_jobs { command.including_jobs() } else { command })
    }

    pub fn suspend_job(&self, id: JobId) -> EngineResult<()> {
        self.executor.execute(&SuspendJob::suspend(id))
    }

    pub fn activate_job(&self, id: JobId) -> EngineResult<()> {
        self.executor.execute(&SuspendJob::activate(id))
    }

    pub fn suspend_jobs_of_definition(&self, id: JobDefinitionId) -> EngineResult<()> {
        self.executor.execute(&SuspendJob::suspend_by_definition(id))
    }

    pub fn activate_jobs_of_definition(&self, id: JobDefinitionId) -> EngineResult<()> {
        self.executor.execute(&SuspendJob::activate_by_definition(id))
    }

    pub fn set_job_definition_priority(&self, id: JobDefinitionId, priority: Option<i64>, cascade: bool) -> EngineResult<()> {
        let command = SetJobDefinitionPriority::new(id, priority);
        self.executor
            .execute(&if cascade { command.cascade() } else { command })
    }

    pub fn set_job_retries(&self, id: JobId, retries: i32) -> EngineResult<()> {
        self.executor.execute(&SetJobRetries::new(id, retries))
    }

    pub fn set_job_due_date(&self, id: JobId, due_date: Option<DateTime<Utc>>) -> EngineResult<()> {
        self.executor.execute(&SetJobDueDate::new(id, due_date))
    }
}
