//! Job execution and failure recording.
//!
//! ```text
//! execute_job(job_id)
//!   ├─ tx 1: ExecuteJob ── load job, snapshot it into the collector
//!   │                    ── run handler
//!   │                    ── Completed ⇒ delete job (same flush) │ Rescheduled ⇒ keep
//!   │        commit ⇒ Ok(outcome)
//!   └─ any error ⇒ tx 1 rolled back
//!        tx 2: HandleFailedJob ── reload job (gone ⇒ nothing to do)
//!                              ── re-acquired meanwhile ⇒ leave it alone
//!                              ── resolve retry policy, apply, update
//!        ⇒ Err(original error)
//! ```

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use txflow_core::JobId;
use txflow_core::model::{JobDefinitionEntity, JobEntity};

use super::handler::JobOutcome;
use super::retry::JobFailure;
use crate::command::{Command, CommandContext, CommandExecutor};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobExecutionOutcome {
    /// Handler succeeded and the job was deleted.
    Completed,
    /// Handler succeeded and the job stays scheduled.
    Rescheduled,
    /// The job no longer exists.
    NotFound,
}

/// Carries the job as the execution transaction saw it over to the failure
/// transaction.
#[derive(Debug, Clone, Default)]
pub struct JobFailureCollector {
    snapshot: Arc<Mutex<Option<JobEntity>>>,
}

impl JobFailureCollector {
    pub fn snapshot(&self) -> Option<JobEntity> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, job: JobEntity) {
        *self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(job);
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteJob {
    job_id: JobId,
    collector: JobFailureCollector,
}

impl ExecuteJob {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            collector: JobFailureCollector::default(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn collector(&self) -> &JobFailureCollector {
        &self.collector
    }
}

impl Command<JobExecutionOutcome> for ExecuteJob {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobExecutionOutcome> {
        let Some(job) = ctx.find::<JobEntity>(self.job_id)? else {
            debug!(job_id = %self.job_id, "job to execute does not exist");
            return Ok(JobExecutionOutcome::NotFound);
        };
        self.collector.record(job.clone());

        let handler = ctx.core().job_handlers.get(&job.job_type).ok_or_else(|| {
            EngineError::handler(format!("no handler registered for job type '{}'", job.job_type))
        })?;

        match handler.execute(ctx, &job)? {
            JobOutcome::Completed => {
                ctx.delete_by_id::<JobEntity>(job.id)?;
                debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
                Ok(JobExecutionOutcome::Completed)
            }
            JobOutcome::Rescheduled => Ok(JobExecutionOutcome::Rescheduled),
        }
    }

    fn name(&self) -> &str {
        "ExecuteJob"
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure recorded; `retries` is what the job has left.
    Recorded { retries: i32 },
    /// Another executor owns the job by now.
    Skipped,
    NotFound,
}

/// Records a failed execution on the job, in its own transaction.
#[derive(Debug, Clone)]
pub struct HandleFailedJob {
    job_id: JobId,
    snapshot: Option<JobEntity>,
    failure: JobFailure,
}

impl HandleFailedJob {
    pub fn new(job_id: JobId, snapshot: Option<JobEntity>, failure: JobFailure) -> Self {
        Self {
            job_id,
            snapshot,
            failure,
        }
    }

    fn reacquired_meanwhile(&self, current: &JobEntity) -> bool {
        match &self.snapshot {
            Some(seen) => {
                current.lock_expiration_time.is_some() && current.lock_expiration_time != seen.lock_expiration_time
            }
            None => false,
        }
    }
}

impl Command<FailureOutcome> for HandleFailedJob {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<FailureOutcome> {
        let Some(mut job) = ctx.find::<JobEntity>(self.job_id)? else {
            debug!(job_id = %self.job_id, "failed job was deleted meanwhile");
            return Ok(FailureOutcome::NotFound);
        };
        if self.reacquired_meanwhile(&job) {
            debug!(job_id = %self.job_id, "failed job was re-acquired meanwhile, leaving it untouched");
            return Ok(FailureOutcome::Skipped);
        }

        let definition = match job.job_definition_id {
            Some(id) => ctx.find::<JobDefinitionEntity>(id)?,
            None => None,
        };
        let policy = ctx.core().retry_policies.resolve(&job, definition.as_ref(), ctx.config());
        policy.apply(&mut job, &self.failure, ctx.now())?;

        if job.retries == 0 {
            warn!(job_id = %job.id, job_type = %job.job_type, error = %self.failure.message, "job has no retries left");
        } else {
            debug!(job_id = %job.id, retries = job.retries, due_date = ?job.due_date, "job failure recorded");
        }
        let retries = job.retries;
        ctx.update(job)?;
        Ok(FailureOutcome::Recorded { retries })
    }

    fn name(&self) -> &str {
        "HandleFailedJob"
    }
}

/// Run `command` (usually `job` itself, possibly wrapped) and record a
/// failure on the job if it fails.
pub fn execute_job_with<C>(executor: &CommandExecutor, job: &ExecuteJob, command: &C) -> EngineResult<JobExecutionOutcome>
where
    C: Command<JobExecutionOutcome> + ?Sized,
{
    match executor.execute(command) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            debug!(job_id = %job.job_id, error = %err, "job execution failed");
            let handler = HandleFailedJob::new(job.job_id, job.collector.snapshot(), JobFailure::from_error(&err));
            if let Err(recording) = executor.execute(&handler) {
                warn!(job_id = %job.job_id, error = %recording, "could not record job failure");
            }
            Err(err)
        }
    }
}

pub fn execute_job(executor: &CommandExecutor, job_id: JobId) -> EngineResult<JobExecutionOutcome> {
    let job = ExecuteJob::new(job_id);
    execute_job_with(executor, &job, &job)
}
