//! Job handlers and their registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use txflow_core::{VersionedEntity, deadline};
use txflow_core::model::JobEntity;

use super::retry::parse_duration;
use crate::command::CommandContext;
use crate::db::IgnoreConflictsOn;
use crate::error::EngineResult;

/// Job type served by [`EverLivingJobHandler`].
pub const EVER_LIVING_JOB_TYPE: &str = "ever-living";

/// What happens to the job row after its handler returned successfully.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job is done and gets deleted in the same flush.
    Completed,
    /// The handler rescheduled the job; the row stays.
    Rescheduled,
}

/// Business logic of a job type. Runs inside the execution transaction.
pub trait JobHandler: Send + Sync {
    fn execute(&self, ctx: &mut CommandContext, job: &JobEntity) -> EngineResult<JobOutcome>;
}

impl<F> JobHandler for F
where
    F: Fn(&mut CommandContext, &JobEntity) -> EngineResult<JobOutcome> + Send + Sync,
{
    fn execute(&self, ctx: &mut CommandContext, job: &JobEntity) -> EngineResult<JobOutcome> {
        self(ctx, job)
    }
}

/// Handlers by job type.
///
/// Lookup order: exact type, then `prefix.*` patterns, then `*`.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("JobHandlerRegistry").field("types", &types).finish()
    }
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(job_type.into(), Arc::new(handler));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        let mut patterns: Vec<(&String, &Arc<dyn JobHandler>)> = self
            .handlers
            .iter()
            .filter(|(pattern, _)| {
                pattern
                    .strip_suffix(".*")
                    .is_some_and(|prefix| job_type.starts_with(prefix) && job_type[prefix.len()..].starts_with('.'))
            })
            .collect();
        // Longest prefix wins.
        patterns.sort_by_key(|(pattern, _)| std::cmp::Reverse(pattern.len()));
        if let Some((_, h)) = patterns.first() {
            return Some((*h).clone());
        }

        self.handlers.get("*").cloned()
    }
}

/// A job that never completes: every run moves its due date forward.
///
/// The reschedule races whoever else touches the row (an acquirer whose lock
/// expired, a manual reschedule). Conflicts on the job row are ignored: the
/// competing write already produced a consistent due date.
#[derive(Debug, Clone, Default)]
pub struct EverLivingJobHandler {
    interval: Option<Duration>,
}

impl EverLivingJobHandler {
    /// Interval taken from the job's configuration (ISO-8601), or the engine default.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
        }
    }

    fn interval_for(&self, ctx: &CommandContext, job: &JobEntity) -> EngineResult<Duration> {
        if let Some(interval) = self.interval {
            return Ok(interval);
        }
        match job.handler_configuration.as_deref() {
            Some(text) => Ok(parse_duration(text)?),
            None => Ok(ctx.config().ever_living_job_interval()),
        }
    }
}

impl JobHandler for EverLivingJobHandler {
    fn execute(&self, ctx: &mut CommandContext, job: &JobEntity) -> EngineResult<JobOutcome> {
        let interval = self.interval_for(ctx, job)?;
        let next = deadline(ctx.now(), interval)?;
        ctx.add_conflict_listener(IgnoreConflictsOn(job.key()));

        if let Some(row) = ctx.find_mut::<JobEntity>(job.id)? {
            row.due_date = Some(next);
            row.unlock();
        }
        debug!(job_id = %job.id, due_date = %next, "ever-living job rescheduled");
        Ok(JobOutcome::Rescheduled)
    }
}
