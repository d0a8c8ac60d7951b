//! Job acquisition: find due jobs and lock them for this engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use txflow_core::model::JobEntity;
use txflow_core::{EntityType, ExecutionId, JobId, deadline};

use crate::command::{Command, CommandContext};
use crate::db::{DbOperation, OptimisticLockingListener, OptimisticLockingResult};
use crate::error::EngineResult;

#[derive(Debug, Default)]
struct Acquired {
    batches: Vec<Vec<JobId>>,
    rejected: Vec<JobId>,
}

/// Result of one acquisition.
///
/// Jobs are grouped into batches that must run sequentially on one worker.
/// Jobs whose lock lost a race during flush are moved to `rejected`, which
/// is why the set is shared with the conflict listener of the acquiring
/// transaction.
#[derive(Debug, Clone, Default)]
pub struct AcquiredJobs {
    inner: Arc<Mutex<Acquired>>,
}

impl AcquiredJobs {
    fn state(&self) -> MutexGuard<'_, Acquired> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn batches(&self) -> Vec<Vec<JobId>> {
        self.state().batches.clone()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.state().batches.iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state().batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.state().batches.iter().any(|b| b.contains(&job_id))
    }

    /// Jobs that were selected but lost their lock to a concurrent writer.
    pub fn rejected(&self) -> Vec<JobId> {
        self.state().rejected.clone()
    }

    fn add_batch(&self, batch: Vec<JobId>) {
        if !batch.is_empty() {
            self.state().batches.push(batch);
        }
    }

    fn reject(&self, job_id: JobId) {
        let mut state = self.state();
        for batch in state.batches.iter_mut() {
            batch.retain(|id| *id != job_id);
        }
        state.batches.retain(|b| !b.is_empty());
        state.rejected.push(job_id);
    }
}

/// Drops jobs whose lock update hit a conflict instead of failing the batch.
struct AcquisitionConflictListener {
    acquired: AcquiredJobs,
}

impl OptimisticLockingListener for AcquisitionConflictListener {
    fn entity_type(&self) -> Option<EntityType> {
        Some(EntityType::Job)
    }

    fn failed_operation(&self, operation: &DbOperation) -> OptimisticLockingResult {
        match operation.entity_id() {
            Some(id) => {
                let job_id = JobId::from_uuid(id);
                debug!(job_id = %job_id, "job acquired by another transaction");
                self.acquired.reject(job_id);
                OptimisticLockingResult::Ignore
            }
            None => OptimisticLockingResult::Throw,
        }
    }
}

fn acquisition_order(a: &JobEntity, b: &JobEntity) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.due_date.cmp(&b.due_date))
        .then_with(|| a.id.cmp(&b.id))
}

/// Group selected jobs into batches: exclusive jobs of one process instance
/// share a batch, everything else runs alone.
fn batch_jobs(jobs: &[JobEntity]) -> Vec<Vec<JobId>> {
    let mut batches: Vec<Vec<JobId>> = Vec::new();
    let mut exclusive: BTreeMap<ExecutionId, usize> = BTreeMap::new();
    for job in jobs {
        match (job.exclusive, job.process_instance_id) {
            (true, Some(pi)) => match exclusive.get(&pi) {
                Some(&slot) => batches[slot].push(job.id),
                None => {
                    exclusive.insert(pi, batches.len());
                    batches.push(vec![job.id]);
                }
            },
            _ => batches.push(vec![job.id]),
        }
    }
    batches
}

/// Lock up to `max_jobs` acquirable jobs, highest priority first, then
/// oldest due date.
#[derive(Debug, Clone)]
pub struct AcquireJobs {
    max_jobs: usize,
    lock_owner: Option<String>,
}

impl AcquireJobs {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs,
            lock_owner: None,
        }
    }

    /// Acquire on behalf of another owner than the configured one.
    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    fn select(&self, ctx: &mut CommandContext, now: DateTime<Utc>) -> EngineResult<Vec<JobEntity>> {
        let mut due = ctx.find_where::<JobEntity>(|j| j.is_acquirable(now))?;
        due.sort_by(acquisition_order);
        due.truncate(self.max_jobs);
        Ok(due)
    }
}

impl Command<AcquiredJobs> for AcquireJobs {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<AcquiredJobs> {
        let now = ctx.now();
        let owner = self
            .lock_owner
            .clone()
            .unwrap_or_else(|| ctx.config().lock_owner.clone());
        let expiration = deadline(now, ctx.config().lock_time())?;

        let selected = self.select(ctx, now)?;
        let acquired = AcquiredJobs::default();
        ctx.add_conflict_listener(AcquisitionConflictListener {
            acquired: acquired.clone(),
        });

        for job in &selected {
            if let Some(row) = ctx.find_mut::<JobEntity>(job.id)? {
                row.lock(owner.clone(), expiration);
            }
        }
        for batch in batch_jobs(&selected) {
            acquired.add_batch(batch);
        }

        debug!(owner = %owner, selected = selected.len(), "jobs selected for acquisition");
        Ok(acquired)
    }

    fn name(&self) -> &str {
        "AcquireJobs"
    }
}
