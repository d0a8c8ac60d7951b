//! External tasks: work fetched and completed by out-of-process workers.
//!
//! Locking mirrors job acquisition. A task locked by another worker (or lost
//! to a concurrent locker at flush) is a conflict, not a failure of the
//! whole fetch.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use txflow_core::model::ExternalTaskEntity;
use txflow_core::{DomainError, DomainResult, EntityType, ExternalTaskId, deadline, interval_from_millis};

use crate::command::{Command, CommandContext, CommandExecutor};
use crate::db::{DbOperation, OptimisticLockingListener, OptimisticLockingResult};
use crate::error::{EngineError, EngineResult};

/// Result of locking one task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Locked,
    /// Held by another worker, or another locker committed first.
    Conflict,
}

fn lock_until(now: DateTime<Utc>, millis: u64) -> DomainResult<DateTime<Utc>> {
    deadline(now, interval_from_millis(millis)?)
}

/// The caller must hold the task's lock.
fn require_holder(task: &ExternalTaskEntity, worker_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
    if task.is_locked_by(worker_id, now) {
        return Ok(());
    }
    let err = match (&task.worker_id, task.is_locked(now)) {
        (Some(holder), true) => DomainError::locked_by_other(EntityType::ExternalTask.name(), task.id, holder.clone()),
        _ => DomainError::invalid_state(format!(
            "external task '{}' is not locked by worker '{worker_id}'",
            task.id
        )),
    };
    Err(err.into())
}

#[derive(Debug, Clone)]
pub struct LockExternalTask {
    task_id: ExternalTaskId,
    worker_id: String,
    lock_duration_ms: u64,
}

impl LockExternalTask {
    pub fn new(task_id: ExternalTaskId, worker_id: impl Into<String>, lock_duration_ms: u64) -> Self {
        Self {
            task_id,
            worker_id: worker_id.into(),
            lock_duration_ms,
        }
    }
}

impl Command<()> for LockExternalTask {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let now = ctx.now();
        let mut task: ExternalTaskEntity = ctx.get(self.task_id)?;
        if task.is_locked(now) && !task.is_locked_by(&self.worker_id, now) {
            let holder = task.worker_id.clone().unwrap_or_default();
            return Err(DomainError::locked_by_other(EntityType::ExternalTask.name(), task.id, holder).into());
        }
        if task.suspended {
            return Err(DomainError::invalid_state(format!("external task '{}' is suspended", task.id)).into());
        }
        task.lock(self.worker_id.clone(), lock_until(now, self.lock_duration_ms)?);
        ctx.update(task)
    }

    fn name(&self) -> &str {
        "LockExternalTask"
    }
}

/// Tasks locked by one fetch. Shared with the fetch's conflict listener.
#[derive(Debug, Clone, Default)]
pub struct FetchedTasks {
    inner: Arc<Mutex<Vec<ExternalTaskEntity>>>,
}

impl FetchedTasks {
    fn state(&self) -> MutexGuard<'_, Vec<ExternalTaskEntity>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tasks(&self) -> Vec<ExternalTaskEntity> {
        self.state().clone()
    }

    pub fn len(&self) -> usize {
        self.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FetchConflictListener {
    fetched: FetchedTasks,
}

impl OptimisticLockingListener for FetchConflictListener {
    fn entity_type(&self) -> Option<EntityType> {
        Some(EntityType::ExternalTask)
    }

    fn failed_operation(&self, operation: &DbOperation) -> OptimisticLockingResult {
        match operation.entity_id() {
            Some(id) => {
                debug!(task_id = %id, "external task locked by another transaction");
                self.fetched.state().retain(|t| *t.id.as_uuid() != id);
                OptimisticLockingResult::Ignore
            }
            None => OptimisticLockingResult::Throw,
        }
    }
}

/// Lock up to `max_tasks` fetchable tasks of the given topics.
#[derive(Debug, Clone)]
pub struct FetchAndLock {
    worker_id: String,
    topics: Vec<String>,
    max_tasks: usize,
    lock_duration_ms: u64,
}

impl FetchAndLock {
    pub fn new(worker_id: impl Into<String>, max_tasks: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            topics: Vec::new(),
            max_tasks,
            lock_duration_ms: 0,
        }
    }

    pub fn topic(mut self, topic: impl Into<String>, lock_duration_ms: u64) -> Self {
        self.topics.push(topic.into());
        self.lock_duration_ms = lock_duration_ms;
        self
    }
}

impl Command<FetchedTasks> for FetchAndLock {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<FetchedTasks> {
        let now = ctx.now();
        let mut candidates = ctx.find_where::<ExternalTaskEntity>(|t| {
            t.is_fetchable(now) && self.topics.iter().any(|topic| *topic == t.topic_name)
        })?;
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(self.max_tasks);

        let fetched = FetchedTasks::default();
        ctx.add_conflict_listener(FetchConflictListener {
            fetched: fetched.clone(),
        });
        let expiration = lock_until(now, self.lock_duration_ms)?;
        for candidate in candidates {
            if let Some(task) = ctx.find_mut::<ExternalTaskEntity>(candidate.id)? {
                task.lock(self.worker_id.clone(), expiration);
                let locked = task.clone();
                fetched.state().push(locked);
            }
        }
        debug!(worker_id = %self.worker_id, fetched = fetched.len(), "external tasks locked");
        Ok(fetched)
    }

    fn name(&self) -> &str {
        "FetchAndLock"
    }
}

/// External task entry points; each call is one transaction.
#[derive(Debug, Clone)]
pub struct ExternalTaskService {
    executor: CommandExecutor,
}

impl ExternalTaskService {
    pub(crate) fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    pub fn create(&self, task: ExternalTaskEntity) -> EngineResult<ExternalTaskId> {
        let id = task.id;
        self.executor.run(|ctx| ctx.insert(task.clone()))?;
        Ok(id)
    }

    pub fn task(&self, id: ExternalTaskId) -> EngineResult<Option<ExternalTaskEntity>> {
        self.executor.run(|ctx| ctx.find(id))
    }

    /// Lock one task for `worker_id`. A competing holder or a lost race is
    /// reported as [`LockOutcome::Conflict`]; anything else is an error.
    pub fn lock(&self, task_id: ExternalTaskId, worker_id: &str, lock_duration_ms: u64) -> EngineResult<LockOutcome> {
        match self
            .executor
            .execute(&LockExternalTask::new(task_id, worker_id, lock_duration_ms))
        {
            Ok(()) => Ok(LockOutcome::Locked),
            Err(EngineError::Domain(DomainError::LockedByOtherWorker { .. })) => Ok(LockOutcome::Conflict),
            Err(e) if e.is_optimistic_locking() => {
                debug!(task_id = %task_id, worker_id, "external task lock lost to a concurrent locker");
                Ok(LockOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    pub fn fetch_and_lock(
        &self,
        worker_id: &str,
        topic: &str,
        max_tasks: usize,
        lock_duration_ms: u64,
    ) -> EngineResult<Vec<ExternalTaskEntity>> {
        let fetched = self
            .executor
            .execute(&FetchAndLock::new(worker_id, max_tasks).topic(topic, lock_duration_ms))?;
        Ok(fetched.tasks())
    }

    pub fn extend_lock(&self, task_id: ExternalTaskId, worker_id: &str, new_duration_ms: u64) -> EngineResult<()> {
        self.executor.run(|ctx| {
            let now = ctx.now();
            let mut task: ExternalTaskEntity = ctx.get(task_id)?;
            require_holder(&task, worker_id, now)?;
            task.lock_expiration_time = Some(lock_until(now, new_duration_ms)?);
            ctx.update(task)
        })
    }

    /// Release a lock regardless of its holder.
    pub fn unlock(&self, task_id: ExternalTaskId) -> EngineResult<()> {
        self.executor.run(|ctx| {
            let mut task: ExternalTaskEntity = ctx.get(task_id)?;
            task.unlock();
            ctx.update(task)
        })
    }

    pub fn complete(&self, task_id: ExternalTaskId, worker_id: &str) -> EngineResult<()> {
        self.executor.run(|ctx| {
            let now = ctx.now();
            let task: ExternalTaskEntity = ctx.get(task_id)?;
            require_holder(&task, worker_id, now)?;
            ctx.delete(&task)?;
            info!(task_id = %task_id, worker_id, topic = %task.topic_name, "external task completed");
            Ok(())
        })
    }

    /// Record a failure. The task becomes fetchable again after `retry_timeout_ms`
    /// unless `retries` is 0.
    pub fn handle_failure(
        &self,
        task_id: ExternalTaskId,
        worker_id: &str,
        error_message: &str,
        error_details: Option<String>,
        retries: i32,
        retry_timeout_ms: u64,
    ) -> EngineResult<()> {
        if retries < 0 {
            return Err(DomainError::validation(format!("retries must not be negative, got {retries}")).into());
        }
        self.executor.run(|ctx| {
            let now = ctx.now();
            let mut task: ExternalTaskEntity = ctx.get(task_id)?;
            require_holder(&task, worker_id, now)?;
            task.error_message = Some(error_message.to_string());
            task.error_details = error_details.clone();
            task.retries = Some(retries);
            task.lock_expiration_time = Some(lock_until(now, retry_timeout_ms)?);
            if retries == 0 {
                warn!(task_id = %task_id, topic = %task.topic_name, error = error_message, "external task has no retries left");
            }
            ctx.update(task)
        })
    }

    pub fn set_retries(&self, task_id: ExternalTaskId, retries: i32) -> EngineResult<()> {
        if retries < 0 {
            return Err(DomainError::validation(format!("retries must not be negative, got {retries}")).into());
        }
        self.executor.run(|ctx| {
            let mut task: ExternalTaskEntity = ctx.get(task_id)?;
            task.retries = Some(retries);
            ctx.update(task)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use txflow_core::{Clock, ControlledClock};

    use crate::engine::Engine;

    fn engine_with_clock() -> (Engine, Arc<ControlledClock>) {
        let clock = Arc::new(ControlledClock::pinned_at(Utc::now()));
        let engine = Engine::builder().with_clock(clock.clone()).build().unwrap();
        (engine, clock)
    }

    #[test]
    fn lock_conflicts_with_other_worker_until_expiry() {
        let (engine, clock) = engine_with_clock();
        let tasks = engine.external_tasks();
        let id = tasks.create(ExternalTaskEntity::new("billing", clock.now())).unwrap();

        assert_eq!(tasks.lock(id, "worker-a", 1_000).unwrap(), LockOutcome::Locked);
        assert_eq!(tasks.lock(id, "worker-b", 1_000).unwrap(), LockOutcome::Conflict);
        // Re-locking by the holder extends.
        assert_eq!(tasks.lock(id, "worker-a", 5_000).unwrap(), LockOutcome::Locked);

        clock.advance(Duration::seconds(6));
        assert_eq!(tasks.lock(id, "worker-b", 1_000).unwrap(), LockOutcome::Locked);
        let task = tasks.task(id).unwrap().unwrap();
        assert_eq!(task.worker_id.as_deref(), Some("worker-b"));
    }

    #[test]
    fn fetch_and_lock_prefers_priority_and_skips_locked() {
        let (engine, clock) = engine_with_clock();
        let tasks = engine.external_tasks();
        let now = clock.now();
        let low = tasks.create(ExternalTaskEntity::new("billing", now)).unwrap();
        let high = tasks
            .create(ExternalTaskEntity::new("billing", now).with_priority(10))
            .unwrap();
        tasks.create(ExternalTaskEntity::new("shipping", now)).unwrap();

        let fetched = tasks.fetch_and_lock("worker-a", "billing", 1, 10_000).unwrap();
        assert_eq!(fetched.iter().map(|t| t.id).collect::<Vec<_>>(), vec![high]);

        let fetched = tasks.fetch_and_lock("worker-b", "billing", 5, 10_000).unwrap();
        assert_eq!(fetched.iter().map(|t| t.id).collect::<Vec<_>>(), vec![low]);
        assert!(tasks.fetch_and_lock("worker-c", "billing", 5, 10_000).unwrap().is_empty());
    }

    #[test]
    fn only_the_holder_completes() {
        let (engine, clock) = engine_with_clock();
        let tasks = engine.external_tasks();
        let id = tasks.create(ExternalTaskEntity::new("billing", clock.now())).unwrap();

        let err = tasks.complete(id, "worker-a").unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::InvalidState(_))));

        tasks.lock(id, "worker-a", 10_000).unwrap();
        let err = tasks.complete(id, "worker-b").unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::LockedByOtherWorker { .. })));

        tasks.complete(id, "worker-a").unwrap();
        assert!(tasks.task(id).unwrap().is_none());
    }

    #[test]
    fn failure_hides_task_until_retry_timeout() {
        let (engine, clock) = engine_with_clock();
        let tasks = engine.external_tasks();
        let id = tasks.create(ExternalTaskEntity::new("billing", clock.now())).unwrap();
        tasks.lock(id, "worker-a", 10_000).unwrap();

        tasks
            .handle_failure(id, "worker-a", "upstream down", Some("503".into()), 2, 30_000)
            .unwrap();
        let task = tasks.task(id).unwrap().unwrap();
        assert_eq!(task.retries, Some(2));
        assert_eq!(task.error_message.as_deref(), Some("upstream down"));
        assert!(tasks.fetch_and_lock("worker-b", "billing", 1, 1_000).unwrap().is_empty());

        clock.advance(Duration::seconds(31));
        assert_eq!(tasks.fetch_and_lock("worker-b", "billing", 1, 1_000).unwrap().len(), 1);
    }

    #[test]
    fn exhausted_task_is_not_fetched_until_retries_are_reset() {
        let (engine, clock) = engine_with_clock();
        let tasks = engine.external_tasks();
        let id = tasks.create(ExternalTaskEntity::new("billing", clock.now())).unwrap();
        tasks.lock(id, "worker-a", 10_000).unwrap();
        tasks.handle_failure(id, "worker-a", "fatal", None, 0, 0).unwrap();
        assert!(tasks.fetch_and_lock("worker-a", "billing", 1, 1_000).unwrap().is_empty());

        tasks.set_retries(id, 1).unwrap();
        assert_eq!(tasks.fetch_and_lock("worker-a", "billing", 1, 1_000).unwrap().len(), 1);
    }

    #[test]
    fn extend_lock_requires_the_holder() {
        let (engine, clock) = engine_with_clock();
        let tasks = engine.external_tasks();
        let id = tasks.create(ExternalTaskEntity::new("billing", clock.now())).unwrap();
        tasks.lock(id, "worker-a", 1_000).unwrap();

        assert!(tasks.extend_lock(id, "worker-b", 60_000).is_err());
        tasks.extend_lock(id, "worker-a", 60_000).unwrap();
        clock.advance(Duration::seconds(30));
        assert_eq!(tasks.lock(id, "worker-b", 1_000).unwrap(), LockOutcome::Conflict);

        tasks.unlock(id).unwrap();
        assert_eq!(tasks.lock(id, "worker-b", 1_000).unwrap(), LockOutcome::Locked);
    }

    #[test]
    fn oversized_lock_durations_are_rejected_without_locking() {
        let (engine, clock) = engine_with_clock();
        let tasks = engine.external_tasks();
        let id = tasks.create(ExternalTaskEntity::new("billing", clock.now())).unwrap();

        let err = tasks.lock(id, "worker-a", u64::MAX).unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::Validation(_))));
        assert!(tasks.fetch_and_lock("worker-a", "billing", 1, u64::MAX).is_err());
        assert!(tasks.task(id).unwrap().unwrap().worker_id.is_none());

        tasks.lock(id, "worker-a", 1_000).unwrap();
        assert!(tasks.extend_lock(id, "worker-a", u64::MAX).is_err());
        assert!(tasks.handle_failure(id, "worker-a", "boom", None, 1, u64::MAX).is_err());
        assert_eq!(tasks.lock(id, "worker-b", 1_000).unwrap(), LockOutcome::Conflict);
    }
}
