use std::sync::Arc;

use tracing::{debug, trace};

use super::context::{CommandContext, TransactionState};
use super::Command;
use crate::engine::EngineCore;
use crate::error::EngineResult;
use crate::store::EntityStore;

/// Runs commands, each in a fresh transaction.
///
/// REQUIRED propagation at this level always opens a transaction: joining an
/// existing one is only possible through [`CommandContext::execute`].
#[derive(Clone)]
pub struct CommandExecutor {
    core: Arc<EngineCore>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor").finish_non_exhaustive()
    }
}

impl CommandExecutor {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    pub fn execute<T, C>(&self, command: &C) -> EngineResult<T>
    where
        C: Command<T> + ?Sized,
    {
        let tx = self.core.store.begin()?;
        let mut ctx = CommandContext::new(self.core.clone(), tx);
        trace!(%tx, command = command.name(), "command started");

        let outcome = command.execute(&mut ctx).and_then(|value| {
            ctx.flush()?;
            ctx.fire(TransactionState::Committing)?;
            ctx.commit()?;
            Ok(value)
        });

        match outcome {
            Ok(value) => {
                ctx.fire_after(TransactionState::Committed);
                trace!(%tx, command = command.name(), "command committed");
                Ok(value)
            }
            Err(err) => {
                ctx.rollback();
                ctx.fire_after(TransactionState::RolledBack);
                debug!(%tx, command = command.name(), error = %err, "command rolled back");
                Err(err)
            }
        }
    }

    /// Execute a closure as a command.
    pub fn run<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: Fn(&mut CommandContext) -> EngineResult<T>,
    {
        self.execute(&f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use txflow_core::model::{JobEntity, JobKind};
    use txflow_core::JobId;

    use crate::command::Propagation;
    use crate::engine::Engine;
    use crate::error::EngineError;

    fn job() -> JobEntity {
        JobEntity::new(JobKind::Message, "noop", 3, Utc::now())
    }

    #[test]
    fn committed_changes_are_visible_to_later_commands() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        let j = job();
        let id = j.id;

        executor.run(|ctx| ctx.insert(j.clone())).unwrap();
        let loaded = executor.run(|ctx| ctx.find::<JobEntity>(id)).unwrap().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.job_type, "noop");
    }

    #[test]
    fn failing_command_rolls_back_everything() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        let j = job();
        let id = j.id;

        let result: EngineResult<()> = executor.run(|ctx| {
            ctx.insert(j.clone())?;
            Err(EngineError::handler("boom"))
        });
        assert!(result.is_err());
        assert!(executor.run(|ctx| ctx.find::<JobEntity>(id)).unwrap().is_none());
    }

    #[test]
    fn required_joins_and_requires_new_commits_independently() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        let joined = job();
        let independent = job();
        let (joined_id, independent_id) = (joined.id, independent.id);

        let result: EngineResult<()> = executor.run(|ctx| {
            ctx.run(Propagation::Required, |inner| inner.insert(joined.clone()))?;
            // Shared cache: visible before any flush.
            assert!(ctx.find::<JobEntity>(joined_id)?.is_some());
            ctx.run(Propagation::RequiresNew, |inner| inner.insert(independent.clone()))?;
            Err(EngineError::handler("outer fails"))
        });
        assert!(result.is_err());

        let (joined_row, independent_row): (Option<JobEntity>, Option<JobEntity>) = executor
            .run(|ctx| Ok((ctx.find(joined_id)?, ctx.find(independent_id)?)))
            .unwrap();
        assert!(joined_row.is_none());
        assert!(independent_row.is_some());
    }

    #[test]
    fn updates_bump_revision_and_stale_writers_conflict() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        let j = job();
        let id = j.id;
        executor.run(|ctx| ctx.insert(j.clone())).unwrap();

        let stale: JobEntity = executor.run(|ctx| ctx.get(id)).unwrap();

        executor
            .run(|ctx| {
                if let Some(job) = ctx.find_mut::<JobEntity>(id)? {
                    job.priority = 5;
                }
                Ok(())
            })
            .unwrap();

        let err = executor
            .run(|ctx| {
                let mut mine = stale.clone();
                mine.priority = 7;
                ctx.update(mine)
            })
            .unwrap_err();
        assert!(err.is_optimistic_locking());

        let current: JobEntity = executor.run(|ctx| ctx.get(id)).unwrap();
        assert_eq!(current.priority, 5);
        assert_eq!(current.revision, 2);
    }

    #[test]
    fn transaction_listeners_fire_in_order() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        let events = Arc::new(Mutex::new(Vec::new()));

        let recorded = events.clone();
        executor
            .run(move |ctx| {
                for state in [TransactionState::Committed, TransactionState::Committing, TransactionState::RolledBack] {
                    let recorded = recorded.clone();
                    ctx.add_transaction_listener(state, move || {
                        recorded.lock().unwrap().push(state);
                        Ok(())
                    });
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![TransactionState::Committing, TransactionState::Committed]
        );
    }

    #[test]
    fn failing_committing_listener_rolls_back() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        let j = job();
        let id: JobId = j.id;

        let result: EngineResult<()> = executor.run(|ctx| {
            ctx.insert(j.clone())?;
            ctx.add_transaction_listener(TransactionState::Committing, || Err(EngineError::handler("veto")));
            Ok(())
        });
        assert!(result.is_err());
        assert!(executor.run(|ctx| ctx.find::<JobEntity>(id)).unwrap().is_none());
    }
}
