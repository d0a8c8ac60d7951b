//! Execution tree maintenance.
//!
//! ```text
//!   fork:     PI(active, a)            ──►  PI(inactive)
//!                                             ├─ child(b, concurrent)
//!                                             └─ child(c, concurrent)
//!
//!   end child c, one child left  ──►  PI(active, b)   (b merged into PI,
//!                                                       dependents re-pointed)
//! ```
//!
//! Ending a concurrent child always writes the parent, so two siblings that
//! end at the same time conflict on the parent's revision instead of both
//! deciding they are not the last one.

use tracing::debug;

use txflow_core::model::{EventSubscriptionEntity, ExecutionEntity, ExternalTaskEntity, JobEntity, VariableEntity};
use txflow_core::{DomainError, ExecutionId};

use super::variables;
use crate::command::{Command, CommandContext};
use crate::error::EngineResult;

pub fn start_process_instance(
    ctx: &mut CommandContext,
    activity_id: &str,
    business_key: Option<String>,
) -> EngineResult<ExecutionEntity> {
    let mut instance = ExecutionEntity::new_process_instance(Some(activity_id.to_string()));
    instance.business_key = business_key;
    ctx.insert(instance.clone())?;
    debug!(process_instance_id = %instance.id, activity_id, "process instance started");
    Ok(instance)
}

/// Split an active scope into concurrent children, one per activity.
pub fn fork(ctx: &mut CommandContext, parent_id: ExecutionId, activities: &[&str]) -> EngineResult<Vec<ExecutionEntity>> {
    if activities.len() < 2 {
        return Err(DomainError::validation("a fork needs at least two activities").into());
    }
    let mut parent: ExecutionEntity = ctx.get(parent_id)?;
    if !parent.is_active || parent.is_concurrent {
        return Err(DomainError::invalid_state(format!("execution '{parent_id}' cannot be forked")).into());
    }

    let children: Vec<ExecutionEntity> = activities
        .iter()
        .map(|activity| ExecutionEntity::new_concurrent_child(&parent, *activity))
        .collect();
    parent.is_active = false;
    parent.activity_id = None;
    ctx.update(parent)?;
    for child in &children {
        ctx.insert(child.clone())?;
    }
    Ok(children)
}

fn concurrent_children(ctx: &mut CommandContext, parent_id: ExecutionId) -> EngineResult<Vec<ExecutionEntity>> {
    ctx.find_where::<ExecutionEntity>(|e| e.parent_id == Some(parent_id) && e.is_concurrent)
}

/// Remove an execution's dependent rows.
fn delete_dependents(ctx: &mut CommandContext, execution_id: ExecutionId) -> EngineResult<()> {
    for subscription in ctx.find_where::<EventSubscriptionEntity>(|s| s.execution_id == Some(execution_id))? {
        ctx.delete(&subscription)?;
    }
    for job in ctx.find_where::<JobEntity>(|j| j.execution_id == Some(execution_id))? {
        ctx.delete(&job)?;
    }
    for task in ctx.find_where::<ExternalTaskEntity>(|t| t.execution_id == Some(execution_id))? {
        ctx.delete(&task)?;
    }
    variables::remove_scope_variables(ctx, execution_id)?;
    Ok(())
}

/// Point every dependent row of `from` at `to`.
fn repoint_dependents(ctx: &mut CommandContext, from: ExecutionId, to: ExecutionId) -> EngineResult<()> {
    for mut subscription in ctx.find_where::<EventSubscriptionEntity>(|s| s.execution_id == Some(from))? {
        subscription.execution_id = Some(to);
        ctx.update(subscription)?;
    }
    for mut job in ctx.find_where::<JobEntity>(|j| j.execution_id == Some(from))? {
        job.execution_id = Some(to);
        ctx.update(job)?;
    }
    for mut task in ctx.find_where::<ExternalTaskEntity>(|t| t.execution_id == Some(from))? {
        task.execution_id = Some(to);
        ctx.update(task)?;
    }
    for mut variable in ctx.find_where::<VariableEntity>(|v| v.execution_id == Some(from))? {
        variable.execution_id = Some(to);
        ctx.update(variable)?;
    }
    Ok(())
}

/// End one concurrent child. If a single sibling remains it is merged into
/// the parent. Returns the parent as written.
pub fn end_concurrent_child(ctx: &mut CommandContext, child_id: ExecutionId) -> EngineResult<ExecutionEntity> {
    let child: ExecutionEntity = ctx.get(child_id)?;
    let parent_id = match (child.is_concurrent, child.parent_id) {
        (true, Some(parent)) => parent,
        _ => {
            return Err(DomainError::invalid_state(format!("execution '{child_id}' is not a concurrent child")).into());
        }
    };

    delete_dependents(ctx, child_id)?;
    ctx.delete(&child)?;

    let mut parent: ExecutionEntity = ctx.get(parent_id)?;
    let remaining = concurrent_children(ctx, parent_id)?;
    if let [last] = remaining.as_slice() {
        debug!(parent_id = %parent_id, merged = %last.id, "compacting execution tree");
        repoint_dependents(ctx, last.id, parent_id)?;
        parent.activity_id = last.activity_id.clone();
        parent.is_active = last.is_active;
        ctx.delete(last)?;
    } else if remaining.is_empty() {
        parent.is_active = true;
    }

    ctx.update(parent.clone())?;
    ctx.force_update::<ExecutionEntity>(parent_id)?;
    Ok(parent)
}

/// Delete a process instance with its whole tree and dependent rows.
pub fn delete_process_instance(ctx: &mut CommandContext, process_instance_id: ExecutionId) -> EngineResult<usize> {
    let instance: ExecutionEntity = ctx.get(process_instance_id)?;
    if !instance.is_process_instance() {
        return Err(DomainError::invalid_state(format!(
            "execution '{process_instance_id}' is not a process instance"
        ))
        .into());
    }
    let tree = ctx.find_where::<ExecutionEntity>(|e| e.process_instance_id == process_instance_id)?;
    for execution in &tree {
        delete_dependents(ctx, execution.id)?;
        ctx.delete(execution)?;
    }
    debug!(process_instance_id = %process_instance_id, executions = tree.len(), "process instance deleted");
    Ok(tree.len())
}

/// [`end_concurrent_child`] as a command value.
#[derive(Debug, Clone)]
pub struct EndConcurrentChild {
    child_id: ExecutionId,
}

impl EndConcurrentChild {
    pub fn new(child_id: ExecutionId) -> Self {
        Self { child_id }
    }
}

impl Command<ExecutionEntity> for EndConcurrentChild {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<ExecutionEntity> {
        end_concurrent_child(ctx, self.child_id)
    }

    fn name(&self) -> &str {
        "EndConcurrentChild"
    }
}
