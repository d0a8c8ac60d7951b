//! Process runtime: execution tree, variables, subscriptions, correlation.

pub mod execution_tree;
pub mod variables;

pub use execution_tree::{
    EndConcurrentChild, delete_process_instance, end_concurrent_child, fork, start_process_instance,
};
pub use variables::VariableInstance;

use txflow_core::model::{EventSubscriptionEntity, ExecutionEntity, VariableValue};
use txflow_core::{EventSubscriptionId, ExecutionId};

use crate::command::CommandExecutor;
use crate::correlation::{Correlate, CorrelationRequest, MessageEventReceived};
use crate::error::EngineResult;

/// Runtime entry points; each call is one transaction.
#[derive(Debug, Clone)]
pub struct RuntimeService {
    executor: CommandExecutor,
}

impl RuntimeService {
    pub(crate) fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    pub fn start_process_instance(&self, activity_id: &str, business_key: Option<String>) -> EngineResult<ExecutionEntity> {
        self.executor
            .run(|ctx| start_process_instance(ctx, activity_id, business_key.clone()))
    }

    pub fn fork(&self, parent_id: ExecutionId, activities: &[&str]) -> EngineResult<Vec<ExecutionEntity>> {
        self.executor.run(|ctx| fork(ctx, parent_id, activities))
    }

    pub fn end_concurrent_child(&self, child_id: ExecutionId) -> EngineResult<ExecutionEntity> {
        self.executor.execute(&EndConcurrentChild::new(child_id))
    }

    pub fn delete_process_instance(&self, process_instance_id: ExecutionId) -> EngineResult<usize> {
        self.executor
            .run(|ctx| delete_process_instance(ctx, process_instance_id))
    }

    pub fn execution(&self, id: ExecutionId) -> EngineResult<Option<ExecutionEntity>> {
        self.executor.run(|ctx| ctx.find(id))
    }

    /// Executions of one process instance, the instance included.
    pub fn executions(&self, process_instance_id: ExecutionId) -> EngineResult<Vec<ExecutionEntity>> {
        self.executor.run(|ctx| {
            ctx.find_where::<ExecutionEntity>(|e| e.process_instance_id == process_instance_id)
        })
    }

    pub fn set_variable(&self, scope: Option<ExecutionId>, name: &str, value: VariableValue) -> EngineResult<()> {
        self.executor
            .run(|ctx| variables::set_variable(ctx, scope, name, value.clone()))
    }

    pub fn variable(&self, scope: Option<ExecutionId>, name: &str) -> EngineResult<Option<VariableValue>> {
        self.executor.run(|ctx| variables::get_variable(ctx, scope, name))
    }

    /// All variables of a scope with their values resolved.
    pub fn variables(&self, scope: Option<ExecutionId>) -> EngineResult<Vec<(String, VariableValue)>> {
        self.executor.run(|ctx| {
            let mut resolved = Vec::new();
            for instance in variables::variables_of(ctx, scope)? {
                if let Some(value) = instance.value(ctx)? {
                    resolved.push((instance.name().to_string(), value));
                }
            }
            Ok(resolved)
        })
    }

    pub fn remove_variable(&self, scope: Option<ExecutionId>, name: &str) -> EngineResult<bool> {
        self.executor.run(|ctx| variables::remove_variable(ctx, scope, name))
    }

    /// Make `execution_id` wait for message `name`.
    pub fn subscribe_to_message(&self, execution_id: ExecutionId, name: &str) -> EngineResult<EventSubscriptionId> {
        self.executor.run(|ctx| {
            let execution: ExecutionEntity = ctx.get(execution_id)?;
            let mut subscription = EventSubscriptionEntity::message(name, ctx.now())
                .on_execution(execution.id, execution.process_instance_id);
            subscription.activity_id = execution.activity_id.clone();
            subscription.tenant_id = execution.tenant_id;
            let id = subscription.id;
            ctx.insert(subscription)?;
            Ok(id)
        })
    }

    pub fn event_subscriptions(&self, execution_id: ExecutionId) -> EngineResult<Vec<EventSubscriptionEntity>> {
        self.executor.run(|ctx| {
            ctx.find_where::<EventSubscriptionEntity>(|s| s.execution_id == Some(execution_id))
        })
    }

    pub fn correlate(&self, request: CorrelationRequest) -> EngineResult<usize> {
        self.executor.execute(&Correlate::new(request))
    }

    /// Deliver message `name` to one execution. `exclusive` serializes
    /// concurrent deliveries to the same subscription.
    pub fn message_event_received(&self, name: &str, execution_id: ExecutionId, exclusive: bool) -> EngineResult<()> {
        let command = MessageEventReceived::new(name, execution_id);
        self.executor
            .execute(&if exclusive { command.exclusive() } else { command })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn subscription_is_consumed_by_message() {
        let engine = Engine::in_memory();
        let runtime = engine.runtime();
        let pi = runtime.start_process_instance("wait", Some("order-1".into())).unwrap();
        runtime.subscribe_to_message(pi.id, "Paid").unwrap();
        assert_eq!(runtime.event_subscriptions(pi.id).unwrap().len(), 1);

        runtime.message_event_received("Paid", pi.id, true).unwrap();
        assert!(runtime.event_subscriptions(pi.id).unwrap().is_empty());
        assert!(runtime.message_event_received("Paid", pi.id, false).is_err());
    }

    #[test]
    fn variables_round_trip_through_the_service() {
        let engine = Engine::in_memory();
        let runtime = engine.runtime();
        let pi = runtime.start_process_instance("task", None).unwrap();
        runtime
            .set_variable(Some(pi.id), "doc", VariableValue::Bytes(b"pdf".to_vec()))
            .unwrap();
        runtime
            .set_variable(Some(pi.id), "count", VariableValue::Long(2))
            .unwrap();

        let mut all = runtime.variables(Some(pi.id)).unwrap();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            all,
            vec![
                ("count".to_string(), VariableValue::Long(2)),
                ("doc".to_string(), VariableValue::Bytes(b"pdf".to_vec())),
            ]
        );
        assert!(runtime.remove_variable(Some(pi.id), "doc").unwrap());
        assert_eq!(runtime.variable(Some(pi.id), "doc").unwrap(), None);
    }

    #[test]
    fn compaction_through_the_service() {
        let engine = Engine::in_memory();
        let runtime = engine.runtime();
        let pi = runtime.start_process_instance("start", None).unwrap();
        let children = runtime.fork(pi.id, &["a", "b"]).unwrap();
        runtime.end_concurrent_child(children[1].id).unwrap();

        let executions = runtime.executions(pi.id).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].activity_id.as_deref(), Some("a"));
        assert_eq!(runtime.delete_process_instance(pi.id).unwrap(), 1);
    }
}
