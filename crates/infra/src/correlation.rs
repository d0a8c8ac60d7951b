//! Message correlation against event subscriptions.
//!
//! ```text
//! Correlate(request)
//!   ↓
//! 1. select subscriptions: message name + scope (execution / process instance / tenant)
//!   ↓                       none ⇒ domain error, several ⇒ error unless `all`
//! 2. exclusive? ── lock each subscription row (SELECT … FOR UPDATE), held until commit
//!   ↓              a competing exclusive correlator waits here and then finds nothing
//! 3. EventTrigger for the message (or store the payload as variables)
//!   ↓
//! 4. delete the subscription ── revision-checked; a lost race surfaces at flush
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use txflow_core::model::{EventSubscriptionEntity, EventType, VariableValue};
use txflow_core::{DomainError, ExecutionId, TenantId};

use crate::command::{Command, CommandContext};
use crate::error::EngineResult;
use crate::runtime::variables;

/// Reaction to a correlated message. Runs in the correlating transaction,
/// before the subscription is deleted.
pub trait EventTrigger: Send + Sync {
    fn trigger(
        &self,
        ctx: &mut CommandContext,
        subscription: &EventSubscriptionEntity,
        payload: Option<&JsonValue>,
    ) -> EngineResult<()>;
}

impl<F> EventTrigger for F
where
    F: Fn(&mut CommandContext, &EventSubscriptionEntity, Option<&JsonValue>) -> EngineResult<()> + Send + Sync,
{
    fn trigger(
        &self,
        ctx: &mut CommandContext,
        subscription: &EventSubscriptionEntity,
        payload: Option<&JsonValue>,
    ) -> EngineResult<()> {
        self(ctx, subscription, payload)
    }
}

/// Triggers by message name; `*` catches every message.
#[derive(Clone, Default)]
pub struct EventTriggerRegistry {
    triggers: HashMap<String, Arc<dyn EventTrigger>>,
}

impl fmt::Debug for EventTriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.triggers.keys().collect();
        names.sort();
        f.debug_struct("EventTriggerRegistry").field("names", &names).finish()
    }
}

impl EventTriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_name: impl Into<String>, trigger: impl EventTrigger + 'static) {
        self.triggers.insert(event_name.into(), Arc::new(trigger));
    }

    pub fn get(&self, event_name: &str) -> Option<Arc<dyn EventTrigger>> {
        self.triggers
            .get(event_name)
            .or_else(|| self.triggers.get("*"))
            .cloned()
    }
}

/// What to correlate and where.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRequest {
    pub message_name: String,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ExecutionId>,
    pub tenant_id: Option<TenantId>,
    pub exclusive: bool,
    pub all: bool,
    pub payload: Option<JsonValue>,
}

impl CorrelationRequest {
    pub fn message(name: impl Into<String>) -> Self {
        Self {
            message_name: name.into(),
            execution_id: None,
            process_instance_id: None,
            tenant_id: None,
            exclusive: false,
            all: false,
            payload: None,
        }
    }

    pub fn execution(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn process_instance(mut self, id: ExecutionId) -> Self {
        self.process_instance_id = Some(id);
        self
    }

    pub fn tenant(mut self, id: TenantId) -> Self {
        self.tenant_id = Some(id);
        self
    }

    /// Hold a row lock on each matched subscription until commit.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Trigger every match instead of failing on ambiguity.
    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    pub fn payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    fn matches(&self, subscription: &EventSubscriptionEntity) -> bool {
        subscription.event_type == EventType::Message
            && subscription.event_name == self.message_name
            && self.execution_id.is_none_or(|id| subscription.execution_id == Some(id))
            && self
                .process_instance_id
                .is_none_or(|id| subscription.process_instance_id == Some(id))
            && self.tenant_id.is_none_or(|id| subscription.tenant_id == Some(id))
    }

    fn no_match(&self) -> DomainError {
        match self.execution_id {
            Some(execution) => DomainError::no_matching_subscription(execution, &self.message_name),
            None => DomainError::mismatching_correlation(&self.message_name, "no subscription matches"),
        }
    }
}

/// Deliver a message. Returns the number of triggered subscriptions.
#[derive(Debug, Clone)]
pub struct Correlate {
    request: CorrelationRequest,
}

impl Correlate {
    pub fn new(request: CorrelationRequest) -> Self {
        Self { request }
    }

    fn trigger(&self, ctx: &mut CommandContext, subscription: &EventSubscriptionEntity) -> EngineResult<()> {
        let payload = self.request.payload.as_ref();
        match ctx.core().event_triggers.get(&subscription.event_name) {
            Some(trigger) => trigger.trigger(ctx, subscription, payload),
            None => store_payload(ctx, subscription, payload),
        }
    }
}

/// Without a registered trigger the payload's fields become variables of
/// the waiting execution.
fn store_payload(
    ctx: &mut CommandContext,
    subscription: &EventSubscriptionEntity,
    payload: Option<&JsonValue>,
) -> EngineResult<()> {
    let (Some(JsonValue::Object(fields)), Some(execution)) = (payload, subscription.execution_id) else {
        return Ok(());
    };
    for (name, value) in fields {
        variables::set_variable(ctx, Some(execution), name, VariableValue::from(value.clone()))?;
    }
    Ok(())
}

impl Command<usize> for Correlate {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<usize> {
        let request = &self.request;
        let candidates = ctx.find_where::<EventSubscriptionEntity>(|s| request.matches(s))?;
        if candidates.is_empty() {
            return Err(request.no_match().into());
        }
        if candidates.len() > 1 && !request.all {
            return Err(DomainError::mismatching_correlation(
                &request.message_name,
                format!("{} subscriptions match; correlate to all of them explicitly", candidates.len()),
            )
            .into());
        }

        let mut triggered = 0;
        for candidate in candidates {
            let subscription = if request.exclusive {
                // Blocks while another exclusive correlator holds the row.
                match ctx.find_for_update::<EventSubscriptionEntity>(candidate.id)? {
                    Some(locked) => locked,
                    None if request.all => continue,
                    None => {
                        let execution = candidate.execution_id.map(|e| e.to_string()).unwrap_or_default();
                        return Err(DomainError::no_matching_subscription(execution, &request.message_name).into());
                    }
                }
            } else {
                candidate
            };

            debug!(subscription_id = %subscription.id, message = %subscription.event_name, exclusive = request.exclusive, "triggering subscription");
            self.trigger(ctx, &subscription)?;
            ctx.delete(&subscription)?;
            triggered += 1;
        }

        info!(message = %request.message_name, triggered, "message correlated");
        Ok(triggered)
    }

    fn name(&self) -> &str {
        "Correlate"
    }
}

/// "Execution X received message M": correlation targeted at one execution.
#[derive(Debug, Clone)]
pub struct MessageEventReceived {
    inner: Correlate,
}

impl MessageEventReceived {
    pub fn new(message_name: impl Into<String>, execution_id: ExecutionId) -> Self {
        Self {
            inner: Correlate::new(CorrelationRequest::message(message_name).execution(execution_id)),
        }
    }

    pub fn exclusive(self) -> Self {
        Self {
            inner: Correlate::new(self.inner.request.exclusive()),
        }
    }

    pub fn with_payload(self, payload: JsonValue) -> Self {
        Self {
            inner: Correlate::new(self.inner.request.payload(payload)),
        }
    }
}

impl Command<()> for MessageEventReceived {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        self.inner.execute(ctx).map(|_| ())
    }

    fn name(&self) -> &str {
        "MessageEventReceived"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;
    use txflow_core::model::ExecutionEntity;

    use crate::engine::Engine;
    use crate::error::EngineError;

    fn waiting_instance(engine: &Engine, message: &str) -> ExecutionEntity {
        let pi = ExecutionEntity::new_process_instance(Some("receive".into()));
        let subscription = EventSubscriptionEntity::message(message, Utc::now()).on_execution(pi.id, pi.id);
        let inserted = pi.clone();
        engine
            .command_executor()
            .run(|ctx| {
                ctx.insert(inserted.clone())?;
                ctx.insert(subscription.clone())
            })
            .unwrap();
        pi
    }

    fn subscription_count(engine: &Engine) -> usize {
        engine
            .command_executor()
            .run(|ctx| ctx.find_where::<EventSubscriptionEntity>(|_| true))
            .unwrap()
            .len()
    }

    #[test]
    fn correlation_triggers_and_consumes_the_subscription() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let engine = Engine::builder()
            .register_event_trigger(
                "Message",
                move |_: &mut CommandContext, _: &EventSubscriptionEntity, _: Option<&JsonValue>| -> EngineResult<()> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .build()
            .unwrap();
        let pi = waiting_instance(&engine, "Message");

        let triggered = engine
            .correlate(CorrelationRequest::message("Message").process_instance(pi.id))
            .unwrap();
        assert_eq!(triggered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(subscription_count(&engine), 0);
    }

    #[test]
    fn targeted_correlation_without_subscription_names_the_execution() {
        let engine = Engine::in_memory();
        let pi = waiting_instance(&engine, "Other");
        let err = engine
            .command_executor()
            .execute(&MessageEventReceived::new("Message", pi.id))
            .unwrap_err();
        assert!(err.to_string().contains("does not have a subscription to a message event with name 'Message'"));
    }

    #[test]
    fn ambiguous_correlation_needs_all() {
        let engine = Engine::in_memory();
        waiting_instance(&engine, "Message");
        waiting_instance(&engine, "Message");

        let err = engine.correlate(CorrelationRequest::message("Message")).unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::MismatchingCorrelation { .. })));
        assert_eq!(subscription_count(&engine), 2);

        let triggered = engine
            .correlate(CorrelationRequest::message("Message").all().exclusive())
            .unwrap();
        assert_eq!(triggered, 2);
        assert_eq!(subscription_count(&engine), 0);
    }

    #[test]
    fn payload_becomes_variables_without_trigger() {
        let engine = Engine::in_memory();
        let pi = waiting_instance(&engine, "Message");
        engine
            .correlate(
                CorrelationRequest::message("Message")
                    .execution(pi.id)
                    .payload(json!({ "amount": 42, "approved": true })),
            )
            .unwrap();

        let runtime = engine.runtime();
        assert_eq!(runtime.variable(Some(pi.id), "amount").unwrap(), Some(VariableValue::Long(42)));
        assert_eq!(runtime.variable(Some(pi.id), "approved").unwrap(), Some(VariableValue::Boolean(true)));
    }

    #[test]
    fn failing_trigger_keeps_the_subscription() {
        let engine = Engine::builder()
            .register_event_trigger(
                "*",
                |_: &mut CommandContext, _: &EventSubscriptionEntity, _: Option<&JsonValue>| -> EngineResult<()> {
                    Err(EngineError::handler("rejected"))
                },
            )
            .build()
            .unwrap();
        waiting_instance(&engine, "Message");
        assert!(engine.correlate(CorrelationRequest::message("Message")).is_err());
        assert_eq!(subscription_count(&engine), 1);
    }
}
