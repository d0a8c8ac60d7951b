//! Persisted engine entities.

pub mod event_subscription;
pub mod execution;
pub mod external_task;
pub mod job;
pub mod job_definition;
pub mod variable;

pub use event_subscription::{EventSubscriptionEntity, EventType};
pub use execution::ExecutionEntity;
pub use external_task::ExternalTaskEntity;
pub use job::{JobEntity, JobKind, JobState};
pub use job_definition::JobDefinitionEntity;
pub use variable::{ByteArrayEntity, StoredValue, VariableEntity, VariableValue};
