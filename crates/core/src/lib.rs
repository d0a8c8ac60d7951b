//! `txflow-core`: domain foundation of the transactional execution core.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! typed identifiers, the domain error model, the versioned-entity contract and
//! the persisted entity model (jobs, job definitions, event subscriptions,
//! executions, variables, external tasks).

pub mod entity;
pub mod error;
pub mod id;
pub mod model;
pub mod time;

pub use entity::{EntityKey, EntityType, ExpectedRevision, VersionedEntity};
pub use error::{DomainError, DomainResult};
pub use id::{
    ByteArrayId, EventSubscriptionId, ExecutionId, ExternalTaskId, JobDefinitionId, JobId, TenantId,
    VariableId,
};
pub use time::{Clock, ControlledClock, MAX_INTERVAL_MS, SharedClock, SystemClock, deadline, interval_from_millis};
