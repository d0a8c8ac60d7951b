//! `txflow-infra`: transactional execution core.
//!
//! Commands run against a per-transaction entity cache that is flushed as
//! revision-checked statements; jobs, correlation, external tasks and the
//! execution tree are built on top of that.
//!
//! ```text
//! Engine ──► CommandExecutor ──► CommandContext ──► EntityCache ──flush──► EntityStore
//!   │                                 ▲
//!   ├─ ManagementService / RuntimeService / ExternalTaskService (one command per call)
//!   └─ JobExecutor: AcquireJobs ─► ExecuteJob ─► HandleFailedJob
//! ```

pub mod command;
pub mod config;
pub mod correlation;
pub mod db;
pub mod engine;
pub mod error;
pub mod external_task;
pub mod jobs;
pub mod runtime;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use command::{Command, CommandContext, CommandExecutor, Propagation, TransactionState};
pub use config::EngineConfig;
pub use correlation::{Correlate, CorrelationRequest, EventTrigger, MessageEventReceived};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult, OptimisticLockingError};
pub use external_task::{ExternalTaskService, LockOutcome};
pub use jobs::{JobExecutionOutcome, JobHandler, JobOutcome, JobQuery, ManagementService};
pub use runtime::RuntimeService;
pub use store::{EntityStore, InMemoryStore};
