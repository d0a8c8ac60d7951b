//! Engine façade.
//!
//! ```text
//! EngineBuilder
//!   ├─ store          (default: InMemoryStore with the configured lock wait timeout)
//!   ├─ config         (EngineConfig)
//!   ├─ clock          (default: SystemClock)
//!   ├─ job handlers   (job type → JobHandler; "ever-living" pre-registered)
//!   ├─ event triggers (message name → EventTrigger)
//!   └─ retry policies (RetryPolicyResolver)
//!        ↓ build()
//! Engine ── command_executor() / management() / runtime() / external_tasks()
//!        ── acquire_jobs() / execute_job() / start_job_executor()
//! ```

use std::sync::Arc;

use txflow_core::{JobId, SharedClock, SystemClock};

use crate::command::CommandExecutor;
use crate::config::EngineConfig;
use crate::correlation::{Correlate, CorrelationRequest, EventTrigger, EventTriggerRegistry};
use crate::error::{EngineError, EngineResult};
use crate::external_task::ExternalTaskService;
use crate::jobs::{
    AcquireJobs, AcquiredJobs, DefaultRetryPolicyResolver, EVER_LIVING_JOB_TYPE, EverLivingJobHandler, JobExecutionOutcome,
    JobExecutor, JobExecutorHandle, JobHandler, JobHandlerRegistry, ManagementService, RetryPolicyResolver, execute_job,
};
use crate::runtime::RuntimeService;
use crate::store::{EntityStore, InMemoryStore};

/// Shared, immutable wiring of one engine. Every command context holds a
/// reference to it.
pub struct EngineCore {
    pub(crate) store: Arc<dyn EntityStore>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: SharedClock,
    pub(crate) job_handlers: JobHandlerRegistry,
    pub(crate) event_triggers: EventTriggerRegistry,
    pub(crate) retry_policies: Arc<dyn RetryPolicyResolver>,
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("job_handlers", &self.job_handlers)
            .field("event_triggers", &self.event_triggers)
            .finish_non_exhaustive()
    }
}

pub struct EngineBuilder {
    store: Option<Arc<dyn EntityStore>>,
    config: EngineConfig,
    clock: SharedClock,
    job_handlers: JobHandlerRegistry,
    event_triggers: EventTriggerRegistry,
    retry_policies: Arc<dyn RetryPolicyResolver>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        let mut job_handlers = JobHandlerRegistry::new();
        job_handlers.register(EVER_LIVING_JOB_TYPE, EverLivingJobHandler::new());
        Self {
            store: None,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            job_handlers,
            event_triggers: EventTriggerRegistry::new(),
            retry_policies: Arc::new(DefaultRetryPolicyResolver),
        }
    }
}

impl EngineBuilder {
    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn register_job_handler(mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.job_handlers.register(job_type, handler);
        self
    }

    pub fn register_event_trigger(mut self, event_name: impl Into<String>, trigger: impl EventTrigger + 'static) -> Self {
        self.event_triggers.register(event_name, trigger);
        self
    }

    pub fn with_retry_policy_resolver(mut self, resolver: Arc<dyn RetryPolicyResolver>) -> Self {
        self.retry_policies = resolver;
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        self.config
            .validate()
            .map_err(|e| EngineError::Configuration(format!("{e:#}")))?;
        Ok(self.assemble())
    }

    fn assemble(self) -> Engine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::with_lock_wait_timeout(self.config.lock_wait_timeout())));
        Engine {
            core: Arc::new(EngineCore {
                store,
                config: self.config,
                clock: self.clock,
                job_handlers: self.job_handlers,
                event_triggers: self.event_triggers,
                retry_policies: self.retry_policies,
            }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Engine with default configuration on a fresh in-memory store.
    pub fn in_memory() -> Self {
        EngineBuilder::default().assemble()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.core.clock
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.core.store
    }

    pub fn command_executor(&self) -> CommandExecutor {
        CommandExecutor::new(self.core.clone())
    }

    pub fn management(&self) -> ManagementService {
        ManagementService::new(self.command_executor())
    }

    pub fn runtime(&self) -> RuntimeService {
        RuntimeService::new(self.command_executor())
    }

    pub fn external_tasks(&self) -> ExternalTaskService {
        ExternalTaskService::new(self.command_executor())
    }

    /// Lock up to `max_jobs` due jobs for this engine's lock owner.
    pub fn acquire_jobs(&self, max_jobs: usize) -> EngineResult<AcquiredJobs> {
        self.command_executor().execute(&AcquireJobs::new(max_jobs))
    }

    /// Run one job; failures are recorded on the job before the error is returned.
    pub fn execute_job(&self, job_id: JobId) -> EngineResult<JobExecutionOutcome> {
        execute_job(&self.command_executor(), job_id)
    }

    /// Deliver a message; returns the number of triggered subscriptions.
    pub fn correlate(&self, request: CorrelationRequest) -> EngineResult<usize> {
        self.command_executor().execute(&Correlate::new(request))
    }

    /// Start background acquisition and execution threads.
    pub fn start_job_executor(&self) -> EngineResult<JobExecutorHandle> {
        JobExecutor::new(self.command_executor()).spawn()
    }
}
