//! Asynchronous jobs: acquisition, execution, failure handling, management.
//!
//! ```text
//!   AcquireJobs (tx 1)          ExecuteJob (tx 2)                HandleFailedJob (tx 3, only on error)
//!   ─────────────────           ─────────────────                ─────────────────────────────────────
//!   select due jobs             load job, run JobHandler         reload job; skip if re-acquired
//!   lock owner + expiration     Completed → delete row           RetryPolicy: retries, due date,
//!   conflicts → rejected        Rescheduled → keep row           exception, unlock
//! ```
//!
//! A job's retries are only consumed by failures that are not optimistic
//! locking failures: losing a race says nothing about the job itself.

pub mod acquisition;
pub mod execution;
pub mod executor;
pub mod handler;
pub mod management;
pub mod retry;

pub use acquisition::{AcquireJobs, AcquiredJobs};
pub use execution::{
    ExecuteJob, FailureOutcome, HandleFailedJob, JobExecutionOutcome, JobFailureCollector, execute_job, execute_job_with,
};
pub use executor::{ExecutorStats, JobExecutor, JobExecutorHandle};
pub use handler::{EVER_LIVING_JOB_TYPE, EverLivingJobHandler, JobHandler, JobHandlerRegistry, JobOutcome};
pub use management::{
    DeleteJob, JobQuery, ManagementService, SetJobDefinitionPriority, SetJobDueDate, SetJobRetries, SuspendJob,
    SuspendJobDefinition,
};
pub use retry::{
    CyclicRetryPolicy, DefaultRetryPolicy, DefaultRetryPolicyResolver, JobFailure, RetryCycle, RetryPolicy,
    RetryPolicyResolver, parse_duration,
};
