//! Background job executor: one acquisition thread feeding a worker pool.
//!
//! ```text
//!   acquisition thread ──AcquireJobs──► batches ──channel──► worker 1..n
//!          │                                                   │
//!          └─ idle / conflict: wait (doubling up to max)       └─ execute_job per id,
//!                                                                 sequentially per batch
//! ```
//!
//! Shutdown is signalled over a channel; dropping the handle has the same
//! effect as calling [`JobExecutorHandle::shutdown`] without joining.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use txflow_core::JobId;

use super::acquisition::AcquireJobs;
use super::execution::{JobExecutionOutcome, execute_job};
use crate::command::CommandExecutor;
use crate::error::{EngineError, EngineResult};

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub acquisition_cycles: u64,
    pub jobs_acquired: u64,
    /// Jobs selected by an acquisition but locked by somebody else first.
    pub jobs_rejected: u64,
    pub jobs_executed: u64,
    pub jobs_failed: u64,
    /// Executions or acquisitions that ended in an optimistic locking failure.
    pub conflicts: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<ExecutorStats>>;

fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Vec<thread::JoinHandle<()>>,
    stats: SharedStats,
}

impl JobExecutorHandle {
    /// Stop acquiring, let workers finish the batches already handed out,
    /// and wait for every thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        for j in self.join.drain(..) {
            if j.join().is_err() {
                error!("job executor thread panicked");
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }
}

/// Runs due jobs in the background.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    executor: CommandExecutor,
    name: String,
}

impl JobExecutor {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            name: "job-executor".to_string(),
        }
    }

    /// Thread name prefix, also used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Start the acquisition thread and `worker_threads` workers.
    pub fn spawn(self) -> EngineResult<JobExecutorHandle> {
        let config = self.executor.core().config.clone();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (work_tx, work_rx) = mpsc::sync_channel::<Vec<JobId>>(config.worker_threads.max(1) * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let stats: SharedStats = Arc::new(Mutex::new(ExecutorStats::default()));

        let mut join = Vec::with_capacity(config.worker_threads + 1);
        for n in 0..config.worker_threads.max(1) {
            let worker = Worker {
                name: format!("{}-worker-{n}", self.name),
                executor: self.executor.clone(),
                queue: work_rx.clone(),
                stats: stats.clone(),
            };
            join.push(spawn_named(worker.name.clone(), move || worker.run())?);
        }

        let acquisition = Acquisition {
            name: format!("{}-acquisition", self.name),
            executor: self.executor,
            max_jobs: config.max_jobs_per_acquisition,
            wait: config.wait_time_between_acquisitions(),
            max_backoff: config.max_backoff(),
            stats: stats.clone(),
        };
        join.push(spawn_named(acquisition.name.clone(), move || {
            acquisition.run(shutdown_rx, work_tx)
        })?);

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        })
    }
}

fn spawn_named(name: String, f: impl FnOnce() + Send + 'static) -> EngineResult<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| EngineError::Configuration(format!("failed to spawn thread {name}: {e}")))
}

struct Acquisition {
    name: String,
    executor: CommandExecutor,
    max_jobs: usize,
    wait: Duration,
    max_backoff: Duration,
    stats: SharedStats,
}

impl Acquisition {
    fn run(self, shutdown_rx: Receiver<()>, work_tx: SyncSender<Vec<JobId>>) {
        info!(executor = %self.name, max_jobs = self.max_jobs, "job acquisition started");
        let started = Instant::now();
        let mut backoff = self.wait;

        loop {
            let pause = match self.executor.execute(&AcquireJobs::new(self.max_jobs)) {
                Ok(acquired) => {
                    backoff = self.wait;
                    let rejected = acquired.rejected().len();
                    {
                        let mut s = lock_stats(&self.stats);
                        s.acquisition_cycles += 1;
                        s.jobs_acquired += acquired.len() as u64;
                        s.jobs_rejected += rejected as u64;
                        s.uptime_secs = started.elapsed().as_secs();
                    }
                    let count = acquired.len();
                    if count > 0 {
                        debug!(executor = %self.name, acquired = count, rejected, "jobs acquired");
                    }
                    for batch in acquired.batches() {
                        if work_tx.send(batch).is_err() {
                            warn!(executor = %self.name, "all workers gone, stopping acquisition");
                            return;
                        }
                    }
                    // A full page suggests more due jobs: go again right away.
                    if count >= self.max_jobs && self.max_jobs > 0 {
                        Duration::ZERO
                    } else {
                        self.wait
                    }
                }
                Err(e) => {
                    if e.is_optimistic_locking() {
                        lock_stats(&self.stats).conflicts += 1;
                        debug!(executor = %self.name, error = %e, backoff_ms = backoff.as_millis() as u64, "acquisition conflict");
                    } else {
                        error!(executor = %self.name, error = %e, "job acquisition failed");
                    }
                    let pause = backoff;
                    backoff = (backoff * 2).min(self.max_backoff);
                    pause
                }
            };

            match shutdown_rx.recv_timeout(pause) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        info!(executor = %self.name, "job acquisition stopped");
    }
}

struct Worker {
    name: String,
    executor: CommandExecutor,
    queue: Arc<Mutex<Receiver<Vec<JobId>>>>,
    stats: SharedStats,
}

impl Worker {
    fn next_batch(&self) -> Option<Vec<JobId>> {
        let queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.recv().ok()
    }

    fn run(self) {
        debug!(worker = %self.name, "job worker started");
        while let Some(batch) = self.next_batch() {
            for job_id in batch {
                self.execute(job_id);
            }
        }
        debug!(worker = %self.name, "job worker stopped");
    }

    fn execute(&self, job_id: JobId) {
        lock_stats(&self.stats).current_running += 1;
        let result = execute_job(&self.executor, job_id);

        let mut s = lock_stats(&self.stats);
        s.current_running = s.current_running.saturating_sub(1);
        match result {
            Ok(JobExecutionOutcome::NotFound) => {
                debug!(worker = %self.name, job_id = %job_id, "job vanished before execution");
            }
            Ok(_) => s.jobs_executed += 1,
            Err(e) => {
                s.jobs_failed += 1;
                if e.is_optimistic_locking() {
                    s.conflicts += 1;
                }
                debug!(worker = %self.name, job_id = %job_id, error = %e, "job execution failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use txflow_core::model::{JobEntity, JobKind};

    use crate::command::CommandContext;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::jobs::JobOutcome;

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_worker_threads(2)
            .with_wait_time_between_acquisitions(Duration::from_millis(10))
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn executes_all_due_jobs_in_the_background() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let engine = Engine::builder()
            .with_config(fast_config())
            .register_job_handler("count", move |_: &mut CommandContext, _: &JobEntity| -> EngineResult<JobOutcome> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::Completed)
            })
            .build()
            .unwrap();
        for _ in 0..5 {
            engine
                .management()
                .create_job(JobEntity::new(JobKind::Message, "count", 3, Utc::now()))
                .unwrap();
        }

        let handle = engine.start_job_executor().unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.stats().jobs_executed == 5));
        handle.shutdown();

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(engine.management().count_jobs(&Default::default()).unwrap(), 0);
    }

    #[test]
    fn failing_job_is_counted_and_keeps_its_row() {
        let engine = Engine::builder()
            .with_config(fast_config())
            .register_job_handler("broken", |_: &mut CommandContext, _: &JobEntity| -> EngineResult<JobOutcome> {
                Err(EngineError::handler("boom"))
            })
            .build()
            .unwrap();
        let id = engine
            .management()
            .create_job(JobEntity::new(JobKind::Message, "broken", 1, Utc::now()))
            .unwrap();

        let handle = engine.start_job_executor().unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.stats().jobs_failed == 1));
        handle.shutdown();

        let job = engine.management().job(id).unwrap().unwrap();
        assert_eq!(job.retries, 0);
        assert_eq!(job.exception_message.as_deref(), Some("handler failed: boom"));
    }

    #[test]
    fn shutdown_stops_an_idle_executor() {
        let engine = Engine::builder().with_config(fast_config()).build().unwrap();
        let handle = engine.start_job_executor().unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.stats().acquisition_cycles > 0));
        handle.shutdown();
    }
}
