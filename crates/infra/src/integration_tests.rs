//! End-to-end tests across services.
//!
//! Tests: management → acquisition → execution → failure handling, and
//! runtime → correlation → variables, all on one in-memory store.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;
    use serde_json::json;

    use txflow_core::model::{JobDefinitionEntity, JobEntity, JobKind, VariableValue};
    use txflow_core::{Clock, ControlledClock};

    use crate::command::CommandContext;
    use crate::config::EngineConfig;
    use crate::correlation::CorrelationRequest;
    use crate::engine::Engine;
    use crate::error::{EngineError, EngineResult};
    use crate::jobs::{EVER_LIVING_JOB_TYPE, JobExecutionOutcome, JobOutcome, JobQuery};

    fn clocked(builder: crate::engine::EngineBuilder) -> (Engine, Arc<ControlledClock>) {
        let clock = Arc::new(ControlledClock::pinned_at(chrono::Utc::now()));
        let engine = builder.with_clock(clock.clone()).build().unwrap();
        (engine, clock)
    }

    #[test]
    fn job_fails_twice_then_succeeds_on_its_retry_cycle() {
        txflow_observability::init_for_tests();
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let (engine, clock) = clocked(Engine::builder().register_job_handler(
            "payment",
            move |_: &mut CommandContext, _: &JobEntity| -> EngineResult<JobOutcome> {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::handler_with_details("gateway unavailable", "HTTP 503"))
                } else {
                    Ok(JobOutcome::Completed)
                }
            },
        ));
        let management = engine.management();
        let def = management
            .create_job_definition(JobDefinitionEntity::new("payment", "charge").with_retry_time_cycle("R3/PT10M"))
            .unwrap();
        let job_id = management
            .create_job(JobEntity::new(JobKind::Message, "payment", 3, clock.now()).with_definition(def))
            .unwrap();

        for expected_retries in [2, 1] {
            let acquired = engine.acquire_jobs(3).unwrap();
            assert_eq!(acquired.job_ids(), vec![job_id]);
            assert!(engine.execute_job(job_id).is_err());

            let job = management.job(job_id).unwrap().unwrap();
            assert_eq!(job.retries, expected_retries);
            assert_eq!(job.exception_stacktrace.as_deref(), Some("HTTP 503"));
            assert_eq!(job.due_date, Some(clock.now() + Duration::minutes(10)));
            assert!(engine.acquire_jobs(3).unwrap().is_empty());
            clock.advance(Duration::minutes(10));
        }

        assert_eq!(engine.acquire_jobs(3).unwrap().len(), 1);
        assert_eq!(engine.execute_job(job_id).unwrap(), JobExecutionOutcome::Completed);
        assert_eq!(management.count_jobs(&JobQuery::new()).unwrap(), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_job_stays_until_retries_are_set() {
        let (engine, clock) = clocked(Engine::builder().register_job_handler(
            "fragile",
            |_: &mut CommandContext, _: &JobEntity| -> EngineResult<JobOutcome> { Err(EngineError::handler("broken")) },
        ));
        let management = engine.management();
        let job_id = management
            .create_job(JobEntity::new(JobKind::Message, "fragile", 1, clock.now()))
            .unwrap();

        assert!(engine.execute_job(job_id).is_err());
        assert_eq!(management.count_jobs(&JobQuery::new().no_retries_left()).unwrap(), 1);
        assert!(engine.acquire_jobs(1).unwrap().is_empty());

        management.set_job_retries(job_id, 1).unwrap();
        assert_eq!(engine.acquire_jobs(1).unwrap().job_ids(), vec![job_id]);
    }

    #[test]
    fn ever_living_job_keeps_coming_back() {
        let config = EngineConfig::default().with_ever_living_job_interval(std::time::Duration::from_secs(60));
        let (engine, clock) = clocked(Engine::builder().with_config(config));
        let management = engine.management();
        let job_id = management
            .create_job(JobEntity::new(JobKind::EverLiving, EVER_LIVING_JOB_TYPE, 3, clock.now()))
            .unwrap();

        for _ in 0..3 {
            assert_eq!(engine.acquire_jobs(1).unwrap().job_ids(), vec![job_id]);
            assert_eq!(engine.execute_job(job_id).unwrap(), JobExecutionOutcome::Rescheduled);
            let job = management.job(job_id).unwrap().unwrap();
            assert_eq!(job.due_date, Some(clock.now() + Duration::seconds(60)));
            assert_eq!(job.retries, 3);
            assert!(job.lock_owner.is_none());
            clock.advance(Duration::seconds(60));
        }
    }

    #[test]
    fn exclusive_jobs_of_one_instance_arrive_as_one_batch() {
        let engine = Engine::in_memory();
        let runtime = engine.runtime();
        let management = engine.management();
        let pi = runtime.start_process_instance("fork", None).unwrap();
        let other = runtime.start_process_instance("fork", None).unwrap();
        let now = engine.clock().now();
        for instance in [pi.id, pi.id, other.id] {
            management
                .create_job(JobEntity::new(JobKind::Message, "async", 3, now).with_execution(instance, instance))
                .unwrap();
        }

        let acquired = engine.acquire_jobs(5).unwrap();
        let mut sizes: Vec<usize> = acquired.batches().iter().map(Vec::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[test]
    fn message_payload_reaches_the_waiting_execution() {
        let engine = Engine::in_memory();
        let runtime = engine.runtime();
        let pi = runtime.start_process_instance("await-payment", Some("order-42".into())).unwrap();
        runtime.subscribe_to_message(pi.id, "PaymentReceived").unwrap();

        let triggered = engine
            .correlate(
                CorrelationRequest::message("PaymentReceived")
                    .process_instance(pi.id)
                    .exclusive()
                    .payload(json!({ "amount": 1250, "currency": "EUR" })),
            )
            .unwrap();
        assert_eq!(triggered, 1);
        assert_eq!(runtime.variable(Some(pi.id), "amount").unwrap(), Some(VariableValue::Long(1250)));
        assert_eq!(
            runtime.variable(Some(pi.id), "currency").unwrap(),
            Some(VariableValue::String("EUR".into()))
        );
        assert!(runtime.event_subscriptions(pi.id).unwrap().is_empty());
    }

    #[test]
    fn deleting_an_instance_takes_its_jobs_and_tasks() {
        let engine = Engine::in_memory();
        let runtime = engine.runtime();
        let pi = runtime.start_process_instance("start", None).unwrap();
        let now = engine.clock().now();
        engine
            .management()
            .create_job(JobEntity::new(JobKind::Timer, "timer", 3, now).with_execution(pi.id, pi.id))
            .unwrap();
        let task = engine
            .external_tasks()
            .create(txflow_core::model::ExternalTaskEntity::new("billing", now).with_execution(pi.id, pi.id))
            .unwrap();

        runtime.delete_process_instance(pi.id).unwrap();
        assert_eq!(engine.management().count_jobs(&JobQuery::new()).unwrap(), 0);
        assert!(engine.external_tasks().task(task).unwrap().is_none());
    }
}
