//! Retry policies applied to a failed job.
//!
//! ```text
//! failure ──► RetryPolicyResolver::resolve(job, definition, config)
//!               ├─ definition.retry_time_cycle ─┐
//!               ├─ config.failed_job_retry_time_cycle ─┤ parse ok ──► CyclicRetryPolicy
//!               │                               └ parse error ─► DefaultRetryPolicy (warn)
//!               └─ no cycle ─────────────────────────────────────► DefaultRetryPolicy
//! ```
//!
//! Both policies unlock the job and record the exception. Optimistic locking
//! failures never consume a retry: the job did not fail, it lost a race.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use txflow_core::{DomainError, DomainResult, MAX_INTERVAL_MS, deadline, interval_from_millis};
use txflow_core::model::{JobDefinitionEntity, JobEntity};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// What went wrong during a job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub details: Option<String>,
    pub optimistic_locking: bool,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            optimistic_locking: false,
        }
    }

    pub fn from_error(err: &EngineError) -> Self {
        Self {
            message: err.to_string(),
            details: err.details(),
            optimistic_locking: err.is_optimistic_locking(),
        }
    }
}

pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Update `job` in place to reflect `failure`.
    fn apply(&self, job: &mut JobEntity, failure: &JobFailure, now: DateTime<Utc>) -> DomainResult<()>;
}

fn consume_retry(job: &mut JobEntity, failure: &JobFailure) {
    if !failure.optimistic_locking {
        job.retries = (job.retries - 1).max(0);
    }
}

/// Due date untouched, lock released immediately, one retry consumed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn apply(&self, job: &mut JobEntity, failure: &JobFailure, _now: DateTime<Utc>) -> DomainResult<()> {
        job.unlock();
        job.record_exception(failure.message.clone(), failure.details.clone());
        consume_retry(job, failure);
        Ok(())
    }
}

/// Retries follow a configured time cycle.
///
/// On the first failure the retry count is reset to what the cycle allows.
/// Every failure moves the due date by the interval selected for the current
/// retry count.
#[derive(Debug, Clone, PartialEq)]
pub struct CyclicRetryPolicy {
    cycle: RetryCycle,
}

impl CyclicRetryPolicy {
    pub fn new(cycle: RetryCycle) -> Self {
        Self { cycle }
    }
}

impl RetryPolicy for CyclicRetryPolicy {
    fn apply(&self, job: &mut JobEntity, failure: &JobFailure, now: DateTime<Utc>) -> DomainResult<()> {
        let retries = if job.is_first_execution() { self.cycle.initial_retries() } else { job.retries };
        let due = deadline(now, self.cycle.interval_for(retries))?;
        job.retries = retries;
        job.due_date = Some(due);
        job.unlock();
        job.record_exception(failure.message.clone(), failure.details.clone());
        consume_retry(job, failure);
        Ok(())
    }
}

/// Parsed retry cycle: `R<n>/<duration>` or `<duration>,<duration>,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCycle {
    repeat: Option<i32>,
    intervals: Vec<Duration>,
}

impl RetryCycle {
    pub fn repeat(count: i32, interval: Duration) -> Self {
        Self {
            repeat: Some(count),
            intervals: vec![interval],
        }
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// Retries a job gets when it fails for the first time.
    pub fn initial_retries(&self) -> i32 {
        match self.repeat {
            Some(count) => count,
            None => self.intervals.len() as i32 + 1,
        }
    }

    /// Interval for a job that currently has `retries` left.
    pub fn interval_for(&self, retries: i32) -> Duration {
        let last = self.intervals.len() as i64 - 1;
        let index = (self.intervals.len() as i64 - retries as i64 + 1).clamp(0, last.max(0));
        self.intervals[index as usize]
    }
}

impl FromStr for RetryCycle {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if let Some(rest) = text.strip_prefix('R') {
            let (count, interval) = rest
                .split_once('/')
                .ok_or_else(|| DomainError::validation(format!("retry cycle '{text}' lacks an interval")))?;
            let count: i32 = count
                .parse()
                .map_err(|_| DomainError::validation(format!("retry cycle '{text}' has an invalid repeat count")))?;
            if count < 0 {
                return Err(DomainError::validation(format!("retry cycle '{text}' has a negative repeat count")));
            }
            return Ok(Self::repeat(count, parse_duration(interval)?));
        }

        let intervals = text
            .split(',')
            .map(|part| parse_duration(part.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            repeat: None,
            intervals,
        })
    }
}

const MILLIS_PER_SECOND: f64 = 1_000.0;
const MILLIS_PER_MINUTE: f64 = 60.0 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: f64 = 60.0 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: f64 = 24.0 * MILLIS_PER_HOUR;

/// ISO-8601 duration (`P[nY][nM][nW][nD][T[nH][nM][nS]]`).
///
/// Years count as 365 days and months as 30 days.
pub fn parse_duration(text: &str) -> Result<Duration, DomainError> {
    let invalid = || DomainError::validation(format!("invalid ISO-8601 duration '{text}'"));
    let rest = text.strip_prefix('P').ok_or_else(invalid)?;

    let mut in_time = false;
    let mut number = String::new();
    let mut components = 0;
    let mut total_ms = 0.0;
    for c in rest.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            'T' if !in_time && number.is_empty() => in_time = true,
            unit => {
                let value: f64 = number.parse().map_err(|_| invalid())?;
                let unit_ms = match (in_time, unit) {
                    (false, 'Y') => 365.0 * MILLIS_PER_DAY,
                    (false, 'M') => 30.0 * MILLIS_PER_DAY,
                    (false, 'W') => 7.0 * MILLIS_PER_DAY,
                    (false, 'D') => MILLIS_PER_DAY,
                    (true, 'H') => MILLIS_PER_HOUR,
                    (true, 'M') => MILLIS_PER_MINUTE,
                    (true, 'S') => MILLIS_PER_SECOND,
                    _ => return Err(invalid()),
                };
                total_ms += value * unit_ms;
                number.clear();
                components += 1;
            }
        }
    }
    if components == 0 || !number.is_empty() {
        return Err(invalid());
    }
    let total_ms = total_ms.round();
    if !total_ms.is_finite() || total_ms > MAX_INTERVAL_MS as f64 {
        return Err(DomainError::validation(format!(
            "ISO-8601 duration '{text}' exceeds the maximum of {MAX_INTERVAL_MS}ms"
        )));
    }
    interval_from_millis(total_ms as u64)
}

/// Picks the policy for a failed job.
pub trait RetryPolicyResolver: Send + Sync {
    fn resolve(
        &self,
        job: &JobEntity,
        definition: Option<&JobDefinitionEntity>,
        config: &EngineConfig,
    ) -> Box<dyn RetryPolicy>;
}

/// Job definition cycle, then the engine-wide cycle, then [`DefaultRetryPolicy`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPolicyResolver;

impl RetryPolicyResolver for DefaultRetryPolicyResolver {
    fn resolve(
        &self,
        job: &JobEntity,
        definition: Option<&JobDefinitionEntity>,
        config: &EngineConfig,
    ) -> Box<dyn RetryPolicy> {
        let cycle = definition
            .and_then(|d| d.retry_time_cycle.as_deref())
            .or(config.failed_job_retry_time_cycle.as_deref());
        let Some(cycle) = cycle else {
            return Box::new(DefaultRetryPolicy);
        };
        match cycle.parse::<RetryCycle>() {
            Ok(cycle) => Box::new(CyclicRetryPolicy::new(cycle)),
            Err(err) => {
                warn!(job_id = %job.id, cycle, error = %err, "unparsable retry cycle, using default retry policy");
                Box::new(DefaultRetryPolicy)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use txflow_core::model::JobKind;

    fn job(now: DateTime<Utc>) -> JobEntity {
        let mut j = JobEntity::new(JobKind::Message, "async-continuation", 3, now);
        j.lock("worker-1", now + Duration::minutes(5));
        j
    }

    fn cyclic(cycle: &str) -> CyclicRetryPolicy {
        CyclicRetryPolicy::new(cycle.parse().unwrap())
    }

    #[test]
    fn parses_common_durations() {
        assert_eq!(parse_duration("PT5M").unwrap(), Duration::minutes(5));
        assert_eq!(parse_duration("PT1H30M").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("P1D").unwrap(), Duration::days(1));
        assert_eq!(parse_duration("P1W").unwrap(), Duration::days(7));
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::milliseconds(500));
        assert_eq!(parse_duration("P1DT2H").unwrap(), Duration::hours(26));
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "P", "PT", "5M", "PT5", "PT5X", "P5H", "PTT5M"] {
            assert!(parse_duration(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn parses_repeat_and_list_cycles() {
        let repeat: RetryCycle = "R5/PT5M".parse().unwrap();
        assert_eq!(repeat.initial_retries(), 5);
        assert_eq!(repeat.intervals(), &[Duration::minutes(5)]);

        let list: RetryCycle = "PT1M, PT2M,PT3M".parse().unwrap();
        assert_eq!(list.initial_retries(), 4);
        assert_eq!(list.intervals().len(), 3);

        assert!("R/PT5M".parse::<RetryCycle>().is_err());
        assert!("R5".parse::<RetryCycle>().is_err());
        assert!("PT1M,,PT2M".parse::<RetryCycle>().is_err());
    }

    #[test]
    fn default_policy_consumes_retry_and_keeps_due_date() {
        let now = Utc::now();
        let mut j = job(now);
        let due = j.due_date;
        DefaultRetryPolicy.apply(&mut j, &JobFailure::new("boom"), now).unwrap();
        assert_eq!(j.retries, 2);
        assert_eq!(j.due_date, due);
        assert!(j.lock_owner.is_none());
        assert!(j.lock_expiration_time.is_none());
        assert_eq!(j.exception_message.as_deref(), Some("boom"));
    }

    #[test]
    fn conflicts_do_not_consume_retries() {
        let now = Utc::now();
        let mut j = job(now);
        let failure = JobFailure {
            optimistic_locking: true,
            ..JobFailure::new("conflict")
        };
        DefaultRetryPolicy.apply(&mut j, &failure, now).unwrap();
        assert_eq!(j.retries, 3);

        let mut j = job(now);
        cyclic("R5/PT5M").apply(&mut j, &failure, now).unwrap();
        assert_eq!(j.retries, 5);
        assert_eq!(j.due_date, Some(now + Duration::minutes(5)));
        assert!(j.lock_owner.is_none());
    }

    #[test]
    fn single_interval_allows_one_retry_after_first_failure() {
        let now = Utc::now();
        let mut j = job(now);
        cyclic("PT8M").apply(&mut j, &JobFailure::new("boom"), now).unwrap();
        assert_eq!(j.retries, 1);
        assert_eq!(j.due_date, Some(now + Duration::minutes(8)));
    }

    #[test]
    fn repeat_cycle_initializes_retries() {
        let now = Utc::now();
        let mut j = job(now);
        cyclic("R10/PT5M").apply(&mut j, &JobFailure::new("boom"), now).unwrap();
        assert_eq!(j.retries, 9);
    }

    #[test]
    fn interval_list_initializes_retries_to_length_plus_one() {
        let now = Utc::now();
        let mut j = job(now);
        cyclic("PT1M,PT2M,PT3M,PT4M,PT5M,PT6M,PT7M,PT8M").apply(&mut j, &JobFailure::new("boom"), now).unwrap();
        assert_eq!(j.retries, 8);
        assert_eq!(j.due_date, Some(now + Duration::minutes(1)));
    }

    #[test]
    fn manually_raised_retries_start_at_the_first_interval() {
        let now = Utc::now();
        let policy = cyclic("PT3M,PT10M,PT8M");
        let mut j = job(now);
        j.record_exception("earlier failure", None);
        j.retries = 5;

        let mut delays = Vec::new();
        for _ in 0..4 {
            policy.apply(&mut j, &JobFailure::new("boom"), now).unwrap();
            delays.push(j.due_date.map(|d| d - now));
        }
        let minutes = |m| Some(Duration::minutes(m));
        assert_eq!(delays, vec![minutes(3), minutes(3), minutes(10), minutes(8)]);
        assert_eq!(j.retries, 1);
    }

    #[test]
    fn resolver_prefers_definition_cycle_and_falls_back_on_garbage() {
        let now = Utc::now();
        let j = job(now);
        let config = EngineConfig::default().with_retry_time_cycle("R2/PT1M");

        let definition = JobDefinitionEntity::new("async-continuation", "task").with_retry_time_cycle("R7/PT1M");
        let mut applied = j.clone();
        DefaultRetryPolicyResolver
            .resolve(&j, Some(&definition), &config)
            .apply(&mut applied, &JobFailure::new("boom"), now).unwrap();
        assert_eq!(applied.retries, 6);

        let mut applied = j.clone();
        DefaultRetryPolicyResolver
            .resolve(&j, None, &config)
            .apply(&mut applied, &JobFailure::new("boom"), now).unwrap();
        assert_eq!(applied.retries, 1);

        let broken = JobDefinitionEntity::new("async-continuation", "task").with_retry_time_cycle("every now and then");
        let mut applied = j.clone();
        DefaultRetryPolicyResolver
            .resolve(&j, Some(&broken), &config)
            .apply(&mut applied, &JobFailure::new("boom"), now).unwrap();
        assert_eq!(applied.retries, 2);
        assert_eq!(applied.due_date, j.due_date);
    }

    #[test]
    fn oversized_durations_are_rejected() {
        assert!(parse_duration("P300000Y").is_err());
        assert!("R3/P300000Y".parse::<RetryCycle>().is_err());
        assert!(parse_duration(&format!("P{}D", "9".repeat(400))).is_err());
        assert!(parse_duration("P9999Y").is_ok());
    }

    #[test]
    fn unrepresentable_due_date_is_an_error_and_leaves_the_job_alone() {
        let now = Utc::now();
        let mut j = job(now);
        let before = j.clone();
        let policy = CyclicRetryPolicy::new(RetryCycle::repeat(3, Duration::MAX));

        let err = policy.apply(&mut j, &JobFailure::new("boom"), now).unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(j, before);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn minute_durations_round_trip(minutes in 0i64..100_000) {
            prop_assert_eq!(parse_duration(&format!("PT{minutes}M")).unwrap(), Duration::minutes(minutes));
        }

        #[test]
        fn interval_selection_stays_in_the_cycle(
            intervals in prop::collection::vec(1i64..1_000, 1..12),
            retries in -5i32..50,
        ) {
            let text = intervals.iter().map(|m| format!("PT{m}M")).collect::<Vec<_>>().join(",");
            let cycle: RetryCycle = text.parse().unwrap();
            let chosen = cycle.interval_for(retries);
            prop_assert!(cycle.intervals().contains(&chosen));
        }
    }
}
