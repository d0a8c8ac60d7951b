use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use txflow_core::model::{ExecutionEntity, JobEntity, JobKind};
use txflow_core::{Clock, JobId};
use txflow_infra::{CommandContext, CorrelationRequest, Engine, EngineResult, JobOutcome};

fn complete(_: &mut CommandContext, _: &JobEntity) -> EngineResult<JobOutcome> {
    Ok(JobOutcome::Completed)
}

fn engine() -> Engine {
    Engine::builder().register_job_handler("bench", complete).build().unwrap()
}

fn create_jobs(engine: &Engine, count: usize) -> Vec<JobId> {
    let now = engine.clock().now();
    (0..count)
        .map(|_| {
            engine
                .management()
                .create_job(JobEntity::new(JobKind::Message, "bench", 3, now).with_exclusive(false))
                .unwrap()
        })
        .collect()
}

fn bench_command_commit_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_commit_latency");
    group.sample_size(1000);

    group.bench_function("insert_job", |b| {
        let engine = engine();
        let executor = engine.command_executor();
        b.iter(|| {
            let job = JobEntity::new(JobKind::Message, "bench", 3, Utc::now());
            executor.run(|ctx| ctx.insert(black_box(job.clone()))).unwrap();
        });
    });

    // Revision-checked update of one hot row.
    group.bench_function("update_job", |b| {
        let engine = engine();
        let executor = engine.command_executor();
        let job_id = create_jobs(&engine, 1)[0];
        b.iter(|| {
            executor
                .run(|ctx| {
                    let mut job: JobEntity = ctx.get(job_id)?;
                    job.priority = black_box(job.priority + 1);
                    ctx.update(job)
                })
                .unwrap();
        });
    });

    group.bench_function("read_only", |b| {
        let engine = engine();
        let executor = engine.command_executor();
        let job_id = create_jobs(&engine, 1)[0];
        b.iter(|| {
            black_box(executor.run(|ctx| ctx.find::<JobEntity>(job_id)).unwrap());
        });
    });

    group.finish();
}

fn bench_flush_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush_size");

    for rows in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("update_rows", rows), &rows, |b, &rows| {
            let engine = engine();
            let executor = engine.command_executor();
            let ids = create_jobs(&engine, rows);
            b.iter(|| {
                executor
                    .run(|ctx| {
                        for id in &ids {
                            if let Some(job) = ctx.find_mut::<JobEntity>(*id)? {
                                job.priority += 1;
                            }
                        }
                        Ok(())
                    })
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_acquire_and_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_and_execute");

    for batch in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let engine = engine();
            b.iter(|| {
                create_jobs(&engine, batch);
                let acquired = engine.acquire_jobs(batch).unwrap();
                for id in acquired.job_ids() {
                    black_box(engine.execute_job(id).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation");

    for exclusive in [false, true] {
        let label = if exclusive { "exclusive" } else { "non_exclusive" };
        group.bench_function(label, |b| {
            let engine = engine();
            let runtime = engine.runtime();
            let pi: ExecutionEntity = runtime.start_process_instance("catch", None).unwrap();
            b.iter(|| {
                runtime.subscribe_to_message(pi.id, "Tick").unwrap();
                let request = CorrelationRequest::message("Tick").process_instance(pi.id);
                let request = if exclusive { request.exclusive() } else { request };
                black_box(engine.correlate(request).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_commit_latency,
    bench_flush_size,
    bench_acquire_and_execute,
    bench_correlation
);
criterion_main!(benches);
