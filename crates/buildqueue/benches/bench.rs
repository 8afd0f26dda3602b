use buildqueue::{
    ActionResult, BuildQueue, BuildQueueConfig, Digest, DigestFunction, ExecuteRequest,
    ExecuteResult, Platform, Report, WorkerId,
};
use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Builder;

fn digest(n: u64) -> Digest {
    Digest::new(DigestFunction::Sha256, format!("{n:064x}"), 0).expect("valid digest")
}

fn request(n: u64) -> ExecuteRequest {
    ExecuteRequest {
        instance_name: "bench".to_string(),
        action_digest: digest(n),
        platform: Platform::new().with_property("OSFamily", "linux"),
        skip_cache_lookup: true,
    }
}

/// Submit, assign and complete one operation at a time.
fn bench_execute_poll_complete(c: &mut Criterion) {
    let rt = Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let queue = BuildQueue::new(BuildQueueConfig::default());
    let worker = WorkerId::from("bench-worker");
    let platform = Platform::new()
        .with_property("OSFamily", "linux")
        .with_property("cores", "16");

    let mut group = c.benchmark_group("build_queue");
    group.throughput(Throughput::Elements(1));
    let mut n = 0_u64;

    group.bench_function("execute_poll_complete", |b| {
        b.to_async(&rt).iter(|| {
            n += 1;
            let execution = queue.execute(request(n)).expect("admitted");
            let queue = &queue;
            let worker = worker.clone();
            let platform = platform.clone();
            async move {
                let assignment = queue
                    .poll_for_work(worker.clone(), platform)
                    .await
                    .expect("poll")
                    .expect("assignment");
                let outcome = queue.report_progress(
                    &worker,
                    &assignment.operation_name,
                    assignment.version + 1,
                    Report::Completed(ExecuteResult {
                        action_result: Some(ActionResult::default()),
                        ..ExecuteResult::default()
                    }),
                );
                black_box((outcome, execution));
            }
        });
    });

    group.bench_function("deduplicated_execute", |b| {
        let held = queue.execute(request(u64::MAX)).expect("admitted");
        b.iter(|| black_box(queue.execute(request(u64::MAX)).expect("attached")));
        drop(held);
    });

    group.finish();
}

criterion_group!(benches, bench_execute_poll_complete);
criterion_main!(benches);
