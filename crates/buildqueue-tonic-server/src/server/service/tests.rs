use super::*;
use buildqueue::{DigestFunction, RequeuePolicy};
use buildqueue_tonic_core::proto::{
    execution::{
        ActionResult, CancelOperationRequest, Digest, ExecuteRequest, ExecuteResponse,
        GetCapabilitiesRequest, Stage, WaitExecutionRequest, capabilities_server::Capabilities,
        execution_server::Execution,
    },
    scheduler::{
        ExecutionProgress, PollForWorkRequest, ReportProgressRequest, ReportProgressResponse,
        WorkAssignment, report_progress_request::Report, scheduler_server::Scheduler,
    },
};
use core::time::Duration;
use tokio_stream::StreamExt;
use tonic::{Code, Request};

fn config(jobs_pending_max: usize) -> ServerConfig {
    ServerConfig {
        digest_function: DigestFunction::Sha256,
        jobs_pending_max,
        poll_timeout: Duration::from_secs(1),
        lease_timeout: Duration::from_secs(10),
        watch_timeout: Duration::from_secs(1),
        completed_retention: Duration::from_secs(30),
        maintenance_interval: Duration::from_secs(1),
        requeue_policy: RequeuePolicy::Front,
        stream_buffer_size: 8,
        shutdown_timeout: Duration::from_secs(1),
        server_addr: "127.0.0.1:0".to_string(),
        uds: false,
    }
}

fn execute_request(n: u64, skip_cache_lookup: bool) -> ExecuteRequest {
    ExecuteRequest {
        instance_name: "main".to_string(),
        action_digest: Some(Digest {
            hash: format!("{n:064x}"),
            size_bytes: 140,
        }),
        skip_cache_lookup,
        ..Default::default()
    }
}

async fn execute(service: &QueueService, request: ExecuteRequest) -> OperationStream {
    match service.execute(Request::new(request)).await {
        Ok(response) => response.into_inner(),
        Err(status) => panic!("execute failed: {status}"),
    }
}

async fn execute_err(service: &QueueService, request: ExecuteRequest) -> Status {
    match service.execute(Request::new(request)).await {
        Ok(_) => panic!("execute unexpectedly succeeded"),
        Err(status) => status,
    }
}

async fn next_operation(stream: &mut OperationStream) -> Operation {
    stream
        .next()
        .await
        .expect("stream ended")
        .expect("stream errored")
}

fn stage(operation: &Operation) -> Stage {
    operation.metadata.as_ref().map_or(Stage::Unknown, |m| m.stage())
}

async fn poll(service: &QueueService, worker_id: &str) -> Option<WorkAssignment> {
    service
        .poll_for_work(Request::new(PollForWorkRequest {
            worker_id: worker_id.to_string(),
            platform: None,
        }))
        .await
        .unwrap()
        .into_inner()
        .assignment
}

async fn report(
    service: &QueueService,
    worker_id: &str,
    operation_name: &str,
    sequence_number: u64,
    report: Report,
) -> ReportProgressResponse {
    service
        .report_progress(Request::new(ReportProgressRequest {
            worker_id: worker_id.to_string(),
            operation_name: operation_name.to_string(),
            sequence_number,
            report: Some(report),
        }))
        .await
        .unwrap()
        .into_inner()
}

fn completed(exit_code: i32) -> Report {
    Report::Completed(ExecuteResponse {
        result: Some(ActionResult {
            exit_code,
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[tokio::test(start_paused = true)]
async fn execute_streams_every_transition() {
    let service = QueueService::new(config(10));
    let mut stream = execute(&service, execute_request(1, false)).await;

    let queued = next_operation(&mut stream).await;
    assert_eq!(stage(&queued), Stage::Queued);
    assert_eq!(queued.version, 1);
    assert!(!queued.done);

    let assignment = poll(&service, "w1").await.expect("assignment");
    let name = assignment.operation_name;
    assert_eq!(name, queued.name);
    let executing = next_operation(&mut stream).await;
    assert_eq!(stage(&executing), Stage::Executing);
    assert_eq!(executing.version, assignment.version);
    assert_eq!(executing.metadata.unwrap().worker_id, "w1");

    let base = assignment.version;
    let progress = Report::Progress(ExecutionProgress {
        message: "linking".to_string(),
    });
    assert!(!report(&service, "w1", &name, base, progress.clone()).await.accepted);
    assert!(report(&service, "w1", &name, base + 1, progress.clone()).await.accepted);
    let update = next_operation(&mut stream).await;
    assert_eq!(update.metadata.unwrap().progress_message, "linking");

    // A retried report carries no new information.
    assert!(!report(&service, "w1", &name, base + 1, progress).await.accepted);

    assert!(report(&service, "w1", &name, base + 2, completed(0)).await.accepted);
    let done = next_operation(&mut stream).await;
    assert!(done.done);
    assert_eq!(done.version, 4);
    let response = done.response.unwrap();
    assert!(!response.cached_result);
    assert_eq!(response.result.unwrap().exit_code, 0);

    assert!(stream.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn full_queue_is_resource_exhausted() {
    let service = QueueService::new(config(1));
    let _first = execute(&service, execute_request(1, false)).await;

    let status = execute_err(&service, execute_request(2, false)).await;
    assert_eq!(status.code(), Code::ResourceExhausted);

    // An identical submission attaches instead of queueing.
    let mut attached = execute(&service, execute_request(1, false)).await;
    assert_eq!(stage(&next_operation(&mut attached).await), Stage::Queued);
}

#[tokio::test(start_paused = true)]
async fn malformed_digests_are_invalid_argument() {
    let service = QueueService::new(config(10));

    let mut request = execute_request(1, false);
    request.action_digest = None;
    assert_eq!(
        execute_err(&service, request).await.code(),
        Code::InvalidArgument
    );

    let mut request = execute_request(1, false);
    request.digest_function = 42;
    assert_eq!(
        execute_err(&service, request).await.code(),
        Code::InvalidArgument
    );

    let mut request = execute_request(1, false);
    request.digest_function = buildqueue_tonic_core::proto::execution::DigestFunction::Md5.into();
    assert_eq!(
        execute_err(&service, request).await.code(),
        Code::InvalidArgument
    );
}

#[tokio::test(start_paused = true)]
async fn retained_success_is_served_as_cached_result() {
    let service = QueueService::new(config(10));
    let mut stream = execute(&service, execute_request(7, false)).await;
    let name = next_operation(&mut stream).await.name;

    let assignment = poll(&service, "w1").await.expect("assignment");
    assert_eq!(assignment.operation_name, name);
    let sequence = assignment.version + 1;
    assert!(report(&service, "w1", &name, sequence, completed(0)).await.accepted);
    while stream.next().await.is_some() {}

    let mut cached = execute(&service, execute_request(7, false)).await;
    let hit = next_operation(&mut cached).await;
    assert_eq!(hit.name, name);
    assert!(hit.done);
    assert!(hit.response.unwrap().cached_result);
    assert!(cached.next().await.is_none());

    let mut fresh = execute(&service, execute_request(7, true)).await;
    let rerun = next_operation(&mut fresh).await;
    assert_ne!(rerun.name, name);
    assert_eq!(stage(&rerun), Stage::Queued);
}

#[tokio::test(start_paused = true)]
async fn cancel_requires_a_single_watcher() {
    let service = QueueService::new(config(10));
    let mut first = execute(&service, execute_request(3, false)).await;
    let name = next_operation(&mut first).await.name;

    let mut second = execute(&service, execute_request(3, false)).await;
    next_operation(&mut second).await;
    let status = service
        .cancel_operation(Request::new(CancelOperationRequest { name: name.clone() }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    drop(second);
    // Let the second forwarder notice its client is gone.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let assignment = poll(&service, "w1").await.expect("assignment");
    assert_eq!(assignment.operation_name, name);
    next_operation(&mut first).await;

    service
        .cancel_operation(Request::new(CancelOperationRequest { name: name.clone() }))
        .await
        .unwrap();
    let cancelled = next_operation(&mut first).await;
    assert!(cancelled.done);
    assert_eq!(stage(&cancelled), Stage::Cancelled);

    let response = report(&service, "w1", &name, assignment.version + 1, completed(0)).await;
    assert!(response.cancelled);
    assert!(!response.accepted);
}

#[tokio::test(start_paused = true)]
async fn wait_execution_replays_latest_state() {
    let service = QueueService::new(config(10));
    let mut stream = execute(&service, execute_request(4, false)).await;
    let name = next_operation(&mut stream).await.name;
    poll(&service, "w1").await.expect("assignment");

    let mut waiter = match service
        .wait_execution(Request::new(WaitExecutionRequest { name: name.clone() }))
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => panic!("wait failed: {status}"),
    };
    let replay = next_operation(&mut waiter).await;
    assert_eq!(replay.name, name);
    assert_eq!(stage(&replay), Stage::Executing);

    let unknown = service
        .wait_execution(Request::new(WaitExecutionRequest {
            name: "missing".to_string(),
        }))
        .await;
    assert!(matches!(unknown, Err(status) if status.code() == Code::NotFound));

    let empty = service
        .wait_execution(Request::new(WaitExecutionRequest {
            name: String::new(),
        }))
        .await;
    assert!(matches!(empty, Err(status) if status.code() == Code::InvalidArgument));
}

#[tokio::test(start_paused = true)]
async fn idle_poll_returns_no_assignment() {
    let service = QueueService::new(config(10));
    assert_eq!(poll(&service, "w1").await, None);

    let status = service
        .poll_for_work(Request::new(PollForWorkRequest::default()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test(start_paused = true)]
async fn empty_report_is_invalid_argument() {
    let service = QueueService::new(config(10));
    let status = service
        .report_progress(Request::new(ReportProgressRequest {
            worker_id: "w1".to_string(),
            operation_name: "op".to_string(),
            sequence_number: 1,
            report: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test(start_paused = true)]
async fn capabilities_advertise_queue_limits() {
    let service = QueueService::new(config(25));
    let capabilities = service
        .get_capabilities(Request::new(GetCapabilitiesRequest::default()))
        .await
        .unwrap()
        .into_inner()
        .execution_capabilities
        .unwrap();
    assert_eq!(capabilities.jobs_pending_max, 25);
    assert!(capabilities.exec_enabled);
    assert_eq!(
        capabilities.digest_function(),
        buildqueue_tonic_core::proto::execution::DigestFunction::Sha256
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_open_streams_and_refuses_work() {
    let service = QueueService::new(config(10));
    let mut stream = execute(&service, execute_request(5, false)).await;
    next_operation(&mut stream).await;

    service.shutdown().await;

    let status = stream.next().await.expect("shutdown status").unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert!(stream.next().await.is_none());

    let status = execute_err(&service, execute_request(6, false)).await;
    assert_eq!(status.code(), Code::Unavailable);
    let status = service
        .poll_for_work(Request::new(PollForWorkRequest {
            worker_id: "w1".to_string(),
            platform: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}
