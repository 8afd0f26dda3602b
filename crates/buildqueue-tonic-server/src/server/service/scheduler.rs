//! Worker-facing `Scheduler` service.

use super::QueueService;
use crate::server::telemetry::{increment_assignments, record_poll_duration, record_report};
use buildqueue::{ExecuteResult, OperationName, Platform, Report, ReportOutcome, WorkerId};
use buildqueue_tonic_core::{
    Error,
    proto::scheduler::{
        PollForWorkRequest, PollForWorkResponse, ReportProgressRequest, ReportProgressResponse,
        report_progress_request, scheduler_server::Scheduler,
    },
};
use tonic::{Request, Response, Status};

#[tonic::async_trait]
impl Scheduler for QueueService {
    /// Long-polls for an operation this worker's platform satisfies.
    ///
    /// Returns an empty response if nothing matched within the poll timeout.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(worker = %req.get_ref().worker_id)))]
    async fn poll_for_work(
        &self,
        req: Request<PollForWorkRequest>,
    ) -> Result<Response<PollForWorkResponse>, Status> {
        let start = std::time::Instant::now();
        let req = req.into_inner();
        let platform = req.platform.map(Platform::from).unwrap_or_default();

        let assignment = self
            .queue
            .poll_for_work(WorkerId::from(req.worker_id), platform)
            .await
            .map_err(Error::from)?;
        record_poll_duration(start.elapsed().as_millis() as f64);

        if assignment.is_some() {
            increment_assignments();
        }

        Ok(Response::new(PollForWorkResponse {
            assignment: assignment.map(Into::into),
        }))
    }

    /// Applies a progress or completion report.
    ///
    /// Ignored reports still succeed; `accepted` tells the worker whether the
    /// report changed anything and `cancelled` that it should stop.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(worker = %req.get_ref().worker_id, operation = %req.get_ref().operation_name)))]
    async fn report_progress(
        &self,
        req: Request<ReportProgressRequest>,
    ) -> Result<Response<ReportProgressResponse>, Status> {
        let req = req.into_inner();
        let report = match req.report {
            Some(report_progress_request::Report::Progress(progress)) => Report::Progress {
                message: progress.message,
            },
            Some(report_progress_request::Report::Completed(response)) => {
                Report::Completed(ExecuteResult::from(response))
            }
            None => {
                return Err(Error::InvalidRequest {
                    reason: "report must carry progress or a completed result".to_string(),
                }
                .into());
            }
        };

        let outcome = self.queue.report_progress(
            &WorkerId::from(req.worker_id),
            &OperationName::from(req.operation_name),
            req.sequence_number,
            report,
        );

        record_report(match outcome {
            ReportOutcome::Accepted => "accepted",
            ReportOutcome::Stale => "stale",
            ReportOutcome::NotAssigned => "not_assigned",
            ReportOutcome::Cancelled => "cancelled",
        });

        Ok(Response::new(ReportProgressResponse {
            accepted: outcome == ReportOutcome::Accepted,
            cancelled: outcome == ReportOutcome::Cancelled,
        }))
    }
}
