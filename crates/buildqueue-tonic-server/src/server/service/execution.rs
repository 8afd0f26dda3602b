//! Client-facing services: `Capabilities` and `Execution`.
//!
//! `Execute` admits an action (or attaches to an identical one) and streams
//! every state transition of the resulting operation until it finishes. A
//! client that disconnects only detaches; the operation keeps running for
//! any other watcher and stays retained for `WaitExecution`.

use super::{OperationStream, QueueService};
use crate::server::telemetry::record_execution;
use buildqueue::{Admission, ExecuteRequest as QueueExecuteRequest, OperationName, Platform};
use buildqueue_tonic_core::{
    Error,
    convert::{digest_from_proto, digest_function_from_proto},
    proto::execution::{
        CancelOperationRequest, CancelOperationResponse, ExecuteRequest, GetCapabilitiesRequest,
        ServerCapabilities, WaitExecutionRequest, capabilities_server::Capabilities,
        execution_server::Execution,
    },
};
use tonic::{Request, Response, Status};

fn operation_name(name: String) -> Result<OperationName, Error> {
    if name.is_empty() {
        return Err(Error::InvalidRequest {
            reason: "operation name must not be empty".to_string(),
        });
    }
    Ok(OperationName::from(name))
}

#[tonic::async_trait]
impl Capabilities for QueueService {
    async fn get_capabilities(
        &self,
        _req: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        Ok(Response::new(self.queue.capabilities().into()))
    }
}

#[tonic::async_trait]
impl Execution for QueueService {
    type ExecuteStream = OperationStream;
    type WaitExecutionStream = OperationStream;

    /// Admits an execution and streams its operation.
    ///
    /// The first message is the operation's current state (`QUEUED` for a
    /// new operation, possibly later for a deduplicated one). A full pending
    /// queue fails the call with `RESOURCE_EXHAUSTED` before any message.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(instance = %req.get_ref().instance_name)))]
    async fn execute(
        &self,
        req: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let req = req.into_inner();
        let function =
            digest_function_from_proto(req.digest_function, self.queue.config().digest_function)
                .map_err(Error::from)?;
        let action_digest = digest_from_proto(function, req.action_digest).map_err(Error::from)?;

        let execution = match self.queue.execute(QueueExecuteRequest {
            instance_name: req.instance_name,
            action_digest,
            platform: req.platform.map(Platform::from).unwrap_or_default(),
            skip_cache_lookup: req.skip_cache_lookup,
        }) {
            Ok(execution) => execution,
            Err(e) => {
                record_execution("rejected");
                #[cfg(feature = "tracing")]
                tracing::warn!("Execution rejected: {}", e);
                return Err(Error::from(e).into());
            }
        };

        let cached = match execution.admission {
            Admission::Created => {
                record_execution("created");
                false
            }
            Admission::Deduplicated => {
                record_execution("deduplicated");
                false
            }
            Admission::CacheHit => {
                record_execution("cache_hit");
                true
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            operation = %execution.watcher.name(),
            admission = ?execution.admission,
            "Execution admitted"
        );

        Ok(Response::new(self.stream_updates(execution.watcher, cached)))
    }

    /// Reattaches to an operation by name. The first message repeats its
    /// latest state.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(operation = %req.get_ref().name)))]
    async fn wait_execution(
        &self,
        req: Request<WaitExecutionRequest>,
    ) -> Result<Response<Self::WaitExecutionStream>, Status> {
        let name = operation_name(req.into_inner().name)?;
        let watcher = self.queue.wait_execution(&name).map_err(Error::from)?;
        Ok(Response::new(self.stream_updates(watcher, false)))
    }

    /// Cancels an operation that at most one client is watching.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(operation = %req.get_ref().name)))]
    async fn cancel_operation(
        &self,
        req: Request<CancelOperationRequest>,
    ) -> Result<Response<CancelOperationResponse>, Status> {
        let name = operation_name(req.into_inner().name)?;
        self.queue.cancel(&name).map_err(Error::from)?;
        Ok(Response::new(CancelOperationResponse {}))
    }
}
