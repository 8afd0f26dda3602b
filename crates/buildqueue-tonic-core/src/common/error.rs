//! Error types for the execution and scheduler services.
//!
//! This module defines the central `Error` enum returned by the gRPC service
//! handlers. It implements `From<Error>` for `tonic::Status` so that handlers
//! can propagate with `?`.
//!
//! ## Error Cases
//! - `Queue`: the build queue refused the request (full queue, bad digest,
//!   unknown operation, shutdown).
//! - `RequestCancelled`: the client went away mid-stream.
//! - `InvalidRequest`: the request was malformed before reaching the queue.
//! - `ServiceShutdown`: a request arrived while the service was shutting down.

use buildqueue::Error as QueueError;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the gRPC services.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The build queue rejected the request.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The client aborted the request.
    #[error("Request cancelled by client")]
    RequestCancelled,

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Queue(e) => match e {
                QueueError::QueueFull { .. } => Status::resource_exhausted(e.to_string()),
                QueueError::UnknownDigestFunction { .. }
                | QueueError::InvalidDigest { .. }
                | QueueError::InvalidRequest { .. } => Status::invalid_argument(e.to_string()),
                QueueError::OperationNotFound { .. } => Status::not_found(e.to_string()),
                QueueError::OperationShared { .. } | QueueError::OperationFinished { .. } => {
                    Status::failed_precondition(e.to_string())
                }
                QueueError::Shutdown => Status::unavailable(e.to_string()),
                _ => Status::internal(e.to_string()),
            },
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
