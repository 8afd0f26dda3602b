//! Conversions between generated protocol messages and `buildqueue` types.
//!
//! Inbound conversions that can fail (digests, digest functions) return the
//! core [`buildqueue::Error`] so handlers can propagate them with `?`.

use crate::proto::{execution, scheduler};
use buildqueue::{
    ActionResult, Capabilities, Digest, DigestFunction, Error as QueueError, ExecuteResult,
    ExecutionFailure, OperationUpdate, Platform, Stage, WorkAssignment,
};

impl From<DigestFunction> for execution::DigestFunction {
    fn from(function: DigestFunction) -> Self {
        match function {
            DigestFunction::Sha256 => Self::Sha256,
            DigestFunction::Sha1 => Self::Sha1,
            DigestFunction::Md5 => Self::Md5,
        }
    }
}

/// Resolves a wire digest function, treating `UNKNOWN` (unset) as
/// `default`.
///
/// # Errors
///
/// Returns [`QueueError::UnknownDigestFunction`] for values outside the enum.
pub fn digest_function_from_proto(
    value: i32,
    default: DigestFunction,
) -> Result<DigestFunction, QueueError> {
    match execution::DigestFunction::try_from(value) {
        Ok(execution::DigestFunction::Unknown) => Ok(default),
        Ok(execution::DigestFunction::Sha256) => Ok(DigestFunction::Sha256),
        Ok(execution::DigestFunction::Sha1) => Ok(DigestFunction::Sha1),
        Ok(execution::DigestFunction::Md5) => Ok(DigestFunction::Md5),
        Err(_) => Err(QueueError::UnknownDigestFunction {
            name: value.to_string(),
        }),
    }
}

/// Validates a wire digest against `function`.
///
/// # Errors
///
/// Returns [`QueueError::InvalidDigest`] if the digest is missing or
/// malformed.
pub fn digest_from_proto(
    function: DigestFunction,
    digest: Option<execution::Digest>,
) -> Result<Digest, QueueError> {
    let digest = digest.ok_or_else(|| QueueError::InvalidDigest {
        reason: "missing action digest".to_string(),
    })?;
    Digest::new(function, digest.hash, digest.size_bytes)
}

impl From<&Digest> for execution::Digest {
    fn from(digest: &Digest) -> Self {
        Self {
            hash: digest.hash().to_string(),
            size_bytes: digest.size_bytes(),
        }
    }
}

impl From<execution::Platform> for Platform {
    fn from(platform: execution::Platform) -> Self {
        platform
            .properties
            .into_iter()
            .map(|property| (property.name, property.value))
            .collect()
    }
}

impl From<&Platform> for execution::Platform {
    fn from(platform: &Platform) -> Self {
        Self {
            properties: platform
                .properties()
                .map(|property| execution::platform::Property {
                    name: property.name.clone(),
                    value: property.value.clone(),
                })
                .collect(),
        }
    }
}

impl From<Stage> for execution::Stage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Queued => Self::Queued,
            Stage::Executing => Self::Executing,
            Stage::Completed => Self::Completed,
            Stage::Cancelled => Self::Cancelled,
        }
    }
}

impl From<ExecuteResult> for execution::ExecuteResponse {
    fn from(result: ExecuteResult) -> Self {
        Self {
            result: result.action_result.map(|action| execution::ActionResult {
                exit_code: action.exit_code,
                stdout_raw: action.stdout_raw,
                stderr_raw: action.stderr_raw,
            }),
            status: result.failure.map(|failure| execution::ExecutionStatus {
                code: failure.code,
                message: failure.message,
            }),
            cached_result: false,
        }
    }
}

impl From<execution::ExecuteResponse> for ExecuteResult {
    fn from(response: execution::ExecuteResponse) -> Self {
        Self {
            action_result: response.result.map(|action| ActionResult {
                exit_code: action.exit_code,
                stdout_raw: action.stdout_raw,
                stderr_raw: action.stderr_raw,
            }),
            // A zero code is success in the status convention; treat it as no
            // failure at all.
            failure: response
                .status
                .filter(|status| status.code != 0)
                .map(|status| ExecutionFailure {
                    code: status.code,
                    message: status.message,
                }),
        }
    }
}

impl From<OperationUpdate> for execution::Operation {
    fn from(update: OperationUpdate) -> Self {
        let done = update.is_done();
        let metadata = execution::ExecuteOperationMetadata {
            stage: execution::Stage::from(update.stage).into(),
            action_digest: Some(execution::Digest::from(&update.action_digest)),
            queued_timestamp: Some(update.queued_at.into()),
            worker_id: update
                .worker_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            progress_message: update.progress.unwrap_or_default(),
        };

        Self {
            name: update.name.to_string(),
            metadata: Some(metadata),
            done,
            response: update.result.map(execution::ExecuteResponse::from),
            version: update.version,
        }
    }
}

impl From<Capabilities> for execution::ServerCapabilities {
    fn from(capabilities: Capabilities) -> Self {
        Self {
            execution_capabilities: Some(execution::ExecutionCapabilities {
                digest_function: execution::DigestFunction::from(capabilities.digest_function)
                    .into(),
                exec_enabled: capabilities.exec_enabled,
                jobs_pending_max: capabilities.jobs_pending_max as u64,
            }),
        }
    }
}

impl From<WorkAssignment> for scheduler::WorkAssignment {
    fn from(assignment: WorkAssignment) -> Self {
        Self {
            operation_name: assignment.operation_name.to_string(),
            instance_name: assignment.instance_name,
            action_digest: Some(execution::Digest::from(&assignment.action_digest)),
            digest_function: execution::DigestFunction::from(
                assignment.action_digest.function(),
            )
            .into(),
            platform: Some(execution::Platform::from(&assignment.platform)),
            version: assignment.version,
        }
    }
}
