//! Error types for the build queue.
//!
//! Only conditions that a caller has to act on are errors. Stale worker
//! reports, incompatible workers and expired leases are ordinary outcomes and
//! never show up here.

/// A result type defaulting to the build queue [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors the build queue can produce.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The pending queue already holds `jobs_pending_max` operations. No
    /// operation was created and the caller owns the retry policy.
    #[error("pending queue is full ({capacity} operations queued)")]
    QueueFull { capacity: usize },

    /// A digest function name that is not one of `sha256`, `sha1` or `md5`.
    #[error("unknown digest function '{name}'")]
    UnknownDigestFunction { name: String },

    /// The digest hash or size does not match its digest function.
    #[error("invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// The request was malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// No operation with this name exists, or it has been evicted.
    #[error("operation '{name}' not found")]
    OperationNotFound { name: String },

    /// Cancellation refused because other clients still watch the operation.
    #[error("operation '{name}' is watched by {watchers} clients and cannot be cancelled")]
    OperationShared { name: String, watchers: usize },

    /// Cancellation refused because the operation already reached a terminal
    /// stage.
    #[error("operation '{name}' has already finished")]
    OperationFinished { name: String },

    /// The queue has been shut down and accepts no new work.
    #[error("build queue is shutting down")]
    Shutdown,
}
