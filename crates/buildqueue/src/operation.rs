//! Operations and the watchers attached to them.
//!
//! An [`Operation`] is the scheduler's record of one deduplicated action.
//! Every change bumps its version and publishes an [`OperationUpdate`] to a
//! history shared through a [`tokio::sync::watch`] channel. The history keeps
//! every stage transition but only the latest of consecutive progress
//! reports. Each [`OperationWatcher`] walks it by version, so all watchers of
//! one operation observe the same transitions in the same order, and a slow
//! watcher never skips one.

use crate::{Digest, DigestKey, Platform, WorkerId};
use bytes::Bytes;
use core::fmt;
use core::time::Duration;
use ferroid::{base32::Base32UlidExt, id::ULID};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};

/// Unique name of an operation: a Crockford base32 ULID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationName(String);

impl OperationName {
    /// Generates a fresh, time-ordered name.
    pub fn generate() -> Self {
        Self(ULID::now().encode().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OperationName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for OperationName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle stage of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Queued,
    Executing,
    Completed,
    Cancelled,
}

impl Stage {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Outputs of an action that ran to completion (successfully or not).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionResult {
    pub exit_code: i32,
    pub stdout_raw: Bytes,
    pub stderr_raw: Bytes,
}

/// A worker-side failure to execute the action at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub code: i32,
    pub message: String,
}

impl ExecutionFailure {
    /// `google.rpc.Code.RESOURCE_EXHAUSTED`.
    const RESOURCE_EXHAUSTED: i32 = 8;

    /// Admitted work that lost its place when expired work was requeued into
    /// a full queue.
    pub(crate) fn queue_full(capacity: usize) -> Self {
        Self {
            code: Self::RESOURCE_EXHAUSTED,
            message: format!("no room to requeue in a full queue of {capacity}"),
        }
    }
}

/// Final result of an operation as reported by its worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    pub action_result: Option<ActionResult>,
    pub failure: Option<ExecutionFailure>,
}

impl From<ExecutionFailure> for ExecuteResult {
    fn from(failure: ExecutionFailure) -> Self {
        Self {
            action_result: None,
            failure: Some(failure),
        }
    }
}

impl ExecuteResult {
    /// A result is reusable only if the action ran and exited with zero.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
            && self
                .action_result
                .as_ref()
                .is_some_and(|result| result.exit_code == 0)
    }
}

/// A report sent by the worker executing an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Report {
    /// Still running; `message` is fanned out to watchers.
    Progress { message: String },
    /// Finished, with the final result.
    Completed(ExecuteResult),
}

/// Snapshot of an operation published on every transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationUpdate {
    pub name: OperationName,
    pub version: u64,
    pub stage: Stage,
    pub action_digest: Digest,
    pub queued_at: SystemTime,
    pub worker_id: Option<WorkerId>,
    pub progress: Option<String>,
    pub result: Option<ExecuteResult>,
}

impl OperationUpdate {
    pub fn is_done(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Work handed to a worker by the matcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkAssignment {
    pub operation_name: OperationName,
    pub instance_name: String,
    pub action_digest: Digest,
    pub platform: Platform,
    /// Operation version when it was assigned. Reports for this assignment
    /// carry sequence numbers above it.
    pub version: u64,
}

pub(crate) struct Operation {
    pub(crate) name: OperationName,
    pub(crate) key: DigestKey,
    pub(crate) instance_name: String,
    pub(crate) action_digest: Digest,
    pub(crate) platform: Platform,
    pub(crate) stage: Stage,
    pub(crate) version: u64,
    pub(crate) queued_at: SystemTime,
    pub(crate) assigned_worker: Option<WorkerId>,
    pub(crate) assigned_version: u64,
    /// A report is applied only if its sequence number exceeds this. Raised
    /// to the version at every assignment and to every accepted sequence,
    /// never lowered, so reports from an earlier assignment stay stale.
    pub(crate) report_floor: u64,
    pub(crate) progress: Option<String>,
    pub(crate) result: Option<ExecuteResult>,
    pub(crate) finished_at: Option<Instant>,
    updates: watch::Sender<Vec<OperationUpdate>>,
    /// The last history entry is a progress report.
    progress_tail: bool,
}

impl Operation {
    pub(crate) fn new(
        name: OperationName,
        key: DigestKey,
        instance_name: String,
        action_digest: Digest,
        platform: Platform,
    ) -> Self {
        // The initial receiver is dropped so `receiver_count` counts watchers
        // only.
        let (updates, _) = watch::channel(Vec::new());
        let mut operation = Self {
            name,
            key,
            instance_name,
            action_digest,
            platform,
            stage: Stage::Queued,
            version: 0,
            queued_at: SystemTime::now(),
            assigned_worker: None,
            assigned_version: 0,
            report_floor: 0,
            progress: None,
            result: None,
            finished_at: None,
            updates,
            progress_tail: false,
        };
        operation.publish();
        operation
    }

    pub(crate) fn snapshot(&self) -> OperationUpdate {
        OperationUpdate {
            name: self.name.clone(),
            version: self.version,
            stage: self.stage,
            action_digest: self.action_digest.clone(),
            queued_at: self.queued_at,
            worker_id: self.assigned_worker.clone(),
            progress: self.progress.clone(),
            result: self.result.clone(),
        }
    }

    pub(crate) fn assignment(&self) -> WorkAssignment {
        WorkAssignment {
            operation_name: self.name.clone(),
            instance_name: self.instance_name.clone(),
            action_digest: self.action_digest.clone(),
            platform: self.platform.clone(),
            version: self.assigned_version,
        }
    }

    /// Number of attached watchers.
    pub(crate) fn watchers(&self) -> usize {
        self.updates.receiver_count()
    }

    /// Attaches a watcher that first replays the latest update.
    pub(crate) fn watch(&self) -> OperationWatcher {
        let updates = self.updates.subscribe();
        let seen = updates
            .borrow()
            .last()
            .map_or(0, |latest| latest.version - 1);
        OperationWatcher {
            name: self.name.clone(),
            updates,
            seen,
            finished: false,
        }
    }

    pub(crate) fn assign(&mut self, worker_id: WorkerId) {
        self.stage = Stage::Executing;
        self.assigned_worker = Some(worker_id);
        self.progress = None;
        self.publish();
        self.assigned_version = self.version;
        self.report_floor = self.report_floor.max(self.version);
    }

    pub(crate) fn requeue(&mut self) {
        self.stage = Stage::Queued;
        self.assigned_worker = None;
        self.progress = None;
        self.publish();
    }

    pub(crate) fn report_progress(&mut self, message: String) {
        self.progress = Some(message);
        self.push_update(true);
    }

    pub(crate) fn complete(&mut self, result: ExecuteResult, now: Instant) {
        self.stage = Stage::Completed;
        self.result = Some(result);
        self.finished_at = Some(now);
        self.publish();
    }

    pub(crate) fn cancel(&mut self, now: Instant) {
        self.stage = Stage::Cancelled;
        self.assigned_worker = None;
        self.finished_at = Some(now);
        self.publish();
    }

    fn publish(&mut self) {
        self.push_update(false);
    }

    /// A progress report replaces a progress report directly before it.
    /// Watchers that already saw the replaced one find the new one by its
    /// higher version.
    fn push_update(&mut self, progress: bool) {
        self.version += 1;
        let update = self.snapshot();
        let replace_tail = progress && self.progress_tail;
        self.progress_tail = progress;
        self.updates.send_modify(|history| {
            if replace_tail {
                history.pop();
            }
            history.push(update);
        });
    }

    #[cfg(test)]
    pub(crate) fn history_len(&self) -> usize {
        self.updates.borrow().len()
    }
}

/// Result of waiting on an [`OperationWatcher`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// The next transition, in order.
    Update(OperationUpdate),
    /// Nothing happened within the wait bound. The operation is still live.
    TimedOut,
    /// The terminal update was already delivered, or the operation is gone.
    Closed,
}

/// A client's subscription to one operation.
///
/// Dropping the watcher detaches it. Detaching never cancels the operation.
#[derive(Debug)]
pub struct OperationWatcher {
    name: OperationName,
    updates: watch::Receiver<Vec<OperationUpdate>>,
    /// Version of the last update delivered.
    seen: u64,
    finished: bool,
}

impl OperationWatcher {
    pub fn name(&self) -> &OperationName {
        &self.name
    }

    /// Waits up to `wait` for the next update.
    pub async fn next(&mut self, wait: Duration) -> WatchEvent {
        loop {
            if self.finished {
                return WatchEvent::Closed;
            }

            {
                let history = self.updates.borrow_and_update();
                let next = history.partition_point(|update| update.version <= self.seen);
                if let Some(update) = history.get(next) {
                    self.seen = update.version;
                    self.finished = update.is_done();
                    return WatchEvent::Update(update.clone());
                }
            }

            match timeout(wait, self.updates.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return WatchEvent::Closed,
                Err(_) => return WatchEvent::TimedOut,
            }
        }
    }
}
