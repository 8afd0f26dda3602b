//! The build queue: action intake, deduplication, admission control and
//! worker dispatch.
//!
//! A single [`BuildQueue`] is shared (behind an `Arc`) by the client-facing
//! execution service and the worker-facing scheduler service. All registry,
//! queue and lease state lives behind one mutex, so queue membership always
//! changes in the same critical section as the stage of the operation it
//! belongs to. Waiting never happens under that mutex: watchers wait on their
//! operation's watch channel and pollers on a shared [`Notify`].

use crate::{
    Digest, DigestFunction, DigestKey, DigestKeyFn, Error, ExecuteResult, ExecutionFailure,
    Operation, OperationName, OperationWatcher, Platform, Report, RequeuePolicy, Result, Stage,
    WorkAssignment, WorkerId, digest_key_with_instance,
    queue::PendingQueue,
    worker::WorkerPool,
};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

/// Tunables of a [`BuildQueue`].
#[derive(Clone, Debug)]
pub struct BuildQueueConfig {
    /// Digest function reported to clients and required of action digests.
    pub digest_function: DigestFunction,
    /// Upper bound on queued operations. Admission beyond it fails.
    pub jobs_pending_max: usize,
    /// Longest a worker poll suspends before returning empty.
    pub poll_timeout: Duration,
    /// A worker that neither polls nor reports for this long loses its
    /// assignment. Must exceed `poll_timeout`.
    pub lease_timeout: Duration,
    /// How long an unwatched finished operation is kept for reattachment and
    /// result reuse.
    pub completed_retention: Duration,
    pub requeue_policy: RequeuePolicy,
    pub key_fn: DigestKeyFn,
}

impl Default for BuildQueueConfig {
    fn default() -> Self {
        Self {
            digest_function: DigestFunction::Sha256,
            jobs_pending_max: 100,
            poll_timeout: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(60),
            completed_retention: Duration::from_secs(60),
            requeue_policy: RequeuePolicy::Front,
            key_fn: digest_key_with_instance,
        }
    }
}

/// What the execution service advertises to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub digest_function: DigestFunction,
    pub jobs_pending_max: usize,
    pub exec_enabled: bool,
}

/// A client's request to run an action.
#[derive(Clone, Debug)]
pub struct ExecuteRequest {
    pub instance_name: String,
    pub action_digest: Digest,
    /// Properties a worker must provide to run the action.
    pub platform: Platform,
    /// Never reuse a retained result; always run the action again unless an
    /// identical one is already queued or executing.
    pub skip_cache_lookup: bool,
}

/// How an [`ExecuteRequest`] was admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A new operation was queued.
    Created,
    /// Attached to an identical operation that is queued or executing.
    Deduplicated,
    /// Attached to a retained, successfully completed identical operation.
    CacheHit,
}

/// An admitted execution: the watcher streams the operation's updates.
#[derive(Debug)]
pub struct Execution {
    pub admission: Admission,
    pub watcher: OperationWatcher,
}

/// Outcome of a worker progress report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    Accepted,
    /// The sequence number was not newer than the last accepted one.
    Stale,
    /// The worker does not hold this operation, e.g. its lease expired.
    NotAssigned,
    /// The operation was cancelled; the worker should stop executing it.
    Cancelled,
}

/// What one lease expiry pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeaseExpiry {
    /// Worker leases that lapsed, idle or not.
    pub expired: usize,
    /// Executing operations put back on the queue.
    pub requeued: usize,
    /// Operations that found no room in the full queue and completed with a
    /// `RESOURCE_EXHAUSTED` failure instead.
    pub displaced: usize,
}

/// Point-in-time counts, for logging and metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub executing: usize,
    pub operations: usize,
    pub workers: usize,
}

struct State {
    operations: HashMap<OperationName, Operation>,
    /// Latest operation per key: live, or finished and still retained.
    keys: HashMap<DigestKey, OperationName>,
    pending: PendingQueue,
    workers: WorkerPool,
    shutdown: bool,
}

/// Shared scheduler state plus the two service contracts operating on it.
pub struct BuildQueue {
    config: BuildQueueConfig,
    state: Mutex<State>,
    work_available: Notify,
}

impl BuildQueue {
    pub fn new(config: BuildQueueConfig) -> Self {
        let state = State {
            operations: HashMap::new(),
            keys: HashMap::new(),
            pending: PendingQueue::new(config.jobs_pending_max),
            workers: WorkerPool::new(config.lease_timeout),
            shutdown: false,
        };

        Self {
            config,
            state: Mutex::new(state),
            work_available: Notify::new(),
        }
    }

    pub fn config(&self) -> &BuildQueueConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            digest_function: self.config.digest_function,
            jobs_pending_max: self.config.jobs_pending_max,
            exec_enabled: true,
        }
    }

    /// Admits an action for execution.
    ///
    /// A queued or executing operation with the same digest key is shared
    /// instead of creating a duplicate. Otherwise a retained successful
    /// result is reused unless `skip_cache_lookup` is set, and failing that a
    /// new operation is queued.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if a new operation would exceed
    ///   `jobs_pending_max`. Nothing is created.
    /// - [`Error::InvalidRequest`] if the digest was not produced with the
    ///   configured digest function.
    /// - [`Error::Shutdown`] after [`BuildQueue::shutdown`].
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(instance = %request.instance_name, digest = %request.action_digest)))]
    pub fn execute(&self, request: ExecuteRequest) -> Result<Execution> {
        if request.action_digest.function() != self.config.digest_function {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "action digest uses {}, this scheduler uses {}",
                    request.action_digest.function(),
                    self.config.digest_function
                ),
            });
        }

        let key = (self.config.key_fn)(&request.instance_name, &request.action_digest);
        let now = Instant::now();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutdown {
            return Err(Error::Shutdown);
        }

        let expiry = state.expire_leases(now, self.config.requeue_policy);
        state.evict_finished(now, self.config.completed_retention);

        if let Some(execution) = state.attach(&key, request.skip_cache_lookup) {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                operation = %execution.watcher.name(),
                admission = ?execution.admission,
                "Attached to existing operation"
            );
            drop(guard);
            if expiry.requeued > 0 {
                self.work_available.notify_waiters();
            }
            return Ok(execution);
        }

        let name = OperationName::generate();
        if let Err(e) = state.pending.push_back(name.clone()) {
            #[cfg(feature = "tracing")]
            tracing::debug!("Rejected execution: {e}");
            drop(guard);
            if expiry.requeued > 0 {
                self.work_available.notify_waiters();
            }
            return Err(e);
        }

        let operation = Operation::new(
            name.clone(),
            key.clone(),
            request.instance_name,
            request.action_digest,
            request.platform,
        );
        let watcher = operation.watch();
        state.keys.insert(key, name.clone());
        state.operations.insert(name, operation);
        drop(guard);

        #[cfg(feature = "tracing")]
        tracing::debug!(operation = %watcher.name(), "Queued new operation");

        self.work_available.notify_waiters();
        Ok(Execution {
            admission: Admission::Created,
            watcher,
        })
    }

    /// Reattaches to an operation by name, replaying its latest update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationNotFound`] for unknown or evicted names.
    pub fn wait_execution(&self, name: &OperationName) -> Result<OperationWatcher> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        guard.evict_finished(now, self.config.completed_retention);
        guard
            .operations
            .get(name)
            .map(Operation::watch)
            .ok_or_else(|| Error::OperationNotFound {
                name: name.to_string(),
            })
    }

    /// Cancels an operation that at most one client is watching.
    ///
    /// A queued operation leaves the queue; an executing one is released
    /// from its worker, which learns about it on its next report.
    ///
    /// # Errors
    ///
    /// - [`Error::OperationNotFound`] for unknown or evicted names.
    /// - [`Error::OperationFinished`] if it already completed or was
    ///   cancelled.
    /// - [`Error::OperationShared`] if more than one client watches it.
    pub fn cancel(&self, name: &OperationName) -> Result<()> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let operation = state
            .operations
            .get_mut(name)
            .ok_or_else(|| Error::OperationNotFound {
                name: name.to_string(),
            })?;

        if operation.stage.is_terminal() {
            return Err(Error::OperationFinished {
                name: name.to_string(),
            });
        }

        let watchers = operation.watchers();
        if watchers > 1 {
            return Err(Error::OperationShared {
                name: name.to_string(),
                watchers,
            });
        }

        match operation.stage {
            Stage::Queued => {
                state.pending.remove(name);
            }
            Stage::Executing => {
                if let Some(lease) = operation
                    .assigned_worker
                    .as_ref()
                    .and_then(|worker| state.workers.get_mut(worker))
                {
                    lease.assignment = None;
                }
            }
            Stage::Completed | Stage::Cancelled => {}
        }

        operation.cancel(now);
        if state.keys.get(&operation.key) == Some(name) {
            state.keys.remove(&operation.key);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(operation = %name, "Cancelled operation");

        Ok(())
    }

    /// Long-polls for work on behalf of a worker.
    ///
    /// Registers or refreshes the worker's lease. A worker that still holds
    /// an executing assignment gets the same assignment back. Otherwise the
    /// oldest queued operation whose platform the worker satisfies moves to
    /// executing and is returned. Suspends for at most `poll_timeout`, then
    /// returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for an empty worker id.
    /// - [`Error::Shutdown`] once the queue is shut down.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(worker = %worker_id)))]
    pub async fn poll_for_work(
        &self,
        worker_id: WorkerId,
        platform: Platform,
    ) -> Result<Option<WorkAssignment>> {
        if worker_id.as_str().is_empty() {
            return Err(Error::InvalidRequest {
                reason: "worker id must not be empty".to_string(),
            });
        }

        let deadline = Instant::now() + self.config.poll_timeout;

        loop {
            // Register interest before inspecting the queue so an enqueue
            // between the check and the wait is not missed.
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (assignment, expiry) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.shutdown {
                    return Err(Error::Shutdown);
                }

                let now = Instant::now();
                let expiry = state.expire_leases(now, self.config.requeue_policy);
                (state.match_worker(&worker_id, &platform, now), expiry)
            };

            if expiry.requeued > 0 {
                self.work_available.notify_waiters();
            }

            if let Some(assignment) = assignment {
                #[cfg(feature = "tracing")]
                tracing::debug!(operation = %assignment.operation_name, "Assigned operation");
                return Ok(Some(assignment));
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Applies a worker's report about the operation it executes.
    ///
    /// Only a report from the assigned worker whose sequence number exceeds
    /// both the version the operation was assigned at and every previously
    /// accepted sequence changes state. Anything else is ignored and
    /// described by the returned outcome, so retried calls are harmless,
    /// including those left over from an earlier assignment.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(worker = %worker_id, operation = %operation_name, sequence = sequence)))]
    pub fn report_progress(
        &self,
        worker_id: &WorkerId,
        operation_name: &OperationName,
        sequence: u64,
        report: Report,
    ) -> ReportOutcome {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let expiry = state.expire_leases(now, self.config.requeue_policy);
        let outcome = state.apply_report(worker_id, operation_name, sequence, report, now);
        drop(guard);

        if expiry.requeued > 0 {
            self.work_available.notify_waiters();
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(?outcome, "Processed report");

        outcome
    }

    /// Revokes lapsed leases, requeueing their executing operations.
    pub fn expire_leases(&self) -> LeaseExpiry {
        let expiry = self
            .state
            .lock()
            .expire_leases(Instant::now(), self.config.requeue_policy);
        if expiry.requeued > 0 {
            self.work_available.notify_waiters();
        }
        expiry
    }

    /// Drops finished operations that nobody watches and whose retention
    /// window has passed. Returns the number evicted.
    pub fn evict_expired(&self) -> usize {
        self.state
            .lock()
            .evict_finished(Instant::now(), self.config.completed_retention)
    }

    pub fn stats(&self) -> QueueStats {
        let guard = self.state.lock();
        QueueStats {
            queued: guard.pending.len(),
            executing: guard
                .operations
                .values()
                .filter(|operation| operation.stage == Stage::Executing)
                .count(),
            operations: guard.operations.len(),
            workers: guard.workers.len(),
        }
    }

    /// Stops admitting executions and releases every suspended poll.
    /// Operations already admitted keep running and reporting.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.work_available.notify_waiters();

        #[cfg(feature = "tracing")]
        tracing::info!("Build queue shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

impl State {
    fn attach(&self, key: &DigestKey, skip_cache_lookup: bool) -> Option<Execution> {
        let operation = self.operations.get(self.keys.get(key)?)?;

        let admission = match operation.stage {
            Stage::Queued | Stage::Executing => Admission::Deduplicated,
            Stage::Completed
                if !skip_cache_lookup
                    && operation
                        .result
                        .as_ref()
                        .is_some_and(ExecuteResult::is_success) =>
            {
                Admission::CacheHit
            }
            Stage::Completed | Stage::Cancelled => return None,
        };

        Some(Execution {
            admission,
            watcher: operation.watch(),
        })
    }

    fn match_worker(
        &mut self,
        worker_id: &WorkerId,
        platform: &Platform,
        now: Instant,
    ) -> Option<WorkAssignment> {
        let lease = self.workers.refresh(worker_id, platform.clone(), now);

        if let Some(current) = lease.assignment.take() {
            if let Some(operation) = self.operations.get(&current) {
                if operation.stage == Stage::Executing
                    && operation.assigned_worker.as_ref() == Some(worker_id)
                {
                    lease.assignment = Some(current);
                    return Some(operation.assignment());
                }
            }
        }

        let operations = &self.operations;
        let name = self.pending.take_first(|name| {
            operations
                .get(name)
                .is_some_and(|operation| operation.platform.is_satisfied_by(platform))
        })?;

        let operation = self.operations.get_mut(&name)?;
        operation.assign(worker_id.clone());
        lease.assignment = Some(name);
        Some(operation.assignment())
    }

    fn apply_report(
        &mut self,
        worker_id: &WorkerId,
        operation_name: &OperationName,
        sequence: u64,
        report: Report,
        now: Instant,
    ) -> ReportOutcome {
        let Some(lease) = self.workers.touch(worker_id, now) else {
            return ReportOutcome::NotAssigned;
        };
        let Some(operation) = self.operations.get_mut(operation_name) else {
            return ReportOutcome::NotAssigned;
        };

        if operation.stage == Stage::Cancelled {
            if lease.assignment.as_ref() == Some(operation_name) {
                lease.assignment = None;
            }
            return ReportOutcome::Cancelled;
        }

        if operation.stage != Stage::Executing
            || operation.assigned_worker.as_ref() != Some(worker_id)
        {
            return ReportOutcome::NotAssigned;
        }

        if sequence <= operation.report_floor {
            return ReportOutcome::Stale;
        }
        operation.report_floor = sequence;

        match report {
            Report::Progress { message } => operation.report_progress(message),
            Report::Completed(result) => {
                operation.complete(result, now);
                lease.assignment = None;
            }
        }

        ReportOutcome::Accepted
    }

    /// Requeues the executing work of lapsed leases. The queue never grows
    /// past its capacity: work that finds no room completes with a
    /// `RESOURCE_EXHAUSTED` failure.
    fn expire_leases(&mut self, now: Instant, policy: RequeuePolicy) -> LeaseExpiry {
        let mut expiry = LeaseExpiry::default();

        for lease in self.workers.drain_expired(now) {
            expiry.expired += 1;
            #[cfg(feature = "tracing")]
            tracing::info!(worker = %lease.id, "Worker lease expired");

            let Some(name) = lease.assignment else {
                continue;
            };
            let Some(operation) = self.operations.get_mut(&name) else {
                continue;
            };
            if operation.stage != Stage::Executing
                || operation.assigned_worker.as_ref() != Some(&lease.id)
            {
                continue;
            }

            let capacity = self.pending.capacity();
            let displaced = self.pending.requeue(name.clone(), policy);
            if displaced.as_ref() == Some(&name) {
                operation.complete(ExecutionFailure::queue_full(capacity).into(), now);
                expiry.displaced += 1;
                #[cfg(feature = "tracing")]
                tracing::warn!(operation = %name, "No room to requeue expired work");
                continue;
            }

            operation.requeue();
            expiry.requeued += 1;

            if let Some(displaced) = displaced {
                if let Some(operation) = self.operations.get_mut(&displaced) {
                    operation.complete(ExecutionFailure::queue_full(capacity).into(), now);
                }
                expiry.displaced += 1;
                #[cfg(feature = "tracing")]
                tracing::warn!(operation = %displaced, "Displaced by requeued work");
            }
        }

        expiry
    }

    fn evict_finished(&mut self, now: Instant, retention: Duration) -> usize {
        let evictable: Vec<OperationName> = self
            .operations
            .values()
            .filter(|operation| {
                operation
                    .finished_at
                    .is_some_and(|finished| finished + retention <= now)
                    && operation.watchers() == 0
            })
            .map(|operation| operation.name.clone())
            .collect();

        for name in &evictable {
            if let Some(operation) = self.operations.remove(name) {
                if self.keys.get(&operation.key) == Some(name) {
                    self.keys.remove(&operation.key);
                }
            }
        }

        evictable.len()
    }
}
