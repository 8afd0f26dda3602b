//! Background housekeeping for the build queue.
//!
//! The queue already expires leases and evicts retained operations lazily
//! whenever it is called. This task keeps doing so while no client or worker
//! talks to the server, so abandoned operations are requeued and memory is
//! released on time.

use crate::server::telemetry::{record_lease_expiry, record_operations_evicted};
use buildqueue::BuildQueue;
use core::time::Duration;
use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Runs until `shutdown` is cancelled, one pass every `period`.
pub async fn run_maintenance(
    queue: Arc<BuildQueue>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let expiry = queue.expire_leases();
        let evicted = queue.evict_expired();
        record_lease_expiry(&expiry);
        record_operations_evicted(evicted as u64);

        #[cfg(feature = "tracing")]
        {
            let stats = queue.stats();
            if expiry.expired > 0 || evicted > 0 {
                tracing::info!(
                    expired = expiry.expired,
                    requeued = expiry.requeued,
                    displaced = expiry.displaced,
                    evicted,
                    queued = stats.queued,
                    executing = stats.executing,
                    operations = stats.operations,
                    workers = stats.workers,
                    "Maintenance pass"
                );
            } else {
                tracing::trace!(?stats, "Maintenance pass");
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("Maintenance task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildqueue::{
        BuildQueueConfig, Digest, DigestFunction, ExecuteRequest, Platform, WorkerId,
    };

    #[tokio::test(start_paused = true)]
    async fn requeues_abandoned_work_without_traffic() {
        let queue = Arc::new(BuildQueue::new(BuildQueueConfig {
            poll_timeout: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(5),
            ..BuildQueueConfig::default()
        }));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_maintenance(
            Arc::clone(&queue),
            Duration::from_millis(500),
            shutdown.clone(),
        ));

        let _execution = queue
            .execute(ExecuteRequest {
                instance_name: String::new(),
                action_digest: Digest::new(DigestFunction::Sha256, "ab".repeat(32), 1).unwrap(),
                platform: Platform::new(),
                skip_cache_lookup: false,
            })
            .unwrap();
        let assignment = queue
            .poll_for_work(WorkerId::from("w1"), Platform::new())
            .await
            .unwrap();
        assert!(assignment.is_some());
        assert_eq!(queue.stats().executing, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;

        let stats = queue.stats();
        assert_eq!(stats.executing, 0);
        assert_eq!(stats.queued, 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
