//! gRPC service implementations over a shared [`BuildQueue`].
//!
//! ## Structure
//!
//! - [`execution`] - `Capabilities` and `Execution` services (clients).
//! - [`scheduler`] - `Scheduler` service (workers).

pub mod execution;
pub mod scheduler;

#[cfg(test)]
mod tests;

use crate::server::{
    config::ServerConfig,
    maintenance::run_maintenance,
    streaming::{InflightStreams, forwarder::forward_updates},
};
use buildqueue::{BuildQueue, OperationWatcher};
use buildqueue_tonic_core::proto::execution::Operation;
use core::pin::Pin;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::Status;

pub type OperationStream = Pin<Box<dyn Stream<Item = Result<Operation, Status>> + Send>>;

/// Front end for clients and workers. Clones share one [`BuildQueue`].
#[derive(Clone)]
pub struct QueueService {
    config: ServerConfig,
    queue: Arc<BuildQueue>,
    inflight: InflightStreams,
    shutdown_token: CancellationToken,
}

impl QueueService {
    /// Creates the service and spawns the maintenance task, which runs until
    /// [`QueueService::shutdown`].
    pub fn new(config: ServerConfig) -> Self {
        let queue = Arc::new(BuildQueue::new(config.queue_config()));
        let shutdown_token = CancellationToken::new();

        tokio::spawn(run_maintenance(
            Arc::clone(&queue),
            config.maintenance_interval,
            shutdown_token.child_token(),
        ));

        Self {
            config,
            queue,
            inflight: InflightStreams::default(),
            shutdown_token,
        }
    }

    /// Streams `watcher`'s updates to the client from a background task.
    fn stream_updates(&self, watcher: OperationWatcher, cached: bool) -> OperationStream {
        let (resp_tx, resp_rx) = mpsc::channel(self.config.stream_buffer_size);
        let guard = self.inflight.enter();
        let watch_timeout = self.config.watch_timeout;
        let shutdown = self.shutdown_token.clone();

        let fut = async move {
            let _guard = guard;
            if let Err(_e) = forward_updates(watcher, resp_tx, watch_timeout, cached, shutdown).await
            {
                #[cfg(feature = "tracing")]
                tracing::debug!("Operation stream ended early: {}", _e);
            }
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            let span = tracing::info_span!("operation_stream");
            fut.instrument(span)
        };

        tokio::spawn(fut);

        Box::pin(ReceiverStream::new(resp_rx))
    }

    /// Graceful shutdown.
    ///
    /// - Rejects new executions and releases waiting pollers.
    /// - Waits up to the configured timeout for in-flight operation streams
    ///   to finish on their own.
    /// - Ends the remaining streams with `UNAVAILABLE` and stops maintenance.
    pub async fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new executions");
        self.queue.shutdown();

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Draining in-flight streams ({} active)",
            self.inflight.get()
        );
        let drained = timeout(self.config.shutdown_timeout, async {
            while self.inflight.get() > 0 {
                sleep(core::time::Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight streams drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} streams still active)",
                    self.inflight.get()
                );
            }
        }

        self.shutdown_token.cancel();

        #[cfg(feature = "tracing")]
        {
            let stats = self.queue.stats();
            tracing::info!(
                queued = stats.queued,
                executing = stats.executing,
                "Queue service shutdown complete"
            );
        }
    }
}
