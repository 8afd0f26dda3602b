use buildqueue::{OperationWatcher, WatchEvent};
use buildqueue_tonic_core::{Error, proto::execution::Operation};
use core::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Forwards every update of `watcher` to `resp_tx` until the terminal update
/// has been sent.
///
/// Each wait on the watcher is bounded by `watch_timeout`; a timeout sends
/// nothing and only re-checks the client. The stream ends early when:
///
/// - the client disconnects (`resp_tx` closes), returning
///   [`Error::RequestCancelled`]. The operation itself keeps running.
/// - `shutdown` is cancelled, in which case the client receives
///   `UNAVAILABLE` and [`Error::ServiceShutdown`] is returned.
///
/// With `cached` set, the terminal response is marked as a reused result.
pub async fn forward_updates(
    mut watcher: OperationWatcher,
    resp_tx: mpsc::Sender<Result<Operation, Status>>,
    watch_timeout: Duration,
    cached: bool,
    shutdown: CancellationToken,
) -> buildqueue_tonic_core::Result<()> {
    loop {
        let event = tokio::select! {
            event = watcher.next(watch_timeout) => event,
            () = resp_tx.closed() => return Err(Error::RequestCancelled),
            () = shutdown.cancelled() => {
                if let Err(_e) = resp_tx.send(Err(Error::ServiceShutdown.into())).await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Failed to forward shutdown: {}", _e);
                }
                return Err(Error::ServiceShutdown);
            }
        };

        match event {
            WatchEvent::Update(update) => {
                let done = update.is_done();
                let mut operation = Operation::from(update);
                if cached {
                    if let Some(response) = operation.response.as_mut() {
                        response.cached_result = true;
                    }
                }

                if resp_tx.send(Ok(operation)).await.is_err() {
                    return Err(Error::RequestCancelled);
                }
                if done {
                    return Ok(());
                }
            }
            WatchEvent::TimedOut => {
                #[cfg(feature = "tracing")]
                tracing::trace!(operation = %watcher.name(), "No update within watch timeout");
            }
            WatchEvent::Closed => return Ok(()),
        }
    }
}
