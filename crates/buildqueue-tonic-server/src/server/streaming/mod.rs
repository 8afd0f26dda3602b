//! Fan-out of operation updates to gRPC response streams.
//!
//! - [`forwarder`] - Drives one [`buildqueue::OperationWatcher`] into one
//!   response channel.

pub mod forwarder;

use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of operation streams currently being forwarded. Shutdown waits for
/// it to reach zero.
#[derive(Clone, Debug, Default)]
pub struct InflightStreams(Arc<AtomicUsize>);

impl InflightStreams {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Registers a stream; it stays counted until the guard is dropped.
    pub fn enter(&self) -> InflightGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        crate::server::telemetry::increment_streams_inflight();
        InflightGuard(Arc::clone(&self.0))
    }
}

pub struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
        crate::server::telemetry::decrement_streams_inflight();
    }
}
