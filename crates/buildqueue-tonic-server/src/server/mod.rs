//! Server-side components of the build queue service.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/env configuration and its validation.
//! - [`service`] - gRPC service implementations over the shared queue.
//! - [`streaming`] - Forwarding of operation updates to response streams.
//! - [`maintenance`] - Periodic lease expiry and eviction.
//! - [`telemetry`] - Logging, tracing and metrics initialization.

pub mod config;
pub mod maintenance;
pub mod service;
pub mod streaming;
pub mod telemetry;
