#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can access `buildqueue` via
// `buildqueue_tonic_core::buildqueue`
pub use buildqueue;
