#![doc = include_str!("../README.md")]

mod build_queue;
mod digest;
mod error;
mod operation;
mod platform;
mod queue;
mod worker;

pub use crate::build_queue::*;
pub use crate::digest::*;
pub use crate::error::*;
pub use crate::operation::{
    ActionResult, ExecuteResult, ExecutionFailure, OperationName, OperationUpdate,
    OperationWatcher, Report, Stage, WatchEvent, WorkAssignment,
};
pub use crate::platform::*;
pub use crate::queue::RequeuePolicy;
pub use crate::worker::WorkerId;

pub(crate) use crate::operation::Operation;
