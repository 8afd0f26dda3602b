//! Shared protocol types, conversions and the service error.
//!
//! ## Submodules
//!
//! - [`proto`] - Generated messages, clients and servers.
//! - [`convert`] - Mapping between generated messages and core types.
//! - [`error`] - Service error type and its `tonic::Status` mapping.

pub mod convert;
pub mod error;

pub use error::*;

pub mod proto {
    pub mod buildqueue {
        pub mod execution {
            pub mod v1 {
                tonic::include_proto!("buildqueue.execution.v1");
            }
        }
        pub mod scheduler {
            pub mod v1 {
                tonic::include_proto!("buildqueue.scheduler.v1");
            }
        }
    }

    pub use self::buildqueue::execution::v1 as execution;
    pub use self::buildqueue::scheduler::v1 as scheduler;

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("buildqueue_descriptor");
}
