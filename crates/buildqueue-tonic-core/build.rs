/// Builds the gRPC client and server code for the execution and scheduler
/// protocols using `tonic-prost-build`.
///
/// # Byte Field Optimization
///
/// The `stdout_raw` and `stderr_raw` fields of `ActionResult` are marked with
/// `.bytes(...)` so they decode into `Bytes` instead of `Vec<u8>`. Results are
/// fanned out to every watcher of an operation, and `Bytes` makes each copy a
/// reference count bump.
///
/// # Files and Paths
///
/// - Proto files: `proto/buildqueue/execution/v1/execution.proto`,
///   `proto/buildqueue/scheduler/v1/scheduler.proto`
/// - Includes: `proto/`
///
/// A file descriptor set is written next to the generated code for gRPC
/// reflection.
///
/// # Panics
///
/// Panics if code generation fails.
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("buildqueue_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([
            ".buildqueue.execution.v1.ActionResult.stdout_raw",
            ".buildqueue.execution.v1.ActionResult.stderr_raw",
        ])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(
            config,
            &[
                "proto/buildqueue/execution/v1/execution.proto",
                "proto/buildqueue/scheduler/v1/scheduler.proto",
            ],
            &["proto"],
        )
        .unwrap();
}
