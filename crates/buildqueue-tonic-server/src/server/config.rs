use anyhow::bail;
use buildqueue::{BuildQueueConfig, DigestFunction, RequeuePolicy, digest_key_with_instance};
use clap::{Parser, ValueEnum};
use core::time::Duration;

/// Runtime configuration for the `buildqueue-tonic-server` binary.
///
/// All values are parsed from CLI arguments or environment variables. A
/// `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "buildqueue-tonic-server",
    version,
    about = "A gRPC build queue for remote execution"
)]
pub struct CliArgs {
    /// Maximum number of operations waiting for a worker.
    ///
    /// Executions beyond this bound fail immediately with
    /// `RESOURCE_EXHAUSTED` instead of waiting for room.
    ///
    /// Environment variable: `JOBS_PENDING_MAX`
    #[arg(long, env = "JOBS_PENDING_MAX", default_value_t = 100)]
    pub jobs_pending_max: usize,

    /// Digest function accepted for action digests: `sha256`, `sha1` or
    /// `md5`.
    ///
    /// Environment variable: `EXECUTION_DIGEST_FUNCTION`
    #[arg(long, env = "EXECUTION_DIGEST_FUNCTION", default_value_t = String::from("sha256"))]
    pub execution_digest_function: String,

    /// How long a `PollForWork` call waits for matching work.
    ///
    /// Environment variable: `POLL_TIMEOUT_SECS`
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value_t = 30)]
    pub poll_timeout_secs: u64,

    /// How long a worker may stay silent before its operation is requeued.
    /// Must exceed the poll timeout.
    ///
    /// Environment variable: `LEASE_TIMEOUT_SECS`
    #[arg(long, env = "LEASE_TIMEOUT_SECS", default_value_t = 60)]
    pub lease_timeout_secs: u64,

    /// Interval at which an idle operation stream checks whether its client
    /// is still connected.
    ///
    /// Environment variable: `WATCH_TIMEOUT_SECS`
    #[arg(long, env = "WATCH_TIMEOUT_SECS", default_value_t = 10)]
    pub watch_timeout_secs: u64,

    /// How long a finished, unwatched operation stays available for
    /// `WaitExecution` and result reuse.
    ///
    /// Environment variable: `COMPLETED_RETENTION_SECS`
    #[arg(long, env = "COMPLETED_RETENTION_SECS", default_value_t = 60)]
    pub completed_retention_secs: u64,

    /// Period of the background task that expires leases and evicts
    /// finished operations.
    ///
    /// Environment variable: `MAINTENANCE_INTERVAL_MS`
    #[arg(long, env = "MAINTENANCE_INTERVAL_MS", default_value_t = 1000)]
    pub maintenance_interval_ms: u64,

    /// Where an operation goes when its worker's lease expires.
    ///
    /// Environment variable: `REQUEUE_POLICY`
    #[arg(long, env = "REQUEUE_POLICY", value_enum, default_value_t = RequeuePolicyArg::Front)]
    pub requeue_policy: RequeuePolicyArg,

    /// Capacity of the buffer between an operation watcher and its gRPC
    /// stream.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Seconds to wait for in-flight operation streams to drain on
    /// shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:8981" or "/tmp/buildqueue.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8981"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RequeuePolicyArg {
    Front,
    Back,
}

impl From<RequeuePolicyArg> for RequeuePolicy {
    fn from(arg: RequeuePolicyArg) -> Self {
        match arg {
            RequeuePolicyArg::Front => Self::Front,
            RequeuePolicyArg::Back => Self::Back,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub digest_function: DigestFunction,
    pub jobs_pending_max: usize,
    pub poll_timeout: Duration,
    pub lease_timeout: Duration,
    pub watch_timeout: Duration,
    pub completed_retention: Duration,
    pub maintenance_interval: Duration,
    pub requeue_policy: RequeuePolicy,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub server_addr: String,
    pub uds: bool,
}

impl ServerConfig {
    pub fn queue_config(&self) -> BuildQueueConfig {
        BuildQueueConfig {
            digest_function: self.digest_function,
            jobs_pending_max: self.jobs_pending_max,
            poll_timeout: self.poll_timeout,
            lease_timeout: self.lease_timeout,
            completed_retention: self.completed_retention,
            requeue_policy: self.requeue_policy,
            key_fn: digest_key_with_instance,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let digest_function = args.execution_digest_function.parse::<DigestFunction>()?;

        if args.jobs_pending_max == 0 {
            bail!("JOBS_PENDING_MAX must be greater than 0");
        }

        if args.poll_timeout_secs == 0 {
            bail!("POLL_TIMEOUT_SECS must be greater than 0");
        }

        if args.lease_timeout_secs <= args.poll_timeout_secs {
            bail!(
                "LEASE_TIMEOUT_SECS ({}) must exceed POLL_TIMEOUT_SECS ({})",
                args.lease_timeout_secs,
                args.poll_timeout_secs
            );
        }

        if args.watch_timeout_secs == 0 {
            bail!("WATCH_TIMEOUT_SECS must be greater than 0");
        }

        if args.maintenance_interval_ms == 0 {
            bail!("MAINTENANCE_INTERVAL_MS must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        Ok(Self {
            digest_function,
            jobs_pending_max: args.jobs_pending_max,
            poll_timeout: Duration::from_secs(args.poll_timeout_secs),
            lease_timeout: Duration::from_secs(args.lease_timeout_secs),
            watch_timeout: Duration::from_secs(args.watch_timeout_secs),
            completed_retention: Duration::from_secs(args.completed_retention_secs),
            maintenance_interval: Duration::from_millis(args.maintenance_interval_ms),
            requeue_policy: args.requeue_policy.into(),
            stream_buffer_size: args.stream_buffer_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = core::iter::once("buildqueue-tonic-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.digest_function, DigestFunction::Sha256);
        assert_eq!(config.jobs_pending_max, 100);
        assert_eq!(config.poll_timeout, Duration::from_secs(30));
        assert_eq!(config.lease_timeout, Duration::from_secs(60));
        assert_eq!(config.requeue_policy, RequeuePolicy::Front);
        assert_eq!(config.server_addr, "0.0.0.0:8981");
        assert!(!config.uds);
    }

    #[test]
    fn digest_function_and_policy_flags() {
        let config = parse(&[
            "--execution-digest-function",
            "MD5",
            "--requeue-policy",
            "back",
        ])
        .unwrap();
        assert_eq!(config.digest_function, DigestFunction::Md5);
        assert_eq!(config.queue_config().requeue_policy, RequeuePolicy::Back);
    }

    #[test]
    fn unknown_digest_function_is_fatal() {
        let err = parse(&["--execution-digest-function", "blake3"]).unwrap_err();
        assert!(err.to_string().contains("blake3"));
    }

    #[test]
    fn lease_must_outlive_poll() {
        assert!(parse(&["--poll-timeout-secs", "30", "--lease-timeout-secs", "30"]).is_err());
        assert!(parse(&["--poll-timeout-secs", "5", "--lease-timeout-secs", "6"]).is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(parse(&["--jobs-pending-max", "0"]).is_err());
    }
}
