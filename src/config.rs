//! Layered configuration: compiled-in defaults, overridden by environment
//! variables, overridden by CLI flags.

use std::time::Duration;

use clap::Parser;

use crate::error::{FsError, Result};

/// Minimum S3 part size (5 MiB), enforced at construction.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Maximum S3 part size (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Expiry policy for stat cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireMode {
    /// Entry expires `N` seconds after insertion, regardless of access.
    Fixed,
    /// Every successful `get` refreshes `cache_date`.
    Sliding,
}

impl std::str::FromStr for ExpireMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(ExpireMode::Fixed),
            "sliding" => Ok(ExpireMode::Sliding),
            other => Err(FsError::client_fatal(format!(
                "invalid expire mode '{other}', expected 'fixed' or 'sliding'"
            ))),
        }
    }
}

/// CLI surface. Mirrors [`Config`] field-for-field where a flag makes sense;
/// a handful of fields (derived from the environment, or rarely touched)
/// are config-only.
#[derive(Parser, Debug, Clone)]
#[command(name = "objectfs", about = "Mount an S3-compatible bucket as a FUSE file system")]
pub struct CliArgs {
    /// Bucket name to mount.
    #[arg(long, env = "OBJECTFS_BUCKET")]
    pub bucket: String,

    /// Mount point on the local file system.
    #[arg(long)]
    pub mountpoint: String,

    /// Object-store endpoint, e.g. https://s3.us-east-1.amazonaws.com
    #[arg(long, env = "OBJECTFS_ENDPOINT")]
    pub endpoint: String,

    /// Multipart part size in bytes (P). Floor is 5 MiB.
    #[arg(long, env = "OBJECTFS_PART_SIZE", default_value_t = 10 * 1024 * 1024)]
    pub part_size: u64,

    /// Simple-PUT vs. multipart threshold in bytes (M).
    #[arg(long, env = "OBJECTFS_MULTIPART_THRESHOLD", default_value_t = 20 * 1024 * 1024)]
    pub multipart_threshold: u64,

    /// Worker pool size (W).
    #[arg(long, env = "OBJECTFS_WORKERS", default_value_t = 20)]
    pub worker_pool_size: usize,

    /// Stat cache capacity (excluding pinned entries).
    #[arg(long, env = "OBJECTFS_STAT_CACHE_SIZE", default_value_t = 100_000)]
    pub stat_cache_size: usize,

    /// Stat cache expiry in seconds.
    #[arg(long, env = "OBJECTFS_STAT_EXPIRE_SECS", default_value_t = 900)]
    pub stat_cache_expire_secs: u64,

    /// "fixed" or "sliding".
    #[arg(long, env = "OBJECTFS_STAT_EXPIRE_MODE", default_value = "fixed")]
    pub stat_cache_expire_mode: String,

    /// Disable caching of negative (not-found) lookups.
    #[arg(long, env = "OBJECTFS_NO_NEGATIVE_CACHE")]
    pub no_negative_cache: bool,

    /// Directory for per-open-file staging files.
    #[arg(long, env = "OBJECTFS_STAGING_DIR", default_value = "/var/tmp/objectfs")]
    pub staging_dir: String,

    /// Maximum retry attempts for a retryable error.
    #[arg(long, env = "OBJECTFS_RETRY_MAX_ATTEMPTS", default_value_t = 5)]
    pub retry_max_attempts: u32,

    /// Initial retry backoff in milliseconds.
    #[arg(long, env = "OBJECTFS_RETRY_INITIAL_MS", default_value_t = 100)]
    pub retry_initial_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds.
    #[arg(long, env = "OBJECTFS_RETRY_MAX_MS", default_value_t = 30_000)]
    pub retry_max_backoff_ms: u64,

    /// Use path-style addressing (bucket in path) instead of virtual-hosted.
    #[arg(long, env = "OBJECTFS_PATH_STYLE")]
    pub path_style: bool,
}

/// Fully resolved, validated configuration injected into every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub bucket: String,
    pub mountpoint: String,
    pub endpoint: String,
    pub part_size: u64,
    pub multipart_threshold: u64,
    pub max_part_size: u64,
    pub worker_pool_size: usize,
    pub stat_cache_size: usize,
    pub stat_cache_expire: Duration,
    pub stat_cache_expire_mode: ExpireMode,
    pub negative_cache_enabled: bool,
    pub staging_dir: String,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub path_style: bool,
}

impl Config {
    /// Builds and validates a `Config` from parsed CLI args (which already
    /// folded in environment variables via `clap`'s `env` attribute).
    pub fn from_cli(args: CliArgs) -> Result<Self> {
        let expire_mode: ExpireMode = args.stat_cache_expire_mode.parse()?;

        let cfg = Config {
            bucket: args.bucket,
            mountpoint: args.mountpoint,
            endpoint: args.endpoint,
            part_size: args.part_size,
            multipart_threshold: args.multipart_threshold,
            max_part_size: MAX_PART_SIZE,
            worker_pool_size: args.worker_pool_size,
            stat_cache_size: args.stat_cache_size,
            stat_cache_expire: Duration::from_secs(args.stat_cache_expire_secs),
            stat_cache_expire_mode: expire_mode,
            negative_cache_enabled: !args.no_negative_cache,
            staging_dir: args.staging_dir,
            retry_max_attempts: args.retry_max_attempts,
            retry_initial_backoff: Duration::from_millis(args.retry_initial_backoff_ms),
            retry_max_backoff: Duration::from_millis(args.retry_max_backoff_ms),
            path_style: args.path_style,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Re-runs the same tunable checks [`Config::from_cli`] applies at
    /// startup. Exposed so integration tests can exercise rejection of an
    /// invalid `Config` built by hand, without going through `CliArgs`.
    pub fn validate_for_test(&self) -> Result<()> {
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.part_size < MIN_PART_SIZE {
            return Err(FsError::client_fatal(format!(
                "part_size {} is below the S3 minimum of {} bytes",
                self.part_size, MIN_PART_SIZE
            )));
        }
        if self.part_size > self.max_part_size {
            return Err(FsError::client_fatal(format!(
                "part_size {} exceeds max_part_size {}",
                self.part_size, self.max_part_size
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(FsError::client_fatal("worker_pool_size must be > 0"));
        }
        if self.multipart_threshold < self.part_size {
            return Err(FsError::client_fatal(
                "multipart_threshold must be >= part_size",
            ));
        }
        Ok(())
    }

    /// Test/embedding convenience: defaults suitable for unit tests, with
    /// the caller free to override individual fields.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            bucket: "test-bucket".into(),
            mountpoint: "/mnt/objectfs-test".into(),
            endpoint: "http://127.0.0.1:9000".into(),
            part_size: MIN_PART_SIZE,
            multipart_threshold: 20 * 1024 * 1024,
            max_part_size: MAX_PART_SIZE,
            worker_pool_size: 4,
            stat_cache_size: 1024,
            stat_cache_expire: Duration::from_secs(900),
            stat_cache_expire_mode: ExpireMode::Fixed,
            negative_cache_enabled: true,
            staging_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            retry_max_attempts: 3,
            retry_initial_backoff: Duration::from_millis(10),
            retry_max_backoff: Duration::from_millis(200),
            path_style: true,
        }
    }
}
