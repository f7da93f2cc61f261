//! `objectfs-mount`: parses configuration, wires up the cache/transport
//! stack, and mounts the file system via FUSE. Blocks until the mount is
//! torn down (`fusermount -u <mountpoint>` or a signal the kernel turns
//! into an unmount).

use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

use objectfs::config::{CliArgs, Config};
use objectfs::credentials::{CredentialsProvider, EnvCredentialsProvider, SigV4Signer};
use objectfs::fdcache::FdCache;
use objectfs::fs::Filesystem;
use objectfs::fuse_adapter::FuseAdapter;
use objectfs::statcache::StatCache;
use objectfs::transport::{ObjectStoreClient, ReqwestObjectStoreClient};
use objectfs::workerpool::WorkerPool;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() -> std::process::ExitCode {
    init_logging();

    let args = CliArgs::parse();
    let cfg = match Config::from_cli(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    tracing::info!(
        bucket = %cfg.bucket,
        endpoint = %cfg.endpoint,
        mountpoint = %cfg.mountpoint,
        workers = cfg.worker_pool_size,
        "starting objectfs"
    );

    let credentials: Arc<dyn CredentialsProvider> = Arc::new(EnvCredentialsProvider);
    let signer = Arc::new(SigV4Signer::default());
    let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());

    let client: Arc<dyn ObjectStoreClient> =
        match ReqwestObjectStoreClient::new(&cfg, region, credentials, signer) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!(error = %e, "failed to build object-store client");
                return std::process::ExitCode::FAILURE;
            }
        };

    let stat_cache = Arc::new(StatCache::new(&cfg));
    let pool = Arc::new(WorkerPool::new(cfg.worker_pool_size));
    let fd_cache = Arc::new(FdCache::new(client.clone(), stat_cache.clone(), pool.clone(), cfg.clone()));
    let fs = Arc::new(Filesystem::new(client, stat_cache, fd_cache));
    let adapter = FuseAdapter::new(fs);

    let options = vec![
        MountOption::FSName("objectfs".to_string()),
        MountOption::AllowOther,
        MountOption::DefaultPermissions,
    ];

    match fuser::mount2(adapter, &cfg.mountpoint, &options) {
        Ok(()) => {
            tracing::info!(mountpoint = %cfg.mountpoint, "unmounted cleanly");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(mountpoint = %cfg.mountpoint, error = %e, "mount failed");
            std::process::ExitCode::FAILURE
        }
    }
}
