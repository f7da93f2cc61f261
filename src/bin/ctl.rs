//! `objectfs-ctl`: a small debug CLI for poking at the configured bucket
//! directly through the transport layer, independent of any mounted file
//! system — useful for sanity-checking credentials and connectivity.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use objectfs::config::{CliArgs, Config};
use objectfs::credentials::{CredentialsProvider, EnvCredentialsProvider, SigV4Signer};
use objectfs::transport::{ObjectStoreClient, ReqwestObjectStoreClient};

#[derive(Parser)]
#[command(name = "objectfs-ctl", about = "Inspect an objectfs-backed bucket")]
struct Cli {
    #[command(flatten)]
    connection: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// HEAD a single key and print its curated headers.
    Head { key: String },
    /// List keys under a prefix, one per line.
    List {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(long)]
        delimiter: Option<String>,
    },
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let cfg = match Config::from_cli(cli.connection) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let credentials: Arc<dyn CredentialsProvider> = Arc::new(EnvCredentialsProvider);
    let signer = Arc::new(SigV4Signer::default());
    let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
    let client = match ReqwestObjectStoreClient::new(&cfg, region, credentials, signer) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to build client: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Head { key } => run_head(&client, &key),
        Command::List { prefix, delimiter } => run_list(&client, &prefix, delimiter.as_deref()),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run_head(client: &ReqwestObjectStoreClient, key: &str) -> objectfs::Result<()> {
    let head = client.head(key)?;
    for (name, value) in head.headers.iter() {
        println!("{name}: {value}");
    }
    Ok(())
}

fn run_list(client: &ReqwestObjectStoreClient, prefix: &str, delimiter: Option<&str>) -> objectfs::Result<()> {
    let mut token = None;
    loop {
        let page = client.list_objects_v2(prefix, delimiter, token.as_deref())?;
        for entry in &page.keys {
            println!("{}\t{}\t{}", entry.key, entry.size, entry.etag);
        }
        for common in &page.common_prefixes {
            println!("{common}/");
        }
        if page.is_truncated {
            token = page.next_continuation_token;
        } else {
            break;
        }
    }
    Ok(())
}
