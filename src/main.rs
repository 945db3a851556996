#![warn(clippy::all)]

mod config;
mod error;
mod filter;
mod http;
mod logger;
mod proxy;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::warn;

use crate::config::Settings;
use crate::filter::DomainFilter;
use crate::logger::AccessLog;
use crate::proxy::Proxy;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the key=value config file.
    #[arg(long, default_value = "config/server.cfg")]
    config: PathBuf,

    /// Listen port; overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Blocklist file; overrides the config file.
    #[arg(long)]
    filter: Option<PathBuf>,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut settings = match Settings::from_file(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(path = %args.config.display(), error = %e, "config not loaded, using defaults");
            Settings::default()
        }
    };
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(filter_path) = args.filter {
        settings.filter_path = filter_path;
    }

    let filter = Arc::new(DomainFilter::new());
    if let Err(e) = filter.load_from_file(&settings.filter_path) {
        warn!(path = %settings.filter_path.display(), error = %e, "filter list not loaded, nothing is blocked");
    }

    let log = AccessLog::spawn(settings.log_path.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    Proxy::new(filter, log, settings.max_connections)
        .run(addr)
        .await
}
