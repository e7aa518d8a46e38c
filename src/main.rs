//! channeld daemon binary.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use channeld::{Config, MdServer};

/// Channel-addressed publish/subscribe datagram router.
#[derive(Parser, Debug)]
#[command(name = "channeld", version, about)]
struct Args {
    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address for downstream peers (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Upstream router to connect to (overrides the config file).
    #[arg(long)]
    connect: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Invalid configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if args.bind.is_some() {
        config.messagedirector.bind = args.bind;
    }
    if args.connect.is_some() {
        config.messagedirector.connect = args.connect;
    }
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    if config.messagedirector.bind.is_none() && config.messagedirector.connect.is_none() {
        tracing::warn!("Neither bind nor connect configured; this router has no peers");
    }

    let server = match MdServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            std::process::exit(1);
        }
    };

    let result = server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}
