// crates/spatial-engine/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use spatial_engine::{config::Config, run_server};
#[cfg(feature = "cli")]
use std::path::PathBuf;

/// Spatial position store with primary/secondary failover.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "spatial-engine", version, about)]
struct Args {
    /// Primary (spatially indexed) database file, overrides PRIMARY_DB_PATH
    #[arg(long)]
    primary: Option<PathBuf>,

    /// Secondary (fallback) database file, overrides SECONDARY_DB_PATH
    #[arg(long)]
    secondary: Option<PathBuf>,

    /// Bind address, overrides API_HOST
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides API_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Log filter used when RUST_LOG is unset, e.g. "info,spatial_engine=trace"
    #[arg(long)]
    log_filter: Option<String>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env()?;

    if let Some(primary) = args.primary {
        cfg.primary_path = primary;
    }
    if let Some(secondary) = args.secondary {
        cfg.secondary_path = secondary;
    }
    if let Some(host) = args.host {
        cfg.api_host = host;
    }
    if let Some(port) = args.port {
        cfg.api_port = port;
    }

    run_server(cfg, args.log_filter.as_deref()).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
