//! Querygate server binary.
//!
//! Usage:
//!     querygate [OPTIONS]
//!
//! Options:
//!     --config <FILE>     Config file path (default: querygate.json)
//!     --port <PORT>       Override the configured bind port
//!     --verbose           Enable debug logging

use clap::Parser;
use querygate::{GatewayConfig, serve};
use querygate_core::{DriverRegistry, QueryResolver};
use querygate_metadata::SupabaseStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "querygate",
    version,
    about = "Streaming query-execution gateway for heterogeneous analytic backends"
)]
struct Args {
    /// Config file path
    #[arg(long, default_value = "querygate.json")]
    config: PathBuf,

    /// Override the configured bind port
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = match GatewayConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: failed to load {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if config.supabase_url.is_empty() {
        eprintln!("Error: supabase_url is not configured");
        std::process::exit(1);
    }

    // Drivers register at startup; the registry is immutable afterwards.
    let registry = DriverRegistry::builder()
        .register(
            querygate_driver_postgres::BACKEND_KIND,
            querygate_driver_postgres::factory,
        )
        .register(
            querygate_driver_bigquery::BACKEND_KIND,
            querygate_driver_bigquery::factory,
        )
        .register(
            querygate_driver_athena::BACKEND_KIND,
            querygate_driver_athena::factory,
        )
        .build();
    log::info!("[SERVER] Registered backends: {}", registry.kinds().join(", "));

    let store = SupabaseStore::new(&config.supabase_url, &config.supabase_key);
    let resolver = Arc::new(QueryResolver::new(Arc::new(store), Arc::new(registry)));

    let root = CancellationToken::new();
    let signal_token = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[SHUTDOWN] Signal received, cancelling all connections");
            signal_token.cancel();
        }
    });

    let config = Arc::new(config);
    if let Err(e) = serve(config.clone(), resolver, root).await {
        log::error!("[SERVER] Fatal: {}", e);
        std::process::exit(1);
    }

    log::info!("[SHUTDOWN] Shutdown complete");
}
