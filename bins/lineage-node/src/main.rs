//! Lineage ledger node binary.
//!
//! Opens the RocksDB ledger, serves the JSON-RPC interface, and flushes the
//! store on Ctrl+C.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use lineage_core::constants::{DEFAULT_MAX_DEPTH, DEFAULT_RECONCILE_ATTEMPTS, DEFAULT_RPC_PORT};
use lineage_engine::OverpayPolicy;
use lineage_node_lib::config::EngineConfig;
use lineage_node_lib::{start_rpc_server, Ledger, NodeConfig};
use tracing::{error, info, warn};

/// Lineage ledger node.
#[derive(Parser, Debug)]
#[command(
    name = "lineage-node",
    version,
    about = "Generational obligation ledger with RocksDB storage and JSON-RPC server"
)]
struct Args {
    /// Data directory for ledger storage
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long, default_value = "127.0.0.1")]
    rpc_bind: String,

    /// RPC server port
    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    rpc_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Deepest generation a distribution writes records for
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: u32,

    /// Nodes a single distribute call may expand before halting
    #[arg(long)]
    step_budget: Option<u64>,

    /// Default overpayment handling: clamp, allow, or reject
    #[arg(long, default_value_t = OverpayPolicy::Clamp)]
    overpay_policy: OverpayPolicy,

    /// Commit attempts before a contended payment is reported
    #[arg(long, default_value_t = DEFAULT_RECONCILE_ATTEMPTS)]
    reconcile_attempts: u32,
}

impl Args {
    /// Convert CLI args into a NodeConfig.
    fn into_config(self) -> (NodeConfig, String) {
        let defaults = NodeConfig::default();
        let config = NodeConfig {
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            rpc_bind: self.rpc_bind,
            rpc_port: self.rpc_port,
            log_level: self.log_level,
            engine: EngineConfig {
                max_depth: self.max_depth,
                step_budget: self.step_budget,
                overpay_policy: self.overpay_policy,
                max_reconcile_attempts: self.reconcile_attempts,
            },
        };
        (config, self.log_format)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (config, log_format) = args.into_config();

    init_logging(&config.log_level, &log_format);

    info!("Lineage Node v{}", env!("CARGO_PKG_VERSION"));
    info!(data_dir = ?config.data_dir, rpc_addr = %config.rpc_addr(), "starting");
    info!(
        max_depth = config.engine.max_depth,
        step_budget = ?config.engine.step_budget,
        overpay_policy = %config.engine.overpay_policy,
        "engine defaults"
    );

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data_dir: {}", e);
        process::exit(1);
    }

    let ledger = match Ledger::open(&config) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            error!("failed to open ledger: {}", e);
            process::exit(1);
        }
    };

    if let Ok(count) = ledger.store().record_count() {
        info!(records = count, "ledger loaded");
    }

    let rpc_handle = match start_rpc_server(&config.rpc_addr(), ledger.clone()).await {
        Ok(handle) => {
            info!("RPC server listening on {}", config.rpc_addr());
            handle
        }
        Err(e) => {
            error!("failed to start RPC server: {}", e);
            process::exit(1);
        }
    };

    info!("Lineage node running (Ctrl+C to stop)");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl+C: {}", e);
    }
    info!("shutdown signal received");

    rpc_handle.stop().ok();
    info!("RPC server stopped");

    if let Err(e) = ledger.shutdown() {
        warn!("ledger flush failed: {}", e);
    }
    info!("Lineage node shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
