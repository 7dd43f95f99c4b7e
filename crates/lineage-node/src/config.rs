//! Node configuration for the Lineage ledger node.
//!
//! Provides [`NodeConfig`] with defaults for the data directory, RPC
//! binding, and logging, plus the [`EngineConfig`] knobs handed to the
//! distribution and reconciliation engines.

use std::path::PathBuf;

use lineage_core::constants::{DEFAULT_MAX_DEPTH, DEFAULT_RECONCILE_ATTEMPTS, DEFAULT_RPC_PORT};
use lineage_engine::{DistributeOptions, OverpayPolicy};

/// Engine defaults applied when a request does not override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deepest generation that receives records.
    pub max_depth: u32,
    /// Maximum nodes expanded per distribute call; `None` is unbounded.
    pub step_budget: Option<u64>,
    pub overpay_policy: OverpayPolicy,
    /// Commit attempts before a contended payment gives up.
    pub max_reconcile_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            step_budget: None,
            overpay_policy: OverpayPolicy::default(),
            max_reconcile_attempts: DEFAULT_RECONCILE_ATTEMPTS,
        }
    }
}

impl EngineConfig {
    /// Distribution options, with `max_depth` overridden when given.
    pub fn distribute_options(&self, max_depth: Option<u32>) -> DistributeOptions {
        let mut options = DistributeOptions::default().with_max_depth(max_depth.unwrap_or(self.max_depth));
        if let Some(budget) = self.step_budget {
            options = options.with_step_budget(budget);
        }
        options
    }
}

/// Configuration for a ledger node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    /// Port for the JSON-RPC server.
    pub rpc_port: u16,
    /// Log level filter string (e.g. "info", "debug", "lineage_engine=trace").
    pub log_level: String,
    pub engine: EngineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lineage");

        Self {
            data_dir,
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            log_level: "info".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Path to the RocksDB ledger data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledgerdata")
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }
}
