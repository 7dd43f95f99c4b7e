//! # lineage-node: Ledger node: RocksDB, RPC, composition.
//!
//! Composes the Lineage engines into a running ledger service:
//! - [`storage::RocksStore`]: relationship graph and obligation ledger backed by RocksDB
//! - [`ledger::Ledger`]: distribution, reconciliation, and queries over one store
//! - [`rpc`]: JSON-RPC server for external access
//! - [`config::NodeConfig`]: node configuration

pub mod config;
pub mod ledger;
pub mod rpc;
pub mod storage;

pub use config::NodeConfig;
pub use ledger::Ledger;
pub use rpc::start_rpc_server;
pub use storage::RocksStore;
