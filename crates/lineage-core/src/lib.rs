//! # lineage-core
//! Foundation types, money arithmetic, and storage traits for the Lineage
//! obligation ledger.

pub mod allocation;
pub mod amount;
pub mod constants;
pub mod error;
pub mod memory;
pub mod traits;
pub mod types;
