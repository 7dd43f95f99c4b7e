//! # lineage-engine: Generational obligation engine.
//!
//! Everything here talks to storage only through the `lineage-core` traits,
//! which are injected as `Arc<dyn …>` handles:
//! - [`InheritanceEngine`]: expands a seed obligation across a descendant
//!   graph, bounded by depth and an on-path cycle guard
//! - [`LedgerReconciler`]: applies payments with optimistic, atomic commits
//! - [`AggregationReader`]: balances, record listings, payment history

pub mod aggregation;
pub mod inheritance;
pub mod reconciler;

pub use aggregation::{AggregationReader, PersonBalance, RunSummary};
pub use inheritance::{
    CancelToken, DistributeOptions, DistributionReport, DistributionWarning, HaltReason,
    InheritanceEngine,
};
pub use reconciler::{settle, AppliedLeg, LedgerReconciler, OverpayPolicy, PaymentOutcome, Settlement};
