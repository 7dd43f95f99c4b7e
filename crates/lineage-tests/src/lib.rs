//! Integration test suite for Lineage.
//!
//! Exercises the distribution and reconciliation engines end to end: the
//! reference scenarios, property tests over random relationship graphs,
//! and concurrent payment application against both storage backends.

pub mod helpers;
