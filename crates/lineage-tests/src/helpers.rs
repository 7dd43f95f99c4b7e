//! Shared test helpers for scenario and property tests.

use std::sync::Arc;

use lineage_core::constants::MINOR_UNITS_PER_MAJOR;
use lineage_core::memory::{MemoryObligationStore, MemoryPersonStore};
use lineage_core::traits::{ObligationRepository, PersonStore};
use lineage_core::types::{PaymentEvent, PersonId};
use lineage_engine::{AggregationReader, InheritanceEngine, LedgerReconciler};

/// Whole currency units to minor units.
pub fn major(units: u64) -> u64 {
    units * MINOR_UNITS_PER_MAJOR
}

/// Relationship graph from `(parent, child)` pairs.
pub fn graph(edges: &[(u64, u64)]) -> Arc<MemoryPersonStore> {
    let people = Arc::new(MemoryPersonStore::new());
    for &(parent, child) in edges {
        people.add_edge(PersonId(parent), PersonId(child));
    }
    people
}

/// Payment event with an explicit timestamp.
pub fn payment(payer: u64, recipient: u64, amount: u64, external_ref: &str, timestamp: i64) -> PaymentEvent {
    PaymentEvent {
        payer_id: PersonId(payer),
        recipient_id: PersonId(recipient),
        amount,
        external_ref: external_ref.to_string(),
        timestamp: Some(timestamp),
    }
}

/// The three engines wired to one pair of stores.
pub struct Harness {
    pub people: Arc<dyn PersonStore>,
    pub repo: Arc<dyn ObligationRepository>,
    pub engine: InheritanceEngine,
    pub reconciler: LedgerReconciler,
    pub reader: AggregationReader,
}

impl Harness {
    pub fn new(people: Arc<dyn PersonStore>, repo: Arc<dyn ObligationRepository>) -> Self {
        Self {
            engine: InheritanceEngine::new(people.clone(), repo.clone()),
            reconciler: LedgerReconciler::new(people.clone(), repo.clone()),
            reader: AggregationReader::new(repo.clone()),
            people,
            repo,
        }
    }

    /// In-memory harness over the given edges.
    pub fn memory(edges: &[(u64, u64)]) -> Self {
        Self::new(graph(edges), Arc::new(MemoryObligationStore::new()))
    }
}
