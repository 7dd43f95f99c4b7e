//! In-memory implementations of the storage traits.
//!
//! [`MemoryPersonStore`] and [`MemoryObligationStore`] back unit tests and
//! the engine benches; the ledger node uses RocksDB. Each store keeps its
//! state behind a single lock, so every trait call is atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::error::StorageError;
use crate::traits::{ObligationRepository, PersonStore, RunClaim};
use crate::types::{
    DistributionRun, ObligationKind, ObligationRecord, PathId, PaymentCommit, PaymentId,
    PaymentRecord, PersonId, RecordKey, RunId, RunStatus,
};

/// Relationship graph held in memory.
#[derive(Debug, Default)]
pub struct MemoryPersonStore {
    inner: RwLock<PersonGraph>,
}

#[derive(Debug, Default)]
struct PersonGraph {
    people: HashSet<PersonId>,
    /// parent → children, in insertion order, repeats allowed.
    edges: HashMap<PersonId, Vec<PersonId>>,
}

impl MemoryPersonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a person. Returns `false` if already known.
    pub fn add_person(&self, id: PersonId) -> bool {
        self.inner.write().people.insert(id)
    }

    /// Add a parent→child edge, registering both ends.
    ///
    /// Repeated edges are kept; the engine collapses them.
    pub fn add_edge(&self, parent: PersonId, child: PersonId) {
        let mut graph = self.inner.write();
        graph.people.insert(parent);
        graph.people.insert(child);
        graph.edges.entry(parent).or_default().push(child);
    }

    pub fn person_count(&self) -> usize {
        self.inner.read().people.len()
    }
}

impl PersonStore for MemoryPersonStore {
    fn person_exists(&self, id: PersonId) -> Result<bool, StorageError> {
        Ok(self.inner.read().people.contains(&id))
    }

    fn children(&self, id: PersonId) -> Result<Vec<PersonId>, StorageError> {
        Ok(self.inner.read().edges.get(&id).cloned().unwrap_or_default())
    }
}

/// Runs, records, and payments held in memory.
#[derive(Debug, Default)]
pub struct MemoryObligationStore {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    runs: HashMap<RunId, DistributionRun>,
    /// (root, kind) → run ids, oldest first.
    root_runs: HashMap<(PersonId, ObligationKind), Vec<RunId>>,
    records: BTreeMap<RecordKey, ObligationRecord>,
    /// (descendant, kind) → record keys.
    person_records: HashMap<(PersonId, ObligationKind), BTreeSet<RecordKey>>,
    payments: HashMap<PaymentId, PaymentRecord>,
    /// person → payment ids in commit order.
    person_payments: HashMap<PersonId, Vec<PaymentId>>,
}

impl MemoryObligationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn payment_count(&self) -> usize {
        self.state.lock().payments.len()
    }
}

impl ObligationRepository for MemoryObligationStore {
    fn claim_run(&self, candidate: &DistributionRun) -> Result<RunClaim, StorageError> {
        let mut state = self.state.lock();
        let slot = (candidate.root_id, candidate.kind);
        if let Some(ids) = state.root_runs.get(&slot) {
            for id in ids.iter().rev() {
                if let Some(run) = state.runs.get(id).filter(|r| r.is_active()) {
                    return Ok(RunClaim::Existing(run.clone()));
                }
            }
        }
        state.runs.insert(candidate.run_id, candidate.clone());
        state.root_runs.entry(slot).or_default().push(candidate.run_id);
        Ok(RunClaim::Created(candidate.clone()))
    }

    fn finish_run(&self, run: &DistributionRun) -> Result<DistributionRun, StorageError> {
        let mut state = self.state.lock();
        let stored = state
            .runs
            .get_mut(&run.run_id)
            .ok_or_else(|| StorageError::RecordNotFound(format!("run {}", run.run_id)))?;
        if stored.status != RunStatus::Voided {
            stored.finish_from(run);
        }
        Ok(stored.clone())
    }

    fn void_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError> {
        let mut state = self.state.lock();
        Ok(state.runs.get_mut(run_id).map(|stored| {
            stored.status = RunStatus::Voided;
            stored.clone()
        }))
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError> {
        Ok(self.state.lock().runs.get(run_id).cloned())
    }

    fn runs_for_root(
        &self,
        root_id: PersonId,
        kind: ObligationKind,
    ) -> Result<Vec<DistributionRun>, StorageError> {
        let state = self.state.lock();
        Ok(state
            .root_runs
            .get(&(root_id, kind))
            .map(|ids| ids.iter().filter_map(|id| state.runs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn insert_records_if_absent(&self, records: &[ObligationRecord]) -> Result<usize, StorageError> {
        let mut state = self.state.lock();
        let mut inserted = 0;
        for record in records {
            let key = record.key();
            if state.records.contains_key(&key) {
                continue;
            }
            state.records.insert(key, record.clone());
            state
                .person_records
                .entry((record.descendant_id, record.kind))
                .or_default()
                .insert(key);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn get_record(&self, key: &RecordKey) -> Result<Option<ObligationRecord>, StorageError> {
        Ok(self.state.lock().records.get(key).cloned())
    }

    fn records_for_run(&self, run_id: &RunId) -> Result<Vec<ObligationRecord>, StorageError> {
        let state = self.state.lock();
        let start = RecordKey {
            run_id: *run_id,
            generation: 0,
            parent_id: PersonId(0),
            descendant_id: PersonId(0),
            path_id: PathId::default(),
        };
        Ok(state
            .records
            .range(start..)
            .take_while(|(k, _)| k.run_id == *run_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn records_for_person(
        &self,
        person: PersonId,
        kind: ObligationKind,
    ) -> Result<Vec<ObligationRecord>, StorageError> {
        let state = self.state.lock();
        Ok(state
            .person_records
            .get(&(person, kind))
            .map(|keys| keys.iter().filter_map(|k| state.records.get(k).cloned()).collect())
            .unwrap_or_default())
    }

    fn commit_payment(&self, commit: &PaymentCommit) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let payment = &commit.payment;
        if state.payments.contains_key(&payment.payment_id) {
            return Err(StorageError::DuplicatePayment(payment.external_ref.clone()));
        }

        // Check every precondition before touching anything.
        for update in &commit.updates {
            let stored = state
                .records
                .get(&update.key)
                .ok_or_else(|| StorageError::RecordNotFound(update.key.to_string()))?;
            let run_active = state
                .runs
                .get(&update.key.run_id)
                .is_some_and(DistributionRun::is_active);
            if stored.amount_paid != update.expected_paid || !run_active {
                return Err(StorageError::StaleRecord(update.key.to_string()));
            }
        }

        for update in &commit.updates {
            if let Some(record) = state.records.get_mut(&update.key) {
                record.amount_paid = update.amount_paid;
                record.amount_outstanding = update.amount_outstanding;
            }
        }
        state.payments.insert(payment.payment_id, payment.clone());
        state
            .person_payments
            .entry(payment.payer_id)
            .or_default()
            .push(payment.payment_id);
        if payment.recipient_id != payment.payer_id {
            state
                .person_payments
                .entry(payment.recipient_id)
                .or_default()
                .push(payment.payment_id);
        }
        Ok(())
    }

    fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<PaymentRecord>, StorageError> {
        Ok(self.state.lock().payments.get(payment_id).cloned())
    }

    fn payments_for_person(&self, person: PersonId) -> Result<Vec<PaymentRecord>, StorageError> {
        let state = self.state.lock();
        let mut payments: Vec<PaymentRecord> = state
            .person_payments
            .get(&person)
            .map(|ids| ids.iter().filter_map(|id| state.payments.get(id).cloned()).collect())
            .unwrap_or_default();
        // Stable sort keeps commit order among equal timestamps.
        payments.reverse();
        payments.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordUpdate;

    fn run(root: u64, amount: u64, seq: u32) -> DistributionRun {
        DistributionRun::new(PersonId(root), ObligationKind::Debt, amount, 10, seq)
    }

    fn record(run: &DistributionRun, parent: u64, child: u64, generation: u32, portion: u64) -> ObligationRecord {
        let key = RecordKey {
            run_id: run.run_id,
            generation,
            parent_id: PersonId(parent),
            descendant_id: PersonId(child),
            path_id: PathId::root(run.root_id).extend(PersonId(parent)).extend(PersonId(child)),
        };
        ObligationRecord::new(key, run.kind, run.root_id, portion * 2, portion, 2)
    }

    fn payment(reference: &str, payer: u64, timestamp: i64) -> PaymentRecord {
        PaymentRecord {
            payment_id: PaymentId::from_external_ref(reference),
            amount: 10,
            payer_id: PersonId(payer),
            recipient_id: PersonId(99),
            debt_record: None,
            credit_record: None,
            debt_applied: 0,
            credit_applied: 0,
            external_ref: reference.to_string(),
            timestamp,
        }
    }

    // ------------------------------------------------------------------
    // Person store
    // ------------------------------------------------------------------

    #[test]
    fn person_store_edges_and_unknown_ids() {
        let store = MemoryPersonStore::new();
        store.add_edge(PersonId(1), PersonId(2));
        store.add_edge(PersonId(1), PersonId(2));
        assert!(store.person_exists(PersonId(2)).unwrap());
        assert!(!store.person_exists(PersonId(3)).unwrap());
        assert_eq!(store.children(PersonId(1)).unwrap(), vec![PersonId(2), PersonId(2)]);
        assert!(store.children(PersonId(42)).unwrap().is_empty());
        assert_eq!(store.person_count(), 2);
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    #[test]
    fn claim_run_refuses_second_active_run() {
        let store = MemoryObligationStore::new();
        let first = run(1, 100, 0);
        assert_eq!(store.claim_run(&first).unwrap(), RunClaim::Created(first.clone()));
        let second = run(1, 200, 0);
        assert_eq!(store.claim_run(&second).unwrap(), RunClaim::Existing(first.clone()));

        assert_eq!(store.void_run(&first.run_id).unwrap().unwrap().status, RunStatus::Voided);
        let third = run(1, 200, 1);
        assert_eq!(store.claim_run(&third).unwrap(), RunClaim::Created(third.clone()));
        assert_eq!(store.runs_for_root(PersonId(1), ObligationKind::Debt).unwrap().len(), 2);
        assert_eq!(
            store.active_run(PersonId(1), ObligationKind::Debt).unwrap(),
            Some(third)
        );
    }

    #[test]
    fn finish_or_void_unknown_run() {
        let store = MemoryObligationStore::new();
        assert!(matches!(
            store.finish_run(&run(1, 1, 0)),
            Err(StorageError::RecordNotFound(_))
        ));
        assert_eq!(store.void_run(&run(1, 1, 0).run_id).unwrap(), None);
    }

    #[test]
    fn finish_run_never_revives_a_voided_run() {
        let store = MemoryObligationStore::new();
        let claimed = run(1, 100, 0);
        store.claim_run(&claimed).unwrap();
        store.void_run(&claimed.run_id).unwrap();

        let mut done = claimed.clone();
        done.status = RunStatus::Complete;
        done.record_count = 4;
        let stored = store.finish_run(&done).unwrap();
        assert_eq!(stored.status, RunStatus::Voided);
        assert_eq!(stored.record_count, 0);
        assert!(store.active_run(PersonId(1), ObligationKind::Debt).unwrap().is_none());
    }

    #[test]
    fn finish_run_stores_counters() {
        let store = MemoryObligationStore::new();
        let claimed = run(1, 100, 0);
        store.claim_run(&claimed).unwrap();

        let mut done = claimed.clone();
        done.status = RunStatus::Complete;
        done.record_count = 3;
        done.unresolved_total = 25;
        done.cycle_count = 1;
        assert_eq!(store.finish_run(&done).unwrap(), done);
        assert_eq!(store.get_run(&claimed.run_id).unwrap(), Some(done));
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    #[test]
    fn insert_if_absent_is_idempotent() {
        let store = MemoryObligationStore::new();
        let r = run(1, 100, 0);
        store.claim_run(&r).unwrap();
        let batch = vec![record(&r, 1, 2, 1, 50), record(&r, 1, 3, 1, 50)];
        assert_eq!(store.insert_records_if_absent(&batch).unwrap(), 2);
        assert_eq!(store.insert_records_if_absent(&batch).unwrap(), 0);
        assert_eq!(store.record_count(), 2);
        assert_eq!(store.records_for_run(&r.run_id).unwrap().len(), 2);
    }

    #[test]
    fn records_for_run_does_not_bleed_into_other_runs() {
        let store = MemoryObligationStore::new();
        let a = run(1, 100, 0);
        let b = run(5, 100, 0);
        store.claim_run(&a).unwrap();
        store.claim_run(&b).unwrap();
        store
            .insert_records_if_absent(&[record(&a, 1, 2, 1, 50), record(&b, 5, 6, 1, 50)])
            .unwrap();
        let only_a = store.records_for_run(&a.run_id).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].descendant_id, PersonId(2));
    }

    #[test]
    fn largest_outstanding_skips_voided_runs_and_breaks_ties_on_key() {
        let store = MemoryObligationStore::new();
        let live = run(1, 100, 0);
        store.claim_run(&live).unwrap();
        let dead = run(7, 900, 0);
        store.claim_run(&dead).unwrap();
        store
            .insert_records_if_absent(&[
                record(&live, 1, 2, 1, 40),
                record(&live, 3, 2, 2, 40),
                record(&dead, 7, 2, 1, 900),
            ])
            .unwrap();
        store.void_run(&dead.run_id).unwrap();

        let best = store
            .largest_outstanding(PersonId(2), ObligationKind::Debt)
            .unwrap()
            .unwrap();
        assert_eq!(best.run_id, live.run_id);
        assert_eq!(best.generation, 1);
        assert_eq!(store.records_for_person(PersonId(2), ObligationKind::Debt).unwrap().len(), 3);
        assert!(store.largest_outstanding(PersonId(2), ObligationKind::Credit).unwrap().is_none());
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    #[test]
    fn commit_applies_updates_and_rejects_stale_or_duplicate() {
        let store = MemoryObligationStore::new();
        let r = run(1, 100, 0);
        store.claim_run(&r).unwrap();
        let rec = record(&r, 1, 2, 1, 50);
        store.insert_records_if_absent(std::slice::from_ref(&rec)).unwrap();

        let update = RecordUpdate {
            key: rec.key(),
            expected_paid: 0,
            amount_paid: 10,
            amount_outstanding: 40,
        };
        let commit = PaymentCommit {
            payment: payment("tx-1", 2, 1_000),
            updates: vec![update.clone()],
        };
        store.commit_payment(&commit).unwrap();
        assert_eq!(store.get_record(&rec.key()).unwrap().unwrap().amount_outstanding, 40);

        assert!(matches!(
            store.commit_payment(&commit),
            Err(StorageError::DuplicatePayment(_))
        ));

        let stale = PaymentCommit {
            payment: payment("tx-2", 2, 2_000),
            updates: vec![update],
        };
        assert!(matches!(store.commit_payment(&stale), Err(StorageError::StaleRecord(_))));
        assert_eq!(store.payment_count(), 1);
        assert_eq!(store.get_record(&rec.key()).unwrap().unwrap().amount_paid, 10);
    }

    #[test]
    fn commit_against_voided_run_is_stale() {
        let store = MemoryObligationStore::new();
        let r = run(1, 100, 0);
        store.claim_run(&r).unwrap();
        let rec = record(&r, 1, 2, 1, 50);
        store.insert_records_if_absent(std::slice::from_ref(&rec)).unwrap();
        store.void_run(&r.run_id).unwrap();

        let commit = PaymentCommit {
            payment: payment("tx-late", 2, 1_000),
            updates: vec![RecordUpdate {
                key: rec.key(),
                expected_paid: 0,
                amount_paid: 10,
                amount_outstanding: 40,
            }],
        };
        assert!(matches!(store.commit_payment(&commit), Err(StorageError::StaleRecord(_))));
        assert_eq!(store.payment_count(), 0);
        assert_eq!(store.get_record(&rec.key()).unwrap().unwrap().amount_paid, 0);
    }

    #[test]
    fn payment_history_is_newest_first() {
        let store = MemoryObligationStore::new();
        for (i, ts) in [(0, 5_000), (1, 1_000), (2, 9_000)] {
            store
                .commit_payment(&PaymentCommit {
                    payment: payment(&format!("tx-{i}"), 3, ts),
                    updates: vec![],
                })
                .unwrap();
        }
        let history = store.payments_for_person(PersonId(3)).unwrap();
        let stamps: Vec<i64> = history.iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![9_000, 5_000, 1_000]);
        assert_eq!(store.payments_for_person(PersonId(99)).unwrap().len(), 3);
        assert!(store.payments_for_person(PersonId(4)).unwrap().is_empty());
    }
}
