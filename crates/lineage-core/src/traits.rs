//! Trait interfaces between the engine and its storage.
//!
//! - [`PersonStore`]: read-only relationship graph (external collaborator)
//! - [`ObligationRepository`]: runs, obligation records, and payments
//!
//! Both are injected as `Arc<dyn …>` handles so the engine holds no global
//! connection state. [`crate::memory`] implements them in memory; the ledger
//! node implements them on RocksDB.

use std::collections::HashMap;

use crate::error::StorageError;
use crate::types::{
    DistributionRun, ObligationKind, ObligationRecord, PaymentCommit, PaymentId, PaymentRecord,
    PersonId, RecordKey, RunId,
};

/// Read contract for people and parent→child edges.
pub trait PersonStore: Send + Sync {
    /// Whether the person is known to the store.
    fn person_exists(&self, id: PersonId) -> Result<bool, StorageError>;

    /// Direct children of `id`, in any order and possibly with repeats.
    ///
    /// Unknown ids return an empty list, not an error.
    fn children(&self, id: PersonId) -> Result<Vec<PersonId>, StorageError>;
}

/// Outcome of [`ObligationRepository::claim_run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunClaim {
    /// No active run existed; the candidate was stored.
    Created(DistributionRun),
    /// An active run for the same `(root, kind)` already exists.
    Existing(DistributionRun),
}

/// Storage for distribution runs, obligation records, and payments.
///
/// Implementations must make every multi-row write atomic. Records are
/// never deleted; payments are append-only.
pub trait ObligationRepository: Send + Sync {
    /// Atomically store `candidate` unless an active run already exists for
    /// its `(root, kind)`.
    fn claim_run(&self, candidate: &DistributionRun) -> Result<RunClaim, StorageError>;

    /// Store `run`'s summary counters and status, unless the stored run has
    /// been voided. Atomic with respect to [`void_run`](Self::void_run).
    ///
    /// Returns the run as stored afterwards; a voided run comes back
    /// unchanged and nothing is written.
    fn finish_run(&self, run: &DistributionRun) -> Result<DistributionRun, StorageError>;

    /// Mark a run voided. Returns `None` for an unknown run. Voiding a
    /// voided run writes nothing.
    fn void_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError>;

    fn get_run(&self, run_id: &RunId) -> Result<Option<DistributionRun>, StorageError>;

    /// Every run for `(root, kind)`, oldest first.
    fn runs_for_root(
        &self,
        root_id: PersonId,
        kind: ObligationKind,
    ) -> Result<Vec<DistributionRun>, StorageError>;

    /// The active run for `(root, kind)`, if any.
    fn active_run(
        &self,
        root_id: PersonId,
        kind: ObligationKind,
    ) -> Result<Option<DistributionRun>, StorageError> {
        Ok(self
            .runs_for_root(root_id, kind)?
            .into_iter()
            .rev()
            .find(DistributionRun::is_active))
    }

    /// Insert each record whose key is absent; existing keys are left
    /// untouched. All inserts land in one atomic batch.
    ///
    /// Returns the number of records inserted.
    fn insert_records_if_absent(&self, records: &[ObligationRecord]) -> Result<usize, StorageError>;

    fn get_record(&self, key: &RecordKey) -> Result<Option<ObligationRecord>, StorageError>;

    /// Every record of a run, ordered by key.
    fn records_for_run(&self, run_id: &RunId) -> Result<Vec<ObligationRecord>, StorageError>;

    /// Every record held by `person` on the `kind` side, across all runs
    /// (voided included), ordered by key.
    fn records_for_person(
        &self,
        person: PersonId,
        kind: ObligationKind,
    ) -> Result<Vec<ObligationRecord>, StorageError>;

    /// Records held by `person` whose run is still active.
    fn active_records_for_person(
        &self,
        person: PersonId,
        kind: ObligationKind,
    ) -> Result<Vec<ObligationRecord>, StorageError> {
        let mut run_active: HashMap<RunId, bool> = HashMap::new();
        let mut out = Vec::new();
        for record in self.records_for_person(person, kind)? {
            let active = match run_active.get(&record.run_id) {
                Some(active) => *active,
                None => {
                    let active = self
                        .get_run(&record.run_id)?
                        .is_some_and(|run| run.is_active());
                    run_active.insert(record.run_id, active);
                    active
                }
            };
            if active {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// The active record with the largest positive outstanding balance.
    ///
    /// Ties go to the smallest record key.
    fn largest_outstanding(
        &self,
        person: PersonId,
        kind: ObligationKind,
    ) -> Result<Option<ObligationRecord>, StorageError> {
        Ok(self
            .active_records_for_person(person, kind)?
            .into_iter()
            .filter(|r| r.amount_outstanding > 0)
            .max_by(|a, b| {
                a.amount_outstanding
                    .cmp(&b.amount_outstanding)
                    .then_with(|| b.key().cmp(&a.key()))
            }))
    }

    /// Apply a payment atomically.
    ///
    /// Every [`RecordUpdate`](crate::types::RecordUpdate) is checked against
    /// the stored `amount_paid`, and its run must still be active. Either
    /// mismatch fails the whole commit with [`StorageError::StaleRecord`]
    /// so the caller re-plans. A payment id already on file fails
    /// with [`StorageError::DuplicatePayment`].
    fn commit_payment(&self, commit: &PaymentCommit) -> Result<(), StorageError>;

    fn get_payment(&self, payment_id: &PaymentId) -> Result<Option<PaymentRecord>, StorageError>;

    /// Payments where `person` is payer or recipient, newest first.
    fn payments_for_person(&self, person: PersonId) -> Result<Vec<PaymentRecord>, StorageError>;
}
