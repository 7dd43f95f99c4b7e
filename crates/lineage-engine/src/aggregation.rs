//! Read-side queries: outstanding sums, per-person balances, history.
//!
//! Sums are `i128` so that many records (including overpaid, negative ones)
//! never overflow. Records of voided runs are excluded from every total.

use std::sync::Arc;

use lineage_core::error::{DistributionError, LineageError};
use lineage_core::traits::ObligationRepository;
use lineage_core::types::{
    DistributionRun, ObligationKind, ObligationRecord, PaymentRecord, PersonId, RunId,
};

/// Net position of one person across both ledger sides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersonBalance {
    pub person_id: PersonId,
    pub debt_outstanding: i128,
    pub credit_outstanding: i128,
    /// `credit_outstanding - debt_outstanding`.
    pub net: i128,
    /// Active records, either side, that are not yet settled.
    pub open_records: usize,
}

/// Totals for one distribution run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub run: DistributionRun,
    pub record_count: usize,
    pub total_inherited: u128,
    pub total_paid: u128,
    pub total_outstanding: i128,
    pub settled_records: usize,
}

pub struct AggregationReader {
    repo: Arc<dyn ObligationRepository>,
}

impl AggregationReader {
    pub fn new(repo: Arc<dyn ObligationRepository>) -> Self {
        Self { repo }
    }

    pub fn sum_outstanding(&self, person: PersonId, kind: ObligationKind) -> Result<i128, LineageError> {
        Ok(self
            .repo
            .active_records_for_person(person, kind)?
            .iter()
            .map(|r| r.amount_outstanding as i128)
            .sum())
    }

    pub fn balance(&self, person: PersonId) -> Result<PersonBalance, LineageError> {
        let debt = self.repo.active_records_for_person(person, ObligationKind::Debt)?;
        let credit = self.repo.active_records_for_person(person, ObligationKind::Credit)?;
        let sum = |records: &[ObligationRecord]| -> i128 {
            records.iter().map(|r| r.amount_outstanding as i128).sum()
        };
        let debt_outstanding = sum(&debt);
        let credit_outstanding = sum(&credit);
        let open_records = debt.iter().chain(credit.iter()).filter(|r| !r.is_settled()).count();
        Ok(PersonBalance {
            person_id: person,
            debt_outstanding,
            credit_outstanding,
            net: credit_outstanding - debt_outstanding,
            open_records,
        })
    }

    /// Records held by `person`; voided runs only when `include_voided`.
    pub fn records_for(
        &self,
        person: PersonId,
        kind: ObligationKind,
        include_voided: bool,
    ) -> Result<Vec<ObligationRecord>, LineageError> {
        let records = if include_voided {
            self.repo.records_for_person(person, kind)?
        } else {
            self.repo.active_records_for_person(person, kind)?
        };
        Ok(records)
    }

    /// Payments where `person` paid or received, newest first.
    pub fn payment_history(&self, person: PersonId) -> Result<Vec<PaymentRecord>, LineageError> {
        Ok(self.repo.payments_for_person(person)?)
    }

    pub fn run_summary(&self, run_id: &RunId) -> Result<RunSummary, LineageError> {
        let run = self
            .repo
            .get_run(run_id)?
            .ok_or_else(|| DistributionError::RunNotFound(run_id.to_string()))?;
        let records = self.repo.records_for_run(run_id)?;
        Ok(RunSummary {
            record_count: records.len(),
            total_inherited: records.iter().map(|r| r.inherited_portion as u128).sum(),
            total_paid: records.iter().map(|r| r.amount_paid as u128).sum(),
            total_outstanding: records.iter().map(|r| r.amount_outstanding as i128).sum(),
            settled_records: records.iter().filter(|r| r.is_settled()).count(),
            run,
        })
    }
}
