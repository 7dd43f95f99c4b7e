//! Ledger composition root.
//!
//! Wires one [`RocksStore`] into the distribution, reconciliation, and
//! aggregation engines, and applies the node's [`EngineConfig`] defaults.
//! The RPC layer talks only to [`Ledger`].

use std::sync::Arc;

use tracing::info;

use lineage_core::error::{DistributionError, LineageError};
use lineage_core::traits::ObligationRepository;
use lineage_core::types::{
    DistributionRun, ObligationKind, ObligationRecord, PaymentEvent, PaymentRecord, PersonId, RunId,
};
use lineage_engine::{
    AggregationReader, CancelToken, DistributionReport, InheritanceEngine, LedgerReconciler,
    OverpayPolicy, PaymentOutcome, PersonBalance, RunSummary,
};

use crate::config::{EngineConfig, NodeConfig};
use crate::storage::RocksStore;

pub struct Ledger {
    store: Arc<RocksStore>,
    engine: InheritanceEngine,
    reconciler: LedgerReconciler,
    reader: AggregationReader,
    config: EngineConfig,
    /// Cancels in-flight distributions on shutdown.
    shutdown: CancelToken,
}

impl Ledger {
    /// Open the store at `config.db_path()` and build a ledger on it.
    pub fn open(config: &NodeConfig) -> Result<Self, LineageError> {
        let store = RocksStore::open(config.db_path())?;
        info!(path = %config.db_path().display(), "ledger store opened");
        Ok(Self::new(Arc::new(store), config.engine.clone()))
    }

    pub fn new(store: Arc<RocksStore>, config: EngineConfig) -> Self {
        let engine = InheritanceEngine::new(store.clone(), store.clone());
        let reconciler = LedgerReconciler::new(store.clone(), store.clone())
            .with_max_attempts(config.max_reconcile_attempts);
        let reader = AggregationReader::new(store.clone());
        Self {
            store,
            engine,
            reconciler,
            reader,
            config,
            shutdown: CancelToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<RocksStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop in-flight distributions between nodes and flush the store.
    pub fn shutdown(&self) -> Result<(), LineageError> {
        self.shutdown.cancel();
        self.store.flush()?;
        Ok(())
    }

    // --- Relationship graph ---

    pub fn add_person(&self, id: PersonId) -> Result<bool, LineageError> {
        Ok(self.store.add_person(id)?)
    }

    pub fn add_edge(&self, parent: PersonId, child: PersonId) -> Result<(), LineageError> {
        Ok(self.store.add_edge(parent, child)?)
    }

    // --- Distribution ---

    pub fn distribute(
        &self,
        root_id: PersonId,
        root_amount: u64,
        kind: ObligationKind,
        max_depth: Option<u32>,
    ) -> Result<DistributionReport, LineageError> {
        let options = self
            .config
            .distribute_options(max_depth)
            .with_cancel(self.shutdown.clone());
        self.engine.distribute(root_id, root_amount, kind, &options)
    }

    pub fn redistribute(
        &self,
        root_id: PersonId,
        root_amount: u64,
        kind: ObligationKind,
        max_depth: Option<u32>,
    ) -> Result<DistributionReport, LineageError> {
        let options = self
            .config
            .distribute_options(max_depth)
            .with_cancel(self.shutdown.clone());
        self.engine.redistribute(root_id, root_amount, kind, &options)
    }

    pub fn void_run(&self, run_id: &RunId) -> Result<DistributionRun, LineageError> {
        self.engine.void_run(run_id)
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<DistributionRun, LineageError> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| DistributionError::RunNotFound(run_id.to_string()).into())
    }

    // --- Reconciliation ---

    /// Apply a payment, falling back to the configured overpay policy.
    pub fn apply_payment(
        &self,
        event: &PaymentEvent,
        policy: Option<OverpayPolicy>,
    ) -> Result<PaymentOutcome, LineageError> {
        self.reconciler
            .apply_payment(event, policy.unwrap_or(self.config.overpay_policy))
    }

    // --- Aggregation ---

    pub fn sum_outstanding(&self, person: PersonId, kind: ObligationKind) -> Result<i128, LineageError> {
        self.reader.sum_outstanding(person, kind)
    }

    pub fn balance(&self, person: PersonId) -> Result<PersonBalance, LineageError> {
        self.reader.balance(person)
    }

    pub fn records_for(
        &self,
        person: PersonId,
        kind: ObligationKind,
        include_voided: bool,
    ) -> Result<Vec<ObligationRecord>, LineageError> {
        self.reader.records_for(person, kind, include_voided)
    }

    pub fn payment_history(&self, person: PersonId) -> Result<Vec<PaymentRecord>, LineageError> {
        self.reader.payment_history(person)
    }

    pub fn run_summary(&self, run_id: &RunId) -> Result<RunSummary, LineageError> {
        self.reader.run_summary(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_engine::HaltReason;

    fn temp_ledger(config: EngineConfig) -> (Ledger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("db")).unwrap();
        (Ledger::new(Arc::new(store), config), dir)
    }

    #[test]
    fn distribute_and_pay_through_the_ledger() {
        let (ledger, _dir) = temp_ledger(EngineConfig::default());
        ledger.add_edge(PersonId(1), PersonId(2)).unwrap();
        ledger.add_edge(PersonId(1), PersonId(3)).unwrap();

        let report = ledger.distribute(PersonId(1), 1_000, ObligationKind::Debt, None).unwrap();
        assert_eq!(report.records.len(), 2);

        let outcome = ledger
            .apply_payment(
                &PaymentEvent {
                    payer_id: PersonId(2),
                    recipient_id: PersonId(1),
                    amount: 700,
                    external_ref: "wire-1".into(),
                    timestamp: Some(1),
                },
                None,
            )
            .unwrap();
        let debit = outcome.debit.unwrap();
        assert_eq!(debit.applied, 500);
        assert_eq!(debit.unapplied, 200);
        assert_eq!(ledger.sum_outstanding(PersonId(2), ObligationKind::Debt).unwrap(), 0);
        assert_eq!(ledger.payment_history(PersonId(2)).unwrap().len(), 1);
    }

    #[test]
    fn configured_policy_is_the_default() {
        let config = EngineConfig {
            overpay_policy: OverpayPolicy::Reject,
            ..EngineConfig::default()
        };
        let (ledger, _dir) = temp_ledger(config);
        ledger.add_edge(PersonId(1), PersonId(2)).unwrap();
        ledger.distribute(PersonId(1), 100, ObligationKind::Debt, None).unwrap();
        let event = PaymentEvent {
            payer_id: PersonId(2),
            recipient_id: PersonId(1),
            amount: 150,
            external_ref: "too-much".into(),
            timestamp: None,
        };
        assert!(ledger.apply_payment(&event, None).is_err());
        assert!(ledger.apply_payment(&event, Some(OverpayPolicy::Allow)).is_ok());
    }

    #[test]
    fn shutdown_cancels_later_distributions() {
        let (ledger, _dir) = temp_ledger(EngineConfig::default());
        ledger.add_edge(PersonId(1), PersonId(2)).unwrap();
        ledger.shutdown().unwrap();
        let report = ledger.distribute(PersonId(1), 100, ObligationKind::Debt, None).unwrap();
        assert_eq!(report.halted, Some(HaltReason::Cancelled));
    }

    #[test]
    fn get_run_reports_missing() {
        let (ledger, _dir) = temp_ledger(EngineConfig::default());
        assert!(matches!(
            ledger.get_run(&RunId([9; 32])),
            Err(LineageError::Distribution(DistributionError::RunNotFound(_)))
        ));
    }
}
