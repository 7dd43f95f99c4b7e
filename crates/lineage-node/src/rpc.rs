//! JSON-RPC server for the Lineage ledger node.
//!
//! Uses jsonrpsee 0.24 to expose the engine's operations: graph setup,
//! distribution runs, payment application, and balance queries. Amounts on
//! the wire are integer minor units.

use std::sync::Arc;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use lineage_core::error::{DistributionError, LineageError, ReconcileError, StorageError};
use lineage_core::types::{
    DistributionRun, ObligationKind, ObligationRecord, ObligationStatus, PaymentEvent,
    PaymentRecord, PersonId, RunId, RunStatus,
};
use lineage_engine::{
    AppliedLeg, DistributionReport, DistributionWarning, HaltReason, OverpayPolicy, PaymentOutcome,
    PersonBalance, RunSummary,
};

use crate::ledger::Ledger;

// --- Error codes ---

const RPC_MISC_ERROR: i32 = -1;
const RPC_NOT_FOUND: i32 = -5;
const RPC_INVALID_PARAMETER: i32 = -8;
const RPC_REJECTED: i32 = -25;

/// JSON representation of an obligation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordJson {
    pub run_id: String,
    pub kind: String,
    pub root_id: u64,
    pub descendant_id: u64,
    pub parent_id: u64,
    pub path_id: String,
    pub generation: u32,
    pub amount_at_this_level: u64,
    pub inherited_portion: u64,
    pub sibling_count: u32,
    /// `1 / sibling_count` in parts-per-billion.
    pub sibling_share_ppb: u64,
    pub amount_paid: u64,
    pub amount_outstanding: i64,
    /// "created", "partially_paid", or "settled".
    pub status: String,
}

impl From<&ObligationRecord> for RecordJson {
    fn from(r: &ObligationRecord) -> Self {
        let status = match r.status() {
            ObligationStatus::Created => "created",
            ObligationStatus::PartiallyPaid => "partially_paid",
            ObligationStatus::Settled => "settled",
        };
        Self {
            run_id: r.run_id.to_string(),
            kind: r.kind.to_string(),
            root_id: r.root_id.0,
            descendant_id: r.descendant_id.0,
            parent_id: r.parent_id.0,
            path_id: r.path_id.to_string(),
            generation: r.generation,
            amount_at_this_level: r.amount_at_this_level,
            inherited_portion: r.inherited_portion,
            sibling_count: r.sibling_count,
            sibling_share_ppb: r.sibling_share_ppb,
            amount_paid: r.amount_paid,
            amount_outstanding: r.amount_outstanding,
            status: status.to_string(),
        }
    }
}

/// JSON representation of a distribution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJson {
    pub run_id: String,
    pub root_id: u64,
    pub kind: String,
    pub root_amount: u64,
    pub max_depth: u32,
    pub sequence: u32,
    /// "in_progress", "complete", or "voided".
    pub status: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub record_count: u64,
    pub unresolved_total: u64,
    pub cycle_count: u32,
}

impl From<&DistributionRun> for RunJson {
    fn from(run: &DistributionRun) -> Self {
        let status = match run.status {
            RunStatus::InProgress => "in_progress",
            RunStatus::Complete => "complete",
            RunStatus::Voided => "voided",
        };
        Self {
            run_id: run.run_id.to_string(),
            root_id: run.root_id.0,
            kind: run.kind.to_string(),
            root_amount: run.root_amount,
            max_depth: run.max_depth,
            sequence: run.sequence,
            status: status.to_string(),
            created_at: run.created_at,
            record_count: run.record_count,
            unresolved_total: run.unresolved_total,
            cycle_count: run.cycle_count,
        }
    }
}

/// JSON representation of a distribution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionJson {
    pub run: RunJson,
    pub complete: bool,
    pub inserted: usize,
    pub skipped: usize,
    pub unresolved_total: u64,
    pub halted: Option<HaltReason>,
    pub warnings: Vec<DistributionWarning>,
    pub records: Vec<RecordJson>,
}

impl From<&DistributionReport> for DistributionJson {
    fn from(report: &DistributionReport) -> Self {
        Self {
            run: RunJson::from(&report.run),
            complete: report.is_complete(),
            inserted: report.inserted,
            skipped: report.skipped,
            unresolved_total: report.unresolved_total,
            halted: report.halted,
            warnings: report.warnings.clone(),
            records: report.records.iter().map(RecordJson::from).collect(),
        }
    }
}

/// JSON representation of a stored payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentJson {
    pub payment_id: String,
    pub amount: u64,
    pub payer_id: u64,
    pub recipient_id: u64,
    /// Display form of the matched debt record key.
    pub debt_record: Option<String>,
    pub credit_record: Option<String>,
    pub debt_applied: u64,
    pub credit_applied: u64,
    pub external_ref: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl From<&PaymentRecord> for PaymentJson {
    fn from(p: &PaymentRecord) -> Self {
        Self {
            payment_id: p.payment_id.to_string(),
            amount: p.amount,
            payer_id: p.payer_id.0,
            recipient_id: p.recipient_id.0,
            debt_record: p.debt_record.map(|k| k.to_string()),
            credit_record: p.credit_record.map(|k| k.to_string()),
            debt_applied: p.debt_applied,
            credit_applied: p.credit_applied,
            external_ref: p.external_ref.clone(),
            timestamp: p.timestamp,
        }
    }
}

/// JSON representation of one side of an applied payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegJson {
    pub record: RecordJson,
    pub applied: u64,
    pub unapplied: u64,
    pub overpaid: u64,
}

impl From<&AppliedLeg> for LegJson {
    fn from(leg: &AppliedLeg) -> Self {
        Self {
            record: RecordJson::from(&leg.record),
            applied: leg.applied,
            unapplied: leg.unapplied,
            overpaid: leg.overpaid,
        }
    }
}

/// JSON representation of an applied payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcomeJson {
    pub payment: PaymentJson,
    pub debit: Option<LegJson>,
    pub credit: Option<LegJson>,
}

impl From<&PaymentOutcome> for PaymentOutcomeJson {
    fn from(o: &PaymentOutcome) -> Self {
        Self {
            payment: PaymentJson::from(&o.payment),
            debit: o.debit.as_ref().map(LegJson::from),
            credit: o.credit.as_ref().map(LegJson::from),
        }
    }
}

/// JSON representation of a person's balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceJson {
    pub person_id: u64,
    pub debt_outstanding: i128,
    pub credit_outstanding: i128,
    pub net: i128,
    pub open_records: usize,
}

impl From<&PersonBalance> for BalanceJson {
    fn from(b: &PersonBalance) -> Self {
        Self {
            person_id: b.person_id.0,
            debt_outstanding: b.debt_outstanding,
            credit_outstanding: b.credit_outstanding,
            net: b.net,
            open_records: b.open_records,
        }
    }
}

/// JSON representation of a run and its totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummaryJson {
    pub run: RunJson,
    pub record_count: usize,
    pub total_inherited: u128,
    pub total_paid: u128,
    pub total_outstanding: i128,
    pub settled_records: usize,
}

impl From<&RunSummary> for RunSummaryJson {
    fn from(s: &RunSummary) -> Self {
        Self {
            run: RunJson::from(&s.run),
            record_count: s.record_count,
            total_inherited: s.total_inherited,
            total_paid: s.total_paid,
            total_outstanding: s.total_outstanding,
            settled_records: s.settled_records,
        }
    }
}

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// Map an engine error onto a stable JSON-RPC error code.
pub fn lineage_error(e: LineageError) -> ErrorObjectOwned {
    let code = match &e {
        LineageError::Validation(_) => RPC_INVALID_PARAMETER,
        LineageError::Distribution(DistributionError::RunNotFound(_)) => RPC_NOT_FOUND,
        LineageError::Distribution(_) => RPC_REJECTED,
        LineageError::Reconcile(ReconcileError::ArithmeticOverflow) => RPC_MISC_ERROR,
        LineageError::Reconcile(_) => RPC_REJECTED,
        LineageError::Storage(StorageError::RecordNotFound(_)) => RPC_NOT_FOUND,
        LineageError::Storage(_) => RPC_MISC_ERROR,
    };
    rpc_error(code, &e.to_string())
}

fn parse_kind(kind: &str) -> Result<ObligationKind, ErrorObjectOwned> {
    kind.parse()
        .map_err(|e: lineage_core::error::ValidationError| rpc_error(RPC_INVALID_PARAMETER, &e.to_string()))
}

fn parse_run_id(run_id: &str) -> Result<RunId, ErrorObjectOwned> {
    RunId::from_hex(run_id).map_err(|e| rpc_error(RPC_INVALID_PARAMETER, &e.to_string()))
}

fn parse_policy(policy: Option<String>) -> Result<Option<OverpayPolicy>, ErrorObjectOwned> {
    policy
        .map(|p| p.parse())
        .transpose()
        .map_err(|e: lineage_core::error::ValidationError| rpc_error(RPC_INVALID_PARAMETER, &e.to_string()))
}

/// The Lineage JSON-RPC interface.
#[rpc(server)]
pub trait LineageRpc {
    /// Registers a person. Returns false if already known.
    #[method(name = "addperson")]
    async fn add_person(&self, id: u64) -> Result<bool, ErrorObjectOwned>;

    /// Adds a parent→child edge, registering both people.
    #[method(name = "addedge")]
    async fn add_edge(&self, parent: u64, child: u64) -> Result<(), ErrorObjectOwned>;

    /// Distributes `amount` minor units from `root` down its descendants.
    #[method(name = "distribute")]
    async fn distribute(
        &self,
        root: u64,
        amount: u64,
        kind: String,
        max_depth: Option<u32>,
    ) -> Result<DistributionJson, ErrorObjectOwned>;

    /// Voids the active run for `(root, kind)` and distributes anew.
    #[method(name = "redistribute")]
    async fn redistribute(
        &self,
        root: u64,
        amount: u64,
        kind: String,
        max_depth: Option<u32>,
    ) -> Result<DistributionJson, ErrorObjectOwned>;

    /// Voids a distribution run by id.
    #[method(name = "voidrun")]
    async fn void_run(&self, run_id: String) -> Result<RunJson, ErrorObjectOwned>;

    /// Returns a run with its totals.
    #[method(name = "getrun")]
    async fn get_run(&self, run_id: String) -> Result<RunSummaryJson, ErrorObjectOwned>;

    /// Applies a payment event.
    #[method(name = "applypayment")]
    async fn apply_payment(
        &self,
        payer: u64,
        recipient: u64,
        amount: u64,
        external_ref: String,
        timestamp: Option<i64>,
        policy: Option<String>,
    ) -> Result<PaymentOutcomeJson, ErrorObjectOwned>;

    /// Sum of active outstanding balances, in minor units.
    #[method(name = "getoutstanding")]
    async fn get_outstanding(&self, person: u64, kind: String) -> Result<i128, ErrorObjectOwned>;

    /// Debt, credit, and net position of a person.
    #[method(name = "getbalance")]
    async fn get_balance(&self, person: u64) -> Result<BalanceJson, ErrorObjectOwned>;

    /// Records held by a person on one side of the ledger.
    #[method(name = "getrecords")]
    async fn get_records(
        &self,
        person: u64,
        kind: String,
        include_voided: Option<bool>,
    ) -> Result<Vec<RecordJson>, ErrorObjectOwned>;

    /// Payments involving a person, newest first.
    #[method(name = "getpayments")]
    async fn get_payments(&self, person: u64) -> Result<Vec<PaymentJson>, ErrorObjectOwned>;
}

/// Implementation of the Lineage JSON-RPC server.
pub struct RpcServerImpl {
    ledger: Arc<Ledger>,
}

impl RpcServerImpl {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl LineageRpcServer for RpcServerImpl {
    async fn add_person(&self, id: u64) -> Result<bool, ErrorObjectOwned> {
        self.ledger.add_person(PersonId(id)).map_err(lineage_error)
    }

    async fn add_edge(&self, parent: u64, child: u64) -> Result<(), ErrorObjectOwned> {
        if parent == child {
            return Err(rpc_error(RPC_INVALID_PARAMETER, "a person cannot be their own parent"));
        }
        self.ledger
            .add_edge(PersonId(parent), PersonId(child))
            .map_err(lineage_error)
    }

    async fn distribute(
        &self,
        root: u64,
        amount: u64,
        kind: String,
        max_depth: Option<u32>,
    ) -> Result<DistributionJson, ErrorObjectOwned> {
        let kind = parse_kind(&kind)?;
        let report = self
            .ledger
            .distribute(PersonId(root), amount, kind, max_depth)
            .map_err(lineage_error)?;
        Ok(DistributionJson::from(&report))
    }

    async fn redistribute(
        &self,
        root: u64,
        amount: u64,
        kind: String,
        max_depth: Option<u32>,
    ) -> Result<DistributionJson, ErrorObjectOwned> {
        let kind = parse_kind(&kind)?;
        let report = self
            .ledger
            .redistribute(PersonId(root), amount, kind, max_depth)
            .map_err(lineage_error)?;
        Ok(DistributionJson::from(&report))
    }

    async fn void_run(&self, run_id: String) -> Result<RunJson, ErrorObjectOwned> {
        let run_id = parse_run_id(&run_id)?;
        let run = self.ledger.void_run(&run_id).map_err(lineage_error)?;
        Ok(RunJson::from(&run))
    }

    async fn get_run(&self, run_id: String) -> Result<RunSummaryJson, ErrorObjectOwned> {
        let run_id = parse_run_id(&run_id)?;
        let summary = self.ledger.run_summary(&run_id).map_err(lineage_error)?;
        Ok(RunSummaryJson::from(&summary))
    }

    async fn apply_payment(
        &self,
        payer: u64,
        recipient: u64,
        amount: u64,
        external_ref: String,
        timestamp: Option<i64>,
        policy: Option<String>,
    ) -> Result<PaymentOutcomeJson, ErrorObjectOwned> {
        let policy = parse_policy(policy)?;
        let event = PaymentEvent {
            payer_id: PersonId(payer),
            recipient_id: PersonId(recipient),
            amount,
            external_ref,
            timestamp,
        };
        let outcome = self
            .ledger
            .apply_payment(&event, policy)
            .map_err(lineage_error)?;
        Ok(PaymentOutcomeJson::from(&outcome))
    }

    async fn get_outstanding(&self, person: u64, kind: String) -> Result<i128, ErrorObjectOwned> {
        let kind = parse_kind(&kind)?;
        self.ledger
            .sum_outstanding(PersonId(person), kind)
            .map_err(lineage_error)
    }

    async fn get_balance(&self, person: u64) -> Result<BalanceJson, ErrorObjectOwned> {
        let balance = self.ledger.balance(PersonId(person)).map_err(lineage_error)?;
        Ok(BalanceJson::from(&balance))
    }

    async fn get_records(
        &self,
        person: u64,
        kind: String,
        include_voided: Option<bool>,
    ) -> Result<Vec<RecordJson>, ErrorObjectOwned> {
        let kind = parse_kind(&kind)?;
        let records = self
            .ledger
            .records_for(PersonId(person), kind, include_voided.unwrap_or(false))
            .map_err(lineage_error)?;
        Ok(records.iter().map(RecordJson::from).collect())
    }

    async fn get_payments(&self, person: u64) -> Result<Vec<PaymentJson>, ErrorObjectOwned> {
        let payments = self
            .ledger
            .payment_history(PersonId(person))
            .map_err(lineage_error)?;
        Ok(payments.iter().map(PaymentJson::from).collect())
    }
}

/// Start the JSON-RPC server on the given address.
///
/// Returns a [`ServerHandle`] that can be used to stop the server.
pub async fn start_rpc_server(addr: &str, ledger: Arc<Ledger>) -> Result<ServerHandle, LineageError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| StorageError::Backend(format!("RPC server error: {e}")))?;

    let rpc_impl = RpcServerImpl::new(ledger);
    let handle = server.start(rpc_impl.into_rpc());

    Ok(handle)
}
