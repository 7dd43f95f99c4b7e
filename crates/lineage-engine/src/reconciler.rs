//! Payment application against outstanding obligation records.
//!
//! A payment is matched to at most one debt record of the payer and one
//! credit record of the recipient (the active record with the largest
//! outstanding balance on each side). The full payment amount is applied to
//! each matched record independently; it is never split across several
//! obligations a person may hold.
//!
//! Commits are optimistic: every record update carries the `amount_paid` it
//! was computed from and the repository rejects the whole commit if any
//! record moved in the meantime. The reconciler then re-reads and retries.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lineage_core::amount::validate_amount;
use lineage_core::constants::{DEFAULT_RECONCILE_ATTEMPTS, MAX_EXTERNAL_REF_LEN};
use lineage_core::error::{LineageError, ReconcileError, StorageError, ValidationError};
use lineage_core::traits::{ObligationRepository, PersonStore};
use lineage_core::types::{
    now_millis, ObligationKind, ObligationRecord, PaymentCommit, PaymentEvent, PaymentId,
    PaymentRecord, PersonId, RecordUpdate,
};

/// What to do when a payment exceeds a matched record's outstanding balance.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OverpayPolicy {
    /// Settle the record at zero and report the remainder as unapplied.
    #[default]
    Clamp,
    /// Drive the outstanding balance negative and report the overpaid part.
    Allow,
    /// Refuse the payment before any write.
    Reject,
}

impl OverpayPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clamp => "clamp",
            Self::Allow => "allow",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for OverpayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverpayPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clamp" => Ok(Self::Clamp),
            "allow" => Ok(Self::Allow),
            "reject" => Ok(Self::Reject),
            other => Err(ValidationError::InvalidId(format!("unknown overpay policy: {other}"))),
        }
    }
}

/// Effect of a payment on one matched record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedLeg {
    /// The record after the update.
    pub record: ObligationRecord,
    /// Amount added to `amount_paid`.
    pub applied: u64,
    /// Remainder not consumed under [`OverpayPolicy::Clamp`].
    pub unapplied: u64,
    /// Amount paid beyond the outstanding balance under [`OverpayPolicy::Allow`].
    pub overpaid: u64,
}

/// Result of [`LedgerReconciler::apply_payment`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentOutcome {
    pub payment: PaymentRecord,
    pub debit: Option<AppliedLeg>,
    pub credit: Option<AppliedLeg>,
}

/// New balances for one record after applying `amount` under `policy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub applied: u64,
    pub unapplied: u64,
    pub overpaid: u64,
    pub amount_paid: u64,
    pub amount_outstanding: i64,
}

/// Compute the effect of `amount` on `record` without touching storage.
pub fn settle(
    record: &ObligationRecord,
    amount: u64,
    policy: OverpayPolicy,
) -> Result<Settlement, ReconcileError> {
    let outstanding = record.amount_outstanding;
    let available = outstanding.max(0) as u64;

    let (applied, unapplied, overpaid) = if amount <= available {
        (amount, 0, 0)
    } else {
        match policy {
            OverpayPolicy::Clamp => (available, amount - available, 0),
            OverpayPolicy::Allow => (amount, 0, amount - available),
            OverpayPolicy::Reject => {
                return Err(ReconcileError::OverpayRejected {
                    record: record.key().to_string(),
                    outstanding,
                    amount,
                });
            }
        }
    };

    let applied_signed = i64::try_from(applied).map_err(|_| ReconcileError::ArithmeticOverflow)?;
    let amount_paid = record
        .amount_paid
        .checked_add(applied)
        .ok_or(ReconcileError::ArithmeticOverflow)?;
    let amount_outstanding = outstanding
        .checked_sub(applied_signed)
        .ok_or(ReconcileError::ArithmeticOverflow)?;

    Ok(Settlement {
        applied,
        unapplied,
        overpaid,
        amount_paid,
        amount_outstanding,
    })
}

struct PlannedLeg {
    leg: AppliedLeg,
    update: RecordUpdate,
}

/// Applies payment events to the ledger.
pub struct LedgerReconciler {
    people: Arc<dyn PersonStore>,
    repo: Arc<dyn ObligationRepository>,
    max_attempts: u32,
}

impl LedgerReconciler {
    pub fn new(people: Arc<dyn PersonStore>, repo: Arc<dyn ObligationRepository>) -> Self {
        Self {
            people,
            repo,
            max_attempts: DEFAULT_RECONCILE_ATTEMPTS,
        }
    }

    /// Override the number of commit attempts (minimum 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Apply `event` atomically.
    ///
    /// The payment is recorded even when neither side has an outstanding
    /// record; both links are then `None`.
    pub fn apply_payment(
        &self,
        event: &PaymentEvent,
        policy: OverpayPolicy,
    ) -> Result<PaymentOutcome, LineageError> {
        self.validate(event)?;
        let payment_id = PaymentId::from_external_ref(&event.external_ref);
        let timestamp = event.timestamp.unwrap_or_else(now_millis);

        for attempt in 1..=self.max_attempts {
            if self.repo.get_payment(&payment_id)?.is_some() {
                return Err(ReconcileError::DuplicatePayment(event.external_ref.clone()).into());
            }

            let debit = self.plan_leg(event.payer_id, ObligationKind::Debt, event.amount, policy)?;
            let credit =
                self.plan_leg(event.recipient_id, ObligationKind::Credit, event.amount, policy)?;

            let payment = PaymentRecord {
                payment_id,
                amount: event.amount,
                payer_id: event.payer_id,
                recipient_id: event.recipient_id,
                debt_record: debit.as_ref().map(|p| p.update.key),
                credit_record: credit.as_ref().map(|p| p.update.key),
                debt_applied: debit.as_ref().map_or(0, |p| p.leg.applied),
                credit_applied: credit.as_ref().map_or(0, |p| p.leg.applied),
                external_ref: event.external_ref.clone(),
                timestamp,
            };
            let updates = debit
                .iter()
                .chain(credit.iter())
                .map(|p| p.update.clone())
                .collect();
            let commit = PaymentCommit {
                payment: payment.clone(),
                updates,
            };

            match self.repo.commit_payment(&commit) {
                Ok(()) => {
                    info!(
                        %payment_id,
                        payer = %event.payer_id,
                        recipient = %event.recipient_id,
                        amount = event.amount,
                        debt_applied = payment.debt_applied,
                        credit_applied = payment.credit_applied,
                        attempt,
                        "payment applied"
                    );
                    return Ok(PaymentOutcome {
                        payment,
                        debit: debit.map(|p| p.leg),
                        credit: credit.map(|p| p.leg),
                    });
                }
                Err(StorageError::StaleRecord(key)) => {
                    debug!(%payment_id, attempt, %key, "record changed under payment; retrying");
                }
                Err(StorageError::DuplicatePayment(reference)) => {
                    return Err(ReconcileError::DuplicatePayment(reference).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%payment_id, attempts = self.max_attempts, "payment commit kept conflicting");
        Err(ReconcileError::Contention {
            attempts: self.max_attempts,
        }
        .into())
    }

    fn validate(&self, event: &PaymentEvent) -> Result<(), LineageError> {
        validate_amount(event.amount)?;
        if event.external_ref.trim().is_empty() {
            return Err(ValidationError::EmptyExternalRef.into());
        }
        if event.external_ref.len() > MAX_EXTERNAL_REF_LEN {
            return Err(ValidationError::ExternalRefTooLong {
                len: event.external_ref.len(),
                max: MAX_EXTERNAL_REF_LEN,
            }
            .into());
        }
        for person in [event.payer_id, event.recipient_id] {
            if !self.people.person_exists(person)? {
                return Err(ValidationError::UnknownPerson(person.0).into());
            }
        }
        Ok(())
    }

    fn plan_leg(
        &self,
        person: PersonId,
        kind: ObligationKind,
        amount: u64,
        policy: OverpayPolicy,
    ) -> Result<Option<PlannedLeg>, LineageError> {
        let Some(record) = self.repo.largest_outstanding(person, kind)? else {
            return Ok(None);
        };
        let settlement = settle(&record, amount, policy)?;
        let update = RecordUpdate {
            key: record.key(),
            expected_paid: record.amount_paid,
            amount_paid: settlement.amount_paid,
            amount_outstanding: settlement.amount_outstanding,
        };
        let mut after = record;
        after.amount_paid = settlement.amount_paid;
        after.amount_outstanding = settlement.amount_outstanding;
        Ok(Some(PlannedLeg {
            leg: AppliedLeg {
                record: after,
                applied: settlement.applied,
                unapplied: settlement.unapplied,
                overpaid: settlement.overpaid,
            },
            update,
        }))
    }
}
