//! Error types for the Lineage engine.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("amount must be positive")] NonPositiveAmount,
    #[error("amount too large: {amount} > {max}")] AmountTooLarge { amount: u64, max: u64 },
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("unknown person: {0}")] UnknownPerson(u64),
    #[error("external reference must not be empty")] EmptyExternalRef,
    #[error("external reference too long: {len} > {max}")] ExternalRefTooLong { len: usize, max: usize },
    #[error("invalid max depth: {got} (allowed 1..={max})")] InvalidDepth { got: u32, max: u32 },
    #[error("invalid identifier: {0}")] InvalidId(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    #[error("active run {run_id} already distributes {root_amount}; void or redistribute to change the amount")]
    ActiveRunExists { run_id: String, root_amount: u64 },
    #[error("run not found: {0}")] RunNotFound(String),
    #[error("run is voided: {0}")] RunVoided(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("overpay rejected on record {record}: outstanding {outstanding}, payment {amount}")]
    OverpayRejected { record: String, outstanding: i64, amount: u64 },
    #[error("duplicate payment reference: {0}")] DuplicatePayment(String),
    #[error("payment commit contended after {attempts} attempts")] Contention { attempts: u32 },
    #[error("arithmetic overflow")] ArithmeticOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("backend: {0}")] Backend(String),
    #[error("codec: {0}")] Codec(String),
    #[error("stale record: {0}")] StaleRecord(String),
    #[error("record not found: {0}")] RecordNotFound(String),
    #[error("payment already recorded: {0}")] DuplicatePayment(String),
    #[error("missing column family: {0}")] MissingColumnFamily(String),
}

#[derive(Error, Debug)]
pub enum LineageError {
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] Distribution(#[from] DistributionError),
    #[error(transparent)] Reconcile(#[from] ReconcileError),
    #[error(transparent)] Storage(#[from] StorageError),
}
