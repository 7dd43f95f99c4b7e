//! Core data model: people, obligation records, distribution runs, payments.
//!
//! All monetary values are in minor units (see [`crate::constants`]).
//! Outstanding balances are signed so an explicitly allowed overpay can be
//! represented; everything else is unsigned.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::SHARE_PRECISION;
use crate::error::ValidationError;

/// Opaque identity of a person, owned by the external person store.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PersonId(pub u64);

impl PersonId {
    /// Big-endian bytes, used for ordered storage keys.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PersonId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Which side of the ledger an obligation sits on.
///
/// A debt is rooted at a perpetrator and flows down their descendants; a
/// credit is rooted at a harmed ancestor. The distribution algorithm is the
/// same for both.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub enum ObligationKind {
    Debt,
    Credit,
}

impl ObligationKind {
    pub const ALL: [ObligationKind; 2] = [ObligationKind::Debt, ObligationKind::Credit];

    /// Single-byte tag used as a storage key prefix.
    pub fn tag(self) -> u8 {
        match self {
            Self::Debt => b'D',
            Self::Credit => b'C',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debt => "debt",
            Self::Credit => "credit",
        }
    }
}

impl fmt::Display for ObligationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObligationKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debt" => Ok(Self::Debt),
            "credit" => Ok(Self::Credit),
            other => Err(ValidationError::InvalidId(format!("unknown obligation kind: {other}"))),
        }
    }
}

/// Identifier of one distribution run.
///
/// BLAKE3 over `(root, kind, root_amount, sequence)`, so the same seed
/// always maps to the same id while a re-run after a void gets a fresh one.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct RunId(pub [u8; 32]);

impl RunId {
    pub fn derive(root_id: PersonId, kind: ObligationKind, root_amount: u64, sequence: u32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"lineage/run/v1");
        hasher.update(&root_id.to_be_bytes());
        hasher.update(&[kind.tag()]);
        hasher.update(&root_amount.to_be_bytes());
        hasher.update(&sequence.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        parse_digest(s).map(Self)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identifier of a payment: BLAKE3 of its external reference.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PaymentId(pub [u8; 32]);

impl PaymentId {
    pub fn from_external_ref(external_ref: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"lineage/payment/v1");
        hasher.update(external_ref.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        parse_digest(s).map(Self)
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Digest of the root→descendant path a record was produced along.
///
/// A descendant reachable through several parents (a diamond in the graph)
/// gets one record per path, each carrying that path's share, so two paths
/// meeting at the same person never collide on a key.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PathId(pub [u8; 32]);

impl PathId {
    /// Path consisting of the root alone.
    pub fn root(root_id: PersonId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"lineage/path/v1");
        hasher.update(&root_id.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// This path followed by one more hop to `child`.
    pub fn extend(&self, child: PersonId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(&child.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

fn parse_digest(s: &str) -> Result<[u8; 32], ValidationError> {
    if s.len() != 64 {
        return Err(ValidationError::InvalidId("id must be 64 hex characters".into()));
    }
    let bytes = hex::decode(s).map_err(|_| ValidationError::InvalidId("invalid hex in id".into()))?;
    bytes
        .try_into()
        .map_err(|_| ValidationError::InvalidId("id must be 32 bytes".into()))
}

/// Lifecycle of a distribution run.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum RunStatus {
    /// Traversal started but has not finished (halted, cancelled, or crashed).
    InProgress,
    /// Traversal finished; warnings may still be attached.
    Complete,
    /// Superseded or withdrawn. Records stay for audit but are inert.
    Voided,
}

/// One distribution of a seed amount from a root across its descendants.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct DistributionRun {
    pub run_id: RunId,
    pub root_id: PersonId,
    pub kind: ObligationKind,
    pub root_amount: u64,
    pub max_depth: u32,
    /// Number of runs created for this `(root, kind)` before this one.
    pub sequence: u32,
    pub status: RunStatus,
    /// Unix milliseconds.
    pub created_at: i64,
    pub record_count: u64,
    /// Amount that could not be handed down because of the depth bound.
    pub unresolved_total: u64,
    pub cycle_count: u32,
}

impl DistributionRun {
    pub fn new(
        root_id: PersonId,
        kind: ObligationKind,
        root_amount: u64,
        max_depth: u32,
        sequence: u32,
    ) -> Self {
        Self {
            run_id: RunId::derive(root_id, kind, root_amount, sequence),
            root_id,
            kind,
            root_amount,
            max_depth,
            sequence,
            status: RunStatus::InProgress,
            created_at: now_millis(),
            record_count: 0,
            unresolved_total: 0,
            cycle_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != RunStatus::Voided
    }

    /// Copy a traversal's outcome (status and summary counters) from `other`.
    pub fn finish_from(&mut self, other: &DistributionRun) {
        self.status = other.status;
        self.record_count = other.record_count;
        self.unresolved_total = other.unresolved_total;
        self.cycle_count = other.cycle_count;
    }
}

/// Natural key of an obligation record.
///
/// Field order matches the storage key layout, so sorting keys yields the
/// report order: generation, then parent, then descendant, then path.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct RecordKey {
    pub run_id: RunId,
    pub generation: u32,
    pub parent_id: PersonId,
    pub descendant_id: PersonId,
    pub path_id: PathId,
}

impl RecordKey {
    pub const ENCODED_LEN: usize = 84;

    /// `run_id || generation(BE) || parent(BE) || descendant(BE) || path_id`.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut key = [0u8; Self::ENCODED_LEN];
        key[0..32].copy_from_slice(self.run_id.as_bytes());
        key[32..36].copy_from_slice(&self.generation.to_be_bytes());
        key[36..44].copy_from_slice(&self.parent_id.to_be_bytes());
        key[44..52].copy_from_slice(&self.descendant_id.to_be_bytes());
        key[52..84].copy_from_slice(self.path_id.as_bytes());
        key
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let run_id = RunId(bytes[0..32].try_into().ok()?);
        let generation = u32::from_be_bytes(bytes[32..36].try_into().ok()?);
        let parent_id = PersonId(u64::from_be_bytes(bytes[36..44].try_into().ok()?));
        let descendant_id = PersonId(u64::from_be_bytes(bytes[44..52].try_into().ok()?));
        let path_id = PathId(bytes[52..84].try_into().ok()?);
        Some(Self {
            run_id,
            generation,
            parent_id,
            descendant_id,
            path_id,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.run_id.to_string();
        let path = self.path_id.to_string();
        write!(
            f,
            "{}/g{}/{}->{}#{}",
            &run[..12],
            self.generation,
            self.parent_id,
            self.descendant_id,
            &path[..8]
        )
    }
}

/// Derived payment state of an obligation record.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObligationStatus {
    Created,
    PartiallyPaid,
    Settled,
}

/// A debt or credit carried by one descendant for one distribution run.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ObligationRecord {
    pub run_id: RunId,
    pub kind: ObligationKind,
    pub root_id: PersonId,
    pub descendant_id: PersonId,
    /// The person whose amount was split to produce this record.
    pub parent_id: PersonId,
    pub path_id: PathId,
    /// 1 for a direct child of the root.
    pub generation: u32,
    /// Amount the parent carried before the split.
    pub amount_at_this_level: u64,
    /// This descendant's share after the split.
    pub inherited_portion: u64,
    /// Number of siblings the parent's amount was split among.
    pub sibling_count: u32,
    /// `1 / sibling_count` in parts-per-billion. Per-level, not cumulative.
    pub sibling_share_ppb: u64,
    pub amount_paid: u64,
    /// `inherited_portion - amount_paid`; negative only after an allowed overpay.
    pub amount_outstanding: i64,
}

impl ObligationRecord {
    /// A fresh, unpaid record at `key`.
    pub fn new(
        key: RecordKey,
        kind: ObligationKind,
        root_id: PersonId,
        amount_at_this_level: u64,
        inherited_portion: u64,
        sibling_count: u32,
    ) -> Self {
        Self {
            run_id: key.run_id,
            kind,
            root_id,
            descendant_id: key.descendant_id,
            parent_id: key.parent_id,
            path_id: key.path_id,
            generation: key.generation,
            amount_at_this_level,
            inherited_portion,
            sibling_count,
            sibling_share_ppb: share_ppb(sibling_count),
            amount_paid: 0,
            amount_outstanding: inherited_portion as i64,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            run_id: self.run_id,
            generation: self.generation,
            parent_id: self.parent_id,
            descendant_id: self.descendant_id,
            path_id: self.path_id,
        }
    }

    pub fn status(&self) -> ObligationStatus {
        if self.amount_outstanding <= 0 {
            ObligationStatus::Settled
        } else if self.amount_paid == 0 {
            ObligationStatus::Created
        } else {
            ObligationStatus::PartiallyPaid
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status() == ObligationStatus::Settled
    }
}

/// Per-level share factor in parts-per-billion. Zero siblings has no share.
pub fn share_ppb(sibling_count: u32) -> u64 {
    if sibling_count == 0 {
        0
    } else {
        SHARE_PRECISION / sibling_count as u64
    }
}

/// An incoming payment event from the payment layer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PaymentEvent {
    pub payer_id: PersonId,
    pub recipient_id: PersonId,
    pub amount: u64,
    pub external_ref: String,
    /// Unix milliseconds; `None` means "now".
    pub timestamp: Option<i64>,
}

/// Immutable record of an applied payment.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct PaymentRecord {
    pub payment_id: PaymentId,
    pub amount: u64,
    pub payer_id: PersonId,
    pub recipient_id: PersonId,
    pub debt_record: Option<RecordKey>,
    pub credit_record: Option<RecordKey>,
    /// Amount consumed on the matched debt record.
    pub debt_applied: u64,
    /// Amount consumed on the matched credit record.
    pub credit_applied: u64,
    pub external_ref: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// Conditional update of one record inside a payment commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordUpdate {
    pub key: RecordKey,
    /// `amount_paid` observed when the update was computed.
    pub expected_paid: u64,
    pub amount_paid: u64,
    pub amount_outstanding: i64,
}

/// Everything one payment writes, committed atomically or not at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentCommit {
    pub payment: PaymentRecord,
    pub updates: Vec<RecordUpdate>,
}

/// Current UTC time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
