//! Engine constants. All monetary values in minor units (1 major unit = 100 minor units).

/// Minor units per major currency unit (cents per dollar).
pub const MINOR_UNITS_PER_MAJOR: u64 = 100;

/// Number of fractional digits accepted when parsing a display amount.
pub const AMOUNT_DECIMALS: usize = 2;

/// Largest amount accepted for seeds and payments.
///
/// Capped at `i64::MAX` so every outstanding balance, including an
/// overpaid (negative) one, fits a signed 64-bit integer.
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// Fixed-point denominator for the per-level sibling share factor.
///
/// `sibling_share_ppb = SHARE_PRECISION / sibling_count`, so a single
/// child carries exactly `SHARE_PRECISION` (1.0) and two siblings carry
/// `500_000_000` (0.5).
pub const SHARE_PRECISION: u64 = 1_000_000_000;

/// Default number of generations expanded below a root.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// Hard ceiling on `max_depth` accepted from callers.
pub const MAX_DEPTH_LIMIT: u32 = 1_000;

/// Default number of optimistic retries for a contended payment commit.
pub const DEFAULT_RECONCILE_ATTEMPTS: u32 = 8;

/// Maximum byte length of a payment's external reference.
pub const MAX_EXTERNAL_REF_LEN: usize = 256;

/// Default JSON-RPC port for the ledger node.
pub const DEFAULT_RPC_PORT: u16 = 18440;
