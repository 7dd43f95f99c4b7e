//! Fixed-point money helpers.
//!
//! Amounts are integer minor units end to end; these helpers only convert
//! at the edges (CLI input, display) and validate caller-supplied values.

use crate::constants::{AMOUNT_DECIMALS, MAX_AMOUNT, MINOR_UNITS_PER_MAJOR};
use crate::error::ValidationError;

/// Reject zero and amounts above [`MAX_AMOUNT`].
pub fn validate_amount(amount: u64) -> Result<u64, ValidationError> {
    if amount == 0 {
        return Err(ValidationError::NonPositiveAmount);
    }
    if amount > MAX_AMOUNT {
        return Err(ValidationError::AmountTooLarge {
            amount,
            max: MAX_AMOUNT,
        });
    }
    Ok(amount)
}

/// Parse a display amount such as `"1,000,000.00"` or `"$12.5"` into minor units.
///
/// Thousands separators and a leading `$` are ignored. At most
/// [`AMOUNT_DECIMALS`] fractional digits are accepted; signs, exponents, and
/// anything else are rejected rather than rounded.
pub fn parse_amount(input: &str) -> Result<u64, ValidationError> {
    let invalid = || ValidationError::InvalidAmount(input.to_string());

    let cleaned: String = input
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',' && *c != '_')
        .collect();
    if cleaned.is_empty() {
        return Err(invalid());
    }

    let (whole, frac) = match cleaned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (cleaned.as_str(), ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > AMOUNT_DECIMALS {
        return Err(invalid());
    }

    let whole_units: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut frac_units: u64 = if frac.is_empty() { 0 } else { frac.parse().map_err(|_| invalid())? };
    for _ in frac.len()..AMOUNT_DECIMALS {
        frac_units *= 10;
    }

    let total = whole_units
        .checked_mul(MINOR_UNITS_PER_MAJOR)
        .and_then(|v| v.checked_add(frac_units))
        .ok_or_else(invalid)?;
    if total > MAX_AMOUNT {
        return Err(ValidationError::AmountTooLarge {
            amount: total,
            max: MAX_AMOUNT,
        });
    }
    Ok(total)
}

/// Format minor units as `"<major>.<minor>"`.
pub fn format_amount(amount: u64) -> String {
    format!(
        "{}.{:0width$}",
        amount / MINOR_UNITS_PER_MAJOR,
        amount % MINOR_UNITS_PER_MAJOR,
        width = AMOUNT_DECIMALS
    )
}

/// Format a signed balance (outstanding amounts and sums).
pub fn format_signed(amount: i128) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let per = MINOR_UNITS_PER_MAJOR as u128;
    format!(
        "{sign}{}.{:0width$}",
        abs / per,
        abs % per,
        width = AMOUNT_DECIMALS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_grouped_dollars() {
        assert_eq!(parse_amount("1,000,000.00").unwrap(), 100_000_000);
        assert_eq!(parse_amount("$500,000").unwrap(), 50_000_000);
    }

    #[test]
    fn parses_short_fraction() {
        assert_eq!(parse_amount("12.5").unwrap(), 1_250);
        assert_eq!(parse_amount(".07").unwrap(), 7);
        assert_eq!(parse_amount("3.").unwrap(), 300);
    }

    #[test]
    fn rejects_excess_precision() {
        assert!(matches!(
            parse_amount("1.001"),
            Err(ValidationError::InvalidAmount(_))
        ));
    }

    #[test]
    fn rejects_signs_and_garbage() {
        for bad in ["", "-1", "+1", "1e5", "abc", ".", "1.2.3", "NaN"] {
            assert!(parse_amount(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_amount("999999999999999999999").is_err());
        assert!(matches!(
            parse_amount("92233720368547758.08"),
            Err(ValidationError::AmountTooLarge { .. })
        ));
    }

    #[test]
    fn formats_minor_units() {
        assert_eq!(format_amount(100_000_000), "1000000.00");
        assert_eq!(format_amount(7), "0.07");
        assert_eq!(format_signed(-1_050), "-10.50");
        assert_eq!(format_signed(0), "0.00");
    }

    #[test]
    fn validate_rejects_zero_and_too_large() {
        assert_eq!(validate_amount(0), Err(ValidationError::NonPositiveAmount));
        assert!(validate_amount(MAX_AMOUNT).is_ok());
        assert!(matches!(
            validate_amount(MAX_AMOUNT + 1),
            Err(ValidationError::AmountTooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn format_then_parse_is_identity(amount in 0u64..=MAX_AMOUNT) {
            prop_assert_eq!(parse_amount(&format_amount(amount)).unwrap(), amount);
        }
    }
}
