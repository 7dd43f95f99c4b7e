//! Sibling split with largest-remainder rounding.
//!
//! A parent's amount `A` is split among `k` children as `q = A / k` with
//! `r = A % k` minor units left over. Every child's exact share has the same
//! fractional remainder, so the largest-remainder rule reduces to handing
//! one extra unit to each of the first `r` children in ascending id order.
//! The parts always sum to exactly `A`.

use crate::types::PersonId;

/// Sort and dedup a child list so splits are deterministic.
///
/// Edges come from an external store in arbitrary order and may repeat.
pub fn normalize_children(mut children: Vec<PersonId>) -> Vec<PersonId> {
    children.sort_unstable();
    children.dedup();
    children
}

/// Split `amount` across `children` (already normalized).
///
/// Returns `(child, share)` pairs in the same order. An empty child list
/// returns an empty vec; no division happens in that case.
pub fn split_evenly(amount: u64, children: &[PersonId]) -> Vec<(PersonId, u64)> {
    if children.is_empty() {
        return Vec::new();
    }
    let k = children.len() as u64;
    let base = amount / k;
    let remainder = (amount % k) as usize;

    children
        .iter()
        .enumerate()
        .map(|(i, child)| {
            let share = if i < remainder { base + 1 } else { base };
            (*child, share)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(raw: &[u64]) -> Vec<PersonId> {
        raw.iter().copied().map(PersonId).collect()
    }

    #[test]
    fn even_split_of_two() {
        let shares = split_evenly(100_000_000, &ids(&[1, 2]));
        assert_eq!(shares, vec![(PersonId(1), 50_000_000), (PersonId(2), 50_000_000)]);
    }

    #[test]
    fn single_child_takes_everything() {
        assert_eq!(split_evenly(12_345, &ids(&[9])), vec![(PersonId(9), 12_345)]);
    }

    #[test]
    fn remainder_goes_to_lowest_ids() {
        let shares = split_evenly(100, &ids(&[3, 5, 7]));
        assert_eq!(
            shares,
            vec![(PersonId(3), 34), (PersonId(5), 33), (PersonId(7), 33)]
        );
    }

    #[test]
    fn amount_smaller_than_sibling_count() {
        let shares = split_evenly(2, &ids(&[1, 2, 3, 4]));
        let amounts: Vec<u64> = shares.iter().map(|(_, a)| *a).collect();
        assert_eq!(amounts, vec![1, 1, 0, 0]);
    }

    #[test]
    fn no_children_no_split() {
        assert!(split_evenly(100, &[]).is_empty());
    }

    #[test]
    fn normalize_sorts_and_dedups() {
        assert_eq!(normalize_children(ids(&[5, 1, 5, 3, 1])), ids(&[1, 3, 5]));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn split_conserves_amount(amount in 0u64..=u64::MAX / 2, k in 1usize..64) {
            let children: Vec<PersonId> = (0..k as u64).map(PersonId).collect();
            let shares = split_evenly(amount, &children);
            let total: u128 = shares.iter().map(|(_, a)| *a as u128).sum();
            prop_assert_eq!(total, amount as u128);
        }

        #[test]
        fn shares_differ_by_at_most_one(amount in 0u64..1_000_000_000_000, k in 1usize..64) {
            let children: Vec<PersonId> = (0..k as u64).map(PersonId).collect();
            let shares = split_evenly(amount, &children);
            let max = shares.iter().map(|(_, a)| *a).max().unwrap();
            let min = shares.iter().map(|(_, a)| *a).min().unwrap();
            prop_assert!(max - min <= 1);
        }
    }
}
