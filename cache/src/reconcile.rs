//! Reconciliation of ordered membership lists.
//!
//! When a to-many relationship flushes its canonical state, the visible list
//! is replaced by the new order through a single splice over the smallest
//! window that differs, instead of a full replacement.
//!
//! # Algorithm
//!
//! 1. Scan from the front for the first index where the lists differ
//! 2. If none differs but lengths do, the change starts at the shorter length
//! 3. Scan from the back for the length of the unchanged tail, never
//!    overlapping the unchanged head
//! 4. Everything between head and tail is removed from the old list and
//!    replaced by the corresponding run of the new list

use serde::{Deserialize, Serialize};

/// One contiguous change applied to an ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayChange {
    /// Index of the first changed position
    pub first_change_index: usize,
    /// Items removed from the old list at that index
    pub removed_count: usize,
    /// Items inserted from the new list at that index
    pub added_count: usize,
}

impl ArrayChange {
    pub fn insertion(index: usize, count: usize) -> Self {
        Self {
            first_change_index: index,
            removed_count: 0,
            added_count: count,
        }
    }

    pub fn removal(index: usize, count: usize) -> Self {
        Self {
            first_change_index: index,
            removed_count: count,
            added_count: 0,
        }
    }
}

/// Compute the minimal changed window between `old` and `new`.
///
/// Returns `None` when the lists are equal.
pub fn diff_window<T: PartialEq>(old: &[T], new: &[T]) -> Option<ArrayChange> {
    let shortest = old.len().min(new.len());

    let first = match (0..shortest).find(|&i| old[i] != new[i]) {
        Some(i) => i,
        None if old.len() != new.len() => shortest,
        None => return None,
    };

    let max_tail = shortest - first;
    let tail = (1..=max_tail)
        .find(|&i| old[old.len() - i] != new[new.len() - i])
        .map(|i| i - 1)
        .unwrap_or(max_tail);

    Some(ArrayChange {
        first_change_index: first,
        removed_count: old.len() - tail - first,
        added_count: new.len() - tail - first,
    })
}

/// Replace `current` with `target`, splicing only the changed window.
pub fn reconcile<T: PartialEq + Clone>(current: &mut Vec<T>, target: &[T]) -> Option<ArrayChange> {
    let change = diff_window(current, target)?;
    let start = change.first_change_index;
    current.splice(
        start..start + change.removed_count,
        target[start..start + change.added_count].iter().cloned(),
    );
    Some(change)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_replacement_in_the_middle() {
        let change = diff_window(&[1, 2, 3, 4, 5], &[1, 2, 9, 4, 5]).unwrap();
        assert_eq!(
            change,
            ArrayChange {
                first_change_index: 2,
                removed_count: 1,
                added_count: 1
            }
        );
    }

    #[test]
    fn equal_lists_report_nothing() {
        assert_eq!(diff_window(&[1, 2, 3], &[1, 2, 3]), None);
        assert_eq!(diff_window::<u8>(&[], &[]), None);
    }

    #[test]
    fn append_and_truncate() {
        assert_eq!(
            diff_window(&[1, 2], &[1, 2, 3, 4]),
            Some(ArrayChange::insertion(2, 2))
        );
        assert_eq!(
            diff_window(&[1, 2, 3, 4], &[1, 2]),
            Some(ArrayChange::removal(2, 2))
        );
    }

    #[test]
    fn prepend_uses_tail_match() {
        assert_eq!(
            diff_window(&[2, 3], &[1, 2, 3]),
            Some(ArrayChange::insertion(0, 1))
        );
    }

    #[test]
    fn repeated_values_do_not_overlap_head() {
        // tail scan must stop where the unchanged head begins
        let change = diff_window(&[1, 1], &[1, 1, 1]).unwrap();
        assert_eq!(change, ArrayChange::insertion(2, 1));
    }

    #[test]
    fn full_replacement() {
        let change = diff_window(&[1, 2, 3], &[4, 5]).unwrap();
        assert_eq!(
            change,
            ArrayChange {
                first_change_index: 0,
                removed_count: 3,
                added_count: 2
            }
        );
    }

    #[test]
    fn reconcile_splices_window() {
        let mut current = vec![1, 2, 3, 4, 5];
        let change = reconcile(&mut current, &[1, 2, 9, 8, 4, 5]).unwrap();
        assert_eq!(current, vec![1, 2, 9, 8, 4, 5]);
        assert_eq!(change.first_change_index, 2);
        assert_eq!(change.removed_count, 1);
        assert_eq!(change.added_count, 2);
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_reconcile_reaches_target(
                old in proptest::collection::vec(0u8..6, 0..12),
                new in proptest::collection::vec(0u8..6, 0..12),
            ) {
                let mut current = old.clone();
                let change = reconcile(&mut current, &new);
                prop_assert_eq!(&current, &new);
                prop_assert_eq!(change.is_none(), old == new);
            }

            #[test]
            fn prop_window_is_bounded(
                old in proptest::collection::vec(0u8..6, 0..12),
                new in proptest::collection::vec(0u8..6, 0..12),
            ) {
                if let Some(change) = diff_window(&old, &new) {
                    prop_assert!(change.first_change_index + change.removed_count <= old.len());
                    prop_assert!(change.first_change_index + change.added_count <= new.len());
                    prop_assert!(change.removed_count + change.added_count > 0);
                    // the head before the window is untouched
                    prop_assert_eq!(
                        &old[..change.first_change_index],
                        &new[..change.first_change_index]
                    );
                }
            }

            #[test]
            fn prop_appending_is_pure_insertion(
                base in proptest::collection::vec(0u8..6, 0..8),
                extra in proptest::collection::vec(0u8..6, 1..4),
            ) {
                let mut new = base.clone();
                new.extend(extra.iter().copied());
                let change = diff_window(&base, &new).unwrap();
                prop_assert_eq!(change.removed_count, 0);
                prop_assert_eq!(change.added_count, extra.len());
            }
        }
    }
}
