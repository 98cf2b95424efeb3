//! Victim selection for eviction sweeps.
//!
//! A sweep frees the `batch` live slots with the fewest invocations since the
//! previous sweep. Counters are reset afterwards, so this is an aging scheme
//! rather than a true LRU.

use std::collections::BinaryHeap;

use super::table::SlotIndex;

/// Pick the `batch` smallest `(invocations, index)` pairs from `candidates`.
///
/// Ties on the counter go to the lower index. The result is ordered from
/// least to most used. Runs in one pass with a heap bounded to `batch`.
pub fn select_victims<I>(candidates: I, batch: usize) -> Vec<SlotIndex>
where
    I: IntoIterator<Item = (SlotIndex, u16)>,
{
    if batch == 0 {
        return Vec::new();
    }

    // Max-heap: the root is the current worst of the kept candidates.
    let mut kept: BinaryHeap<(u16, SlotIndex)> = BinaryHeap::with_capacity(batch + 1);
    for (index, invocations) in candidates {
        let key = (invocations, index);
        if kept.len() < batch {
            kept.push(key);
        } else if let Some(&worst) = kept.peek() {
            if key < worst {
                kept.pop();
                kept.push(key);
            }
        }
    }

    kept.into_sorted_vec()
        .into_iter()
        .map(|(_, index)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(values: &[u16]) -> Vec<(SlotIndex, u16)> {
        values
            .iter()
            .enumerate()
            .map(|(i, &c)| (SlotIndex::new(i as u16), c))
            .collect()
    }

    fn indices(victims: &[SlotIndex]) -> Vec<u16> {
        victims.iter().map(|i| i.get()).collect()
    }

    #[test]
    fn test_picks_smallest() {
        let victims = select_victims(counters(&[5, 1, 3, 2]), 2);
        assert_eq!(indices(&victims), vec![1, 3]);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let victims = select_victims(counters(&[0, 0, 0, 0, 0, 0]), 3);
        assert_eq!(indices(&victims), vec![0, 1, 2]);

        let victims = select_victims(counters(&[4, 2, 7, 2, 2, 9]), 2);
        assert_eq!(indices(&victims), vec![1, 3]);
    }

    #[test]
    fn test_batch_larger_than_candidates() {
        let victims = select_victims(counters(&[3, 1]), 8);
        assert_eq!(indices(&victims), vec![1, 0]);
    }

    #[test]
    fn test_zero_batch() {
        assert!(select_victims(counters(&[1, 2, 3]), 0).is_empty());
    }

    #[test]
    fn test_matches_full_sort() {
        let values: Vec<u16> = (0..200u32).map(|i| ((i * 7919) % 13) as u16).collect();
        let mut sorted = counters(&values);
        sorted.sort_by_key(|&(index, count)| (count, index));
        let expected: Vec<u16> = sorted.iter().take(50).map(|(i, _)| i.get()).collect();

        let victims = select_victims(counters(&values), 50);
        assert_eq!(indices(&victims), expected);
    }
}
