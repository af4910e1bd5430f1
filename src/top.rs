//! Selection of the top entries of a frequency table

use crate::Count;
use rayon::prelude::*;
use std::{cmp::Reverse, collections::BinaryHeap, num::NonZeroUsize};

/// Entry of a ranked query result
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Ranked<K> {
    /// What is being ranked (a word, a book...)
    pub key: K,

    /// Number of occurences
    pub score: Count,
}

/// Query result, ordered by decreasing score then increasing key
pub type RankedResult<K> = Vec<Ranked<K>>;

/// Rank entries by decreasing score, breaking ties by increasing key, and
/// keep at most `limit` of them
///
/// When there is a limit, entries which cannot make it into the output are
/// discarded as early as possible instead of sorting the full input.
pub fn rank<K: Ord + Send>(
    entries: impl IntoParallelIterator<Item = (K, Count)>,
    limit: Option<NonZeroUsize>,
) -> RankedResult<K> {
    // Ordering keys sort in the desired output order
    let order_keys = (entries.into_par_iter()).map(|(key, score)| (Reverse(score), key));
    let ordered = match limit.map(NonZeroUsize::get) {
        // Without a limit, just sort everything
        None => {
            let mut sorted = order_keys.collect::<Vec<_>>();
            sorted.par_sort_unstable();
            sorted
        }

        // With a limit, keep the best entries in a max-heap whose top is the
        // worst entry that is currently retained...
        Some(max_len) => order_keys
            .fold(
                BinaryHeap::new,
                |mut heap, entry| {
                    heap.push(entry);
                    if heap.len() > max_len {
                        heap.pop();
                    }
                    heap
                },
            )
            // ...then merge thread results into a global result
            .reduce(BinaryHeap::new, |heap1, heap2| {
                let (mut dst, mut src) = if heap1.len() >= heap2.len() {
                    (heap1, heap2)
                } else {
                    (heap2, heap1)
                };
                while let Some(entry) = src.pop() {
                    dst.push(entry);
                    if dst.len() > max_len {
                        dst.pop();
                    }
                }
                dst
            })
            .into_sorted_vec(),
    };
    ordered
        .into_iter()
        .map(|(Reverse(score), key)| Ranked { key, score })
        .collect()
}
