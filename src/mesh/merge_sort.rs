//! Stable bottom-up merge sort returning a permutation
//!
//! Used to put grid edges in a canonical order. Only the permutation is
//! produced; the caller applies it and remaps any indices into the list.

use super::elements::Edge;

/// Indices of `items` in ascending `key` order. Equal keys keep their
/// input order.
pub fn merge_sort_by_key<T, K, F>(items: &[T], key: F) -> Vec<usize>
where
    K: PartialOrd,
    F: Fn(&T) -> K,
{
    let keys: Vec<K> = items.iter().map(&key).collect();
    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut scratch = vec![0usize; items.len()];

    let mut width = 1;
    while width < order.len() {
        for start in (0..order.len()).step_by(2 * width) {
            let mid = (start + width).min(order.len());
            let end = (start + 2 * width).min(order.len());
            merge_runs(&keys, &order[start..mid], &order[mid..end], &mut scratch[start..end]);
        }
        std::mem::swap(&mut order, &mut scratch);
        width *= 2;
    }

    order
}

/// Canonical edge order: by smaller end node, then larger end node
pub fn sort_edges(edges: &[Edge]) -> Vec<usize> {
    merge_sort_by_key(edges, Edge::key)
}

fn merge_runs<K: PartialOrd>(keys: &[K], left: &[usize], right: &[usize], out: &mut [usize]) {
    let (mut i, mut j) = (0, 0);
    for slot in out.iter_mut() {
        // take from the left run on ties to stay stable
        let take_left = j >= right.len() || (i < left.len() && keys[left[i]] <= keys[right[j]]);
        if take_left {
            *slot = left[i];
            i += 1;
        } else {
            *slot = right[j];
            j += 1;
        }
    }
}
