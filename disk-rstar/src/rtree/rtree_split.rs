//! R*-tree node heuristics.
//!
//! Pure functions over entry lists: which child to descend into, which
//! entries to evict for forced reinsertion, and how to split an overflowing
//! node. Nothing here touches the page store.

use std::cmp::Ordering;

use super::rtree_types::Entry;
use crate::envelope::Envelope;

/// Index of the child that needs the least area enlargement to cover
/// `bounds`. Ties go to the smaller resulting area, then the lower child id.
pub fn choose_subtree(entries: &[Entry], bounds: &Envelope) -> usize {
    let mut best = 0;
    let mut best_cost = (f64::INFINITY, f64::INFINITY, u64::MAX);

    for (i, entry) in entries.iter().enumerate() {
        let enlargement = entry.bounds.enlargement(bounds);
        let area = entry.bounds.union(bounds).area();
        let cost = (enlargement, area, entry.id);

        let better = cost
            .0
            .total_cmp(&best_cost.0)
            .then(cost.1.total_cmp(&best_cost.1))
            .then(cost.2.cmp(&best_cost.2))
            == Ordering::Less;
        if better {
            best = i;
            best_cost = cost;
        }
    }
    best
}

/// Splits an overflowing node's entries for forced reinsertion.
///
/// Returns `(kept, evicted)`. The `count` entries whose centres lie farthest
/// from the centre of the whole group are evicted (ties: higher id first).
/// `kept` preserves the original order; `evicted` is ordered closest first,
/// which is the order they are reinserted in.
pub fn select_for_reinsert(entries: Vec<Entry>, count: usize) -> (Vec<Entry>, Vec<Entry>) {
    let group = union_all(&entries);

    let mut ranked: Vec<(usize, f64, u64)> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (i, e.bounds.center_distance_sq(&group), e.id))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.2.cmp(&a.2)));

    let mut evict = vec![false; entries.len()];
    for (i, _, _) in ranked.iter().take(count) {
        evict[*i] = true;
    }

    let mut kept = Vec::with_capacity(entries.len());
    let mut evicted = Vec::with_capacity(count);
    for (i, entry) in entries.into_iter().enumerate() {
        if evict[i] {
            evicted.push(entry);
        } else {
            kept.push(entry);
        }
    }

    // Closest first.
    evicted.sort_by(|a, b| {
        a.bounds
            .center_distance_sq(&group)
            .total_cmp(&b.bounds.center_distance_sq(&group))
            .then(a.id.cmp(&b.id))
    });
    (kept, evicted)
}

#[derive(Clone, Copy)]
enum SortKey {
    Lower,
    Upper,
}

fn sort_on_axis(entries: &[Entry], axis: usize, key: SortKey) -> Vec<Entry> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| {
        let (lo_a, hi_a) = (a.bounds.lower()[axis], a.bounds.upper()[axis]);
        let (lo_b, hi_b) = (b.bounds.lower()[axis], b.bounds.upper()[axis]);
        let primary = match key {
            SortKey::Lower => lo_a.total_cmp(&lo_b).then(hi_a.total_cmp(&hi_b)),
            SortKey::Upper => hi_a.total_cmp(&hi_b).then(lo_a.total_cmp(&lo_b)),
        };
        primary.then(a.id.cmp(&b.id))
    });
    sorted
}

/// Running unions from the left (`prefix[i]` covers `0..=i`) and from the
/// right (`suffix[i]` covers `i..`).
fn running_bounds(sorted: &[Entry]) -> (Vec<Envelope>, Vec<Envelope>) {
    let dimension = sorted[0].bounds.dimension();

    let mut prefix = Vec::with_capacity(sorted.len());
    let mut acc = Envelope::empty(dimension);
    for e in sorted {
        acc.expand(&e.bounds);
        prefix.push(acc.clone());
    }

    let mut suffix = vec![Envelope::empty(dimension); sorted.len()];
    let mut acc = Envelope::empty(dimension);
    for (i, e) in sorted.iter().enumerate().rev() {
        acc.expand(&e.bounds);
        suffix[i] = acc.clone();
    }
    (prefix, suffix)
}

/// R* split of an overflowing entry list into two groups of at least
/// `min_entries` each.
///
/// The split axis is the one whose candidate distributions (both sort
/// orders) have the smallest margin sum. On that axis the distribution with
/// the least overlap wins, then the least total area, then the first found.
pub fn split_entries(entries: Vec<Entry>, min_entries: usize) -> (Vec<Entry>, Vec<Entry>) {
    let n = entries.len();
    let m = min_entries.clamp(1, (n / 2).max(1));
    let dimension = entries[0].bounds.dimension();
    let keys = [SortKey::Lower, SortKey::Upper];

    let mut best_axis = 0;
    let mut best_margin = f64::INFINITY;
    for axis in 0..dimension {
        let mut margin = 0.0;
        for key in keys {
            let sorted = sort_on_axis(&entries, axis, key);
            let (prefix, suffix) = running_bounds(&sorted);
            for k in m..=n - m {
                margin += prefix[k - 1].margin() + suffix[k].margin();
            }
        }
        if margin < best_margin {
            best_margin = margin;
            best_axis = axis;
        }
    }

    let mut best: Option<(f64, f64, Vec<Entry>, usize)> = None;
    for key in keys {
        let sorted = sort_on_axis(&entries, best_axis, key);
        let (prefix, suffix) = running_bounds(&sorted);
        for k in m..=n - m {
            let overlap = prefix[k - 1].overlap(&suffix[k]);
            let area = prefix[k - 1].area() + suffix[k].area();
            let better = match &best {
                None => true,
                Some((best_overlap, best_area, _, _)) => {
                    overlap < *best_overlap || (overlap == *best_overlap && area < *best_area)
                }
            };
            if better {
                best = Some((overlap, area, sorted.clone(), k));
            }
        }
    }

    match best {
        Some((_, _, mut sorted, k)) => {
            let right = sorted.split_off(k);
            (sorted, right)
        }
        // Unreachable for n >= 2; keep everything left rather than panic.
        None => (entries, Vec::new()),
    }
}

fn union_all(entries: &[Entry]) -> Envelope {
    let dimension = entries
        .first()
        .map(|e| e.bounds.dimension())
        .unwrap_or(0);
    let mut bounds = Envelope::empty(dimension);
    for e in entries {
        bounds.expand(&e.bounds);
    }
    bounds
}
