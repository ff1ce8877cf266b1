//! Read paths over the paged tree: lazy range search and best-first
//! nearest-neighbour search.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::page_store::PageStore;
use super::rtree_constants::NIL_PAGE;
use super::rtree_storage::PageBackend;
use super::rtree_types::{ElementId, Node, PageId, SpatialError, SpatialResult};
use crate::envelope::Envelope;

/// Which leaf entries a range search yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Entries whose bounds intersect the query (touching counts).
    Intersects,
    /// Entries whose bounds lie entirely inside the query.
    Within,
}

impl SearchMode {
    fn matches(&self, query: &Envelope, bounds: &Envelope) -> bool {
        match self {
            SearchMode::Intersects => query.intersects(bounds),
            SearchMode::Within => query.contains(bounds),
        }
    }
}

/// A page still to be visited, with what its parent says about it.
#[derive(Debug, Clone, Copy)]
struct PendingPage {
    page_id: PageId,
    parent: PageId,
    level: u32,
}

/// Checks that a node read through a child pointer is the node the parent
/// expects.
pub(crate) fn check_link(node: &Node, parent: PageId, level: u32) -> SpatialResult<()> {
    if node.parent != parent {
        return Err(SpatialError::corrupt(format!(
            "page {} names parent {}, reached from {}",
            node.id, node.parent, parent
        )));
    }
    if node.level() != level || (!node.is_leaf() && level == 0) {
        return Err(SpatialError::corrupt(format!(
            "page {} is at level {}, expected {}",
            node.id,
            node.level(),
            level
        )));
    }
    Ok(())
}

/// Lazy depth-first range search.
///
/// Nodes are read one at a time as the caller pulls results; at most one
/// leaf's worth of matches is buffered. The iterator borrows the tree
/// mutably, so no mutation can interleave with a running search. After the
/// first error it yields nothing more.
pub struct SearchIter<'a, B: PageBackend> {
    store: &'a mut PageStore<B>,
    query: Envelope,
    mode: SearchMode,
    stack: Vec<PendingPage>,
    matches: Vec<ElementId>,
    done: bool,
}

impl<'a, B: PageBackend> SearchIter<'a, B> {
    pub(crate) fn new(store: &'a mut PageStore<B>, query: Envelope, mode: SearchMode) -> Self {
        let stack = vec![PendingPage {
            page_id: store.root(),
            parent: NIL_PAGE,
            level: store.height().saturating_sub(1),
        }];
        Self {
            store,
            query,
            mode,
            stack,
            matches: Vec::new(),
            done: false,
        }
    }

    pub fn query(&self) -> &Envelope {
        &self.query
    }

    fn visit(&mut self, pending: PendingPage) -> SpatialResult<()> {
        let node = self.store.read_node(pending.page_id)?;
        check_link(&node, pending.parent, pending.level)?;

        if node.is_leaf() {
            // Reversed so that popping yields leaf order.
            for entry in node.entries.iter().rev() {
                if self.mode.matches(&self.query, &entry.bounds) {
                    self.matches.push(entry.id);
                }
            }
        } else {
            for entry in node.entries.iter().rev() {
                if self.query.intersects(&entry.bounds) {
                    self.stack.push(PendingPage {
                        page_id: entry.id,
                        parent: node.id,
                        level: pending.level - 1,
                    });
                }
            }
        }
        Ok(())
    }
}

impl<B: PageBackend> Iterator for SearchIter<'_, B> {
    type Item = SpatialResult<ElementId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.matches.pop() {
                return Some(Ok(id));
            }
            if self.done {
                return None;
            }
            let Some(pending) = self.stack.pop() else {
                self.done = true;
                return None;
            };
            if let Err(e) = self.visit(pending) {
                self.done = true;
                self.stack.clear();
                return Some(Err(e));
            }
        }
    }
}

/// One result of a nearest-neighbour search.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: ElementId,
    pub bounds: Envelope,
    /// Euclidean distance from the query point to `bounds`.
    pub distance: f64,
}

enum Candidate {
    Page(PendingPage),
    Element(ElementId, Envelope),
}

struct Queued {
    distance_sq: f64,
    // Elements before pages at equal distance, then by id.
    rank: (u8, u64),
    candidate: Candidate,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed: BinaryHeap is a max-heap and we want the closest first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance_sq
            .total_cmp(&self.distance_sq)
            .then(other.rank.cmp(&self.rank))
    }
}

/// Best-first search for the `k` entries closest to `point`, closest first.
pub(crate) fn nearest<B: PageBackend>(
    store: &mut PageStore<B>,
    point: &[f64],
    k: usize,
) -> SpatialResult<Vec<Neighbor>> {
    let mut results = Vec::with_capacity(k.min(64));
    if k == 0 || store.element_count() == 0 {
        return Ok(results);
    }

    let mut heap = BinaryHeap::new();
    heap.push(Queued {
        distance_sq: 0.0,
        rank: (1, store.root()),
        candidate: Candidate::Page(PendingPage {
            page_id: store.root(),
            parent: NIL_PAGE,
            level: store.height().saturating_sub(1),
        }),
    });

    while let Some(queued) = heap.pop() {
        match queued.candidate {
            Candidate::Element(id, bounds) => {
                results.push(Neighbor {
                    id,
                    bounds,
                    distance: queued.distance_sq.sqrt(),
                });
                if results.len() == k {
                    break;
                }
            }
            Candidate::Page(pending) => {
                let node = store.read_node(pending.page_id)?;
                check_link(&node, pending.parent, pending.level)?;
                let is_leaf = node.is_leaf();

                for entry in node.entries {
                    let distance_sq = entry.bounds.min_distance_sq(point);
                    let queued = if is_leaf {
                        Queued {
                            distance_sq,
                            rank: (0, entry.id),
                            candidate: Candidate::Element(entry.id, entry.bounds),
                        }
                    } else {
                        Queued {
                            distance_sq,
                            rank: (1, entry.id),
                            candidate: Candidate::Page(PendingPage {
                                page_id: entry.id,
                                parent: node.id,
                                level: pending.level - 1,
                            }),
                        }
                    };
                    heap.push(queued);
                }
            }
        }
    }
    Ok(results)
}
