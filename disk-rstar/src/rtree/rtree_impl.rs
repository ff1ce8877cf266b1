//! RStarTree implementation.
//!
//! The tree is expressed purely in page ids: every node is read from and
//! written back to the [`PageStore`], and the only in-memory state kept
//! between calls is the store itself plus the derived fill parameters.

use std::collections::HashSet;

use super::page_store::PageStore;
use super::persistence::IntegrityReport;
use super::rtree_constants::NIL_PAGE;
use super::rtree_search::{check_link, nearest, Neighbor, SearchIter, SearchMode};
use super::rtree_split::{choose_subtree, select_for_reinsert, split_entries};
use super::rtree_storage::PageBackend;
use super::rtree_types::{
    ElementId, Entry, Node, PageId, RTreeStats, SpatialError, SpatialResult,
};
use crate::config::{OpenOptions, TreeConfig, TreeOptions};
use crate::envelope::Envelope;

/// Levels that already had their one forced reinsertion during the current
/// top-level insert.
#[derive(Debug, Default)]
struct OverflowLevels(Vec<bool>);

impl OverflowLevels {
    /// Marks `level` and returns true if this is its first overflow.
    fn first_at(&mut self, level: u32) -> bool {
        let level = level as usize;
        if self.0.len() <= level {
            self.0.resize(level + 1, false);
        }
        !std::mem::replace(&mut self.0[level], true)
    }
}

/// Disk-backed R*-tree keyed by [`Envelope`] and storing opaque element ids.
///
/// All operations take `&mut self`: one tree instance has one logical writer,
/// and callers that share it across threads wrap it in their own lock.
///
/// # Examples
///
/// ```rust
/// use disk_rstar::{Envelope, MemoryBackend, RStarTree, TreeConfig};
///
/// let mut tree = RStarTree::create(MemoryBackend::new(), &TreeConfig::new(2, 8)).unwrap();
/// tree.insert(Envelope::from_corners(0.0, 0.0, 1.0, 1.0).unwrap(), 7).unwrap();
///
/// let query = Envelope::from_corners(0.5, 0.5, 3.0, 3.0).unwrap();
/// let hits: Vec<u64> = tree.search(&query).unwrap().collect::<Result<_, _>>().unwrap();
/// assert_eq!(hits, vec![7]);
/// ```
pub struct RStarTree<B: PageBackend> {
    store: PageStore<B>,
    min_entries: usize,
    reinsert_count: usize,
    forced_reinsertions: u64,
    splits: u64,
}

impl<B: PageBackend> RStarTree<B> {
    /// Creates an empty tree on `backend`: a fresh header and a single empty
    /// root leaf.
    pub fn create(backend: B, config: &TreeConfig) -> SpatialResult<Self> {
        let store = PageStore::create(backend, config)?;
        log::debug!(
            "Created R*-tree: dimension={}, max_elements={}",
            config.dimension(),
            config.max_elements()
        );
        Ok(Self::with_store(store, config.options()))
    }

    /// Opens an existing tree. Only the header and the root node are read.
    pub fn open(backend: B, options: &OpenOptions) -> SpatialResult<Self> {
        let mut store = PageStore::open(backend, options)?;
        let root = store.read_node(store.root())?;
        check_link(&root, NIL_PAGE, store.height() - 1)?;

        log::debug!(
            "Opened R*-tree: {} elements, height {}",
            store.element_count(),
            store.height()
        );
        Ok(Self::with_store(store, options.options()))
    }

    fn with_store(store: PageStore<B>, options: &TreeOptions) -> Self {
        let max_elements = store.max_elements();
        Self {
            min_entries: options.min_entries(max_elements),
            reinsert_count: options.reinsert_count(max_elements),
            forced_reinsertions: 0,
            splits: 0,
            store,
        }
    }

    fn ensure_open(&self) -> SpatialResult<()> {
        if self.store.is_open() {
            Ok(())
        } else {
            Err(SpatialError::Closed)
        }
    }

    fn check_dimension(&self, envelope: &Envelope) -> SpatialResult<()> {
        if envelope.dimension() != self.store.dimension() {
            return Err(SpatialError::DimensionMismatch {
                expected: self.store.dimension(),
                found: envelope.dimension(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Number of indexed entries.
    pub fn len(&self) -> u64 {
        self.store.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels; an empty or single-leaf tree has height 1.
    pub fn height(&self) -> u32 {
        self.store.height()
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }

    pub fn max_elements(&self) -> usize {
        self.store.max_elements()
    }

    /// Minimum entries per non-root node.
    pub fn min_entries(&self) -> usize {
        self.min_entries
    }

    /// The CRS descriptor stored at creation, byte for byte.
    pub fn crs_descriptor(&self) -> &[u8] {
        self.store.crs_descriptor()
    }

    pub fn stats(&self) -> RTreeStats {
        RTreeStats {
            forced_reinsertions: self.forced_reinsertions,
            splits: self.splits,
            ..self.store.stats()
        }
    }

    /// Bounds of everything in the tree, or `None` when it is empty.
    pub fn bounds(&mut self) -> SpatialResult<Option<Envelope>> {
        self.ensure_open()?;
        let root = self.store.read_node(self.store.root())?;
        if root.bounds.is_empty() {
            Ok(None)
        } else {
            Ok(Some(root.bounds))
        }
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    fn read_root(&mut self) -> SpatialResult<Node> {
        let root = self.store.read_node(self.store.root())?;
        check_link(&root, NIL_PAGE, self.store.height() - 1)?;
        Ok(root)
    }

    /// Reads a child through its parent and checks the link both ways.
    fn read_child(&mut self, parent: &Node, child_id: PageId) -> SpatialResult<Node> {
        let child = self.store.read_node(child_id)?;
        check_link(&child, parent.id, parent.level() - 1)?;
        Ok(child)
    }

    /// Reads the parent of `node` and locates `node` in it.
    fn read_parent(&mut self, node: &Node) -> SpatialResult<(Node, usize)> {
        let parent = self.store.read_node(node.parent)?;
        if parent.level() != node.level() + 1 {
            return Err(SpatialError::corrupt(format!(
                "page {} at level {} has parent {} at level {}",
                node.id,
                node.level(),
                parent.id,
                parent.level()
            )));
        }
        let pos = parent.position_of(node.id).ok_or_else(|| {
            SpatialError::corrupt(format!(
                "page {} names parent {} which does not reference it",
                node.id, parent.id
            ))
        })?;
        Ok((parent, pos))
    }

    /// Rewrites the parent pointer of each child page to `parent_id`.
    fn adopt(&mut self, parent_id: PageId, children: &[Entry]) -> SpatialResult<()> {
        for entry in children {
            let mut child = self.store.read_node(entry.id)?;
            if child.parent != parent_id {
                child.parent = parent_id;
                self.store.write_node(&child)?;
            }
        }
        Ok(())
    }

    /// Propagates a node's (already written) bounds up the tree, stopping as
    /// soon as an ancestor's entry is unchanged.
    fn adjust_ancestors(&mut self, node: &Node) -> SpatialResult<()> {
        let mut bounds = node.bounds.clone();
        let mut current = node.clone();

        while !current.is_root() {
            let (mut parent, pos) = self.read_parent(&current)?;
            if parent.entries[pos].bounds == bounds {
                break;
            }
            parent.entries[pos].bounds = bounds;
            parent.recompute_bounds();
            self.store.write_node(&parent)?;

            bounds = parent.bounds.clone();
            current = parent;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts `id` under `envelope`. Duplicate pairs are stored twice.
    pub fn insert(&mut self, envelope: Envelope, id: ElementId) -> SpatialResult<()> {
        self.ensure_open()?;
        self.check_dimension(&envelope)?;
        if envelope.is_empty() {
            return Err(SpatialError::InvalidEnvelope(
                "cannot index the empty envelope".into(),
            ));
        }

        let mut overflow = OverflowLevels::default();
        self.insert_at_level(Entry::new(envelope, id), 0, &mut overflow)?;

        self.store.set_element_count(self.store.element_count() + 1);
        self.store.commit()
    }

    /// Descends from the root to the node at `level` that should hold
    /// `bounds`.
    fn choose_node(&mut self, bounds: &Envelope, level: u32) -> SpatialResult<Node> {
        let mut node = self.read_root()?;
        if node.level() < level {
            return Err(SpatialError::corrupt(format!(
                "cannot place an entry at level {} in a tree of height {}",
                level,
                self.store.height()
            )));
        }

        while node.level() > level {
            let idx = choose_subtree(&node.entries, bounds);
            let child_id = node
                .entries
                .get(idx)
                .map(|e| e.id)
                .ok_or_else(|| {
                    SpatialError::corrupt(format!("internal page {} has no children", node.id))
                })?;
            node = self.read_child(&node, child_id)?;
        }
        Ok(node)
    }

    /// Places `entry` into a node at `level`. For `level > 0` the entry is a
    /// whole subtree and its root page is re-parented.
    fn insert_at_level(
        &mut self,
        entry: Entry,
        level: u32,
        overflow: &mut OverflowLevels,
    ) -> SpatialResult<()> {
        let mut node = self.choose_node(&entry.bounds, level)?;
        if level > 0 {
            self.adopt(node.id, std::slice::from_ref(&entry))?;
        }
        node.entries.push(entry);
        self.settle(node, overflow)
    }

    /// Writes a node that just gained an entry, applying overflow treatment
    /// when it holds more than `max_elements`.
    fn settle(&mut self, mut node: Node, overflow: &mut OverflowLevels) -> SpatialResult<()> {
        if node.len() <= self.store.max_elements() {
            node.recompute_bounds();
            self.store.write_node(&node)?;
            return self.adjust_ancestors(&node);
        }

        if !node.is_root() && overflow.first_at(node.level()) {
            self.reinsert(node, overflow)
        } else {
            self.split(node, overflow)
        }
    }

    /// Forced reinsertion: evicts the entries farthest from the node centre
    /// and inserts them again from the root at the same level.
    fn reinsert(&mut self, mut node: Node, overflow: &mut OverflowLevels) -> SpatialResult<()> {
        let level = node.level();
        let entries = std::mem::take(&mut node.entries);
        let (kept, evicted) = select_for_reinsert(entries, self.reinsert_count);
        self.forced_reinsertions += 1;

        log::trace!(
            "Forced reinsertion of {} entries from page {} at level {}",
            evicted.len(),
            node.id,
            level
        );

        node.entries = kept;
        node.recompute_bounds();
        self.store.write_node(&node)?;
        self.adjust_ancestors(&node)?;

        for entry in evicted {
            self.insert_at_level(entry, level, overflow)?;
        }
        Ok(())
    }

    /// Splits an overflowing node in two and pushes the new half into the
    /// parent, growing a new root if the split node was the root.
    fn split(&mut self, node: Node, overflow: &mut OverflowLevels) -> SpatialResult<()> {
        let level = node.level();
        let dimension = self.store.dimension();
        let (left_entries, right_entries) = split_entries(node.entries, self.min_entries);
        self.splits += 1;

        let right_id = self.store.allocate_node()?;
        let mut left = Node {
            id: node.id,
            parent: node.parent,
            kind: node.kind,
            bounds: Envelope::empty(dimension),
            entries: left_entries,
        };
        let mut right = Node {
            id: right_id,
            parent: node.parent,
            kind: node.kind,
            bounds: Envelope::empty(dimension),
            entries: right_entries,
        };
        left.recompute_bounds();
        right.recompute_bounds();

        log::trace!(
            "Split page {} at level {} into {} + {} (new page {})",
            left.id,
            level,
            left.len(),
            right.len(),
            right_id
        );

        if level > 0 {
            self.adopt(right_id, &right.entries)?;
        }

        if left.is_root() {
            let root_id = self.store.allocate_node()?;
            let mut root = Node::new_internal(root_id, NIL_PAGE, level + 1, dimension);
            root.entries.push(Entry::new(left.bounds.clone(), left.id));
            root.entries.push(Entry::new(right.bounds.clone(), right.id));
            root.recompute_bounds();

            left.parent = root_id;
            right.parent = root_id;
            self.store.write_node(&left)?;
            self.store.write_node(&right)?;
            self.store.write_node(&root)?;
            self.store.set_root(root_id, level + 2);

            log::trace!("Root split: new root page {}, height {}", root_id, level + 2);
            return Ok(());
        }

        self.store.write_node(&left)?;
        self.store.write_node(&right)?;

        let (mut parent, pos) = self.read_parent(&left)?;
        parent.entries[pos].bounds = left.bounds.clone();
        parent.entries.push(Entry::new(right.bounds.clone(), right.id));
        self.settle(parent, overflow)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Removes the entry with exactly these bounds and id.
    ///
    /// Fails with `NotFound`, leaving the tree untouched, when no such entry
    /// exists.
    pub fn delete(&mut self, envelope: &Envelope, id: ElementId) -> SpatialResult<()> {
        self.ensure_open()?;
        self.check_dimension(envelope)?;

        let Some((mut leaf, pos)) = self.find_leaf(envelope, id)? else {
            return Err(SpatialError::NotFound(format!(
                "no entry {} with bounds {}",
                id, envelope
            )));
        };

        leaf.entries.remove(pos);
        let orphans = self.condense(leaf)?;
        self.store
            .set_element_count(self.store.element_count().saturating_sub(1));

        self.reset_empty_root()?;
        self.reinsert_orphans(orphans)?;
        self.shrink_root()?;
        self.store.commit()
    }

    /// Depth-first search for the leaf holding `(envelope, id)`, descending
    /// only into children whose bounds contain `envelope`.
    fn find_leaf(
        &mut self,
        envelope: &Envelope,
        id: ElementId,
    ) -> SpatialResult<Option<(Node, usize)>> {
        let root = self.read_root()?;
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            if node.is_leaf() {
                if let Some(pos) = node
                    .entries
                    .iter()
                    .position(|e| e.id == id && e.bounds == *envelope)
                {
                    return Ok(Some((node, pos)));
                }
                continue;
            }
            for entry in node.entries.iter().rev() {
                if entry.bounds.contains(envelope) {
                    let child = self.read_child(&node, entry.id)?;
                    stack.push(child);
                }
            }
        }
        Ok(None)
    }

    /// Walks from a leaf that just lost an entry up to the root. Underfull
    /// nodes are unlinked and freed; their entries are returned tagged with
    /// the level they must be reinserted at.
    fn condense(&mut self, leaf: Node) -> SpatialResult<Vec<(u32, Entry)>> {
        let mut orphans = Vec::new();
        let mut node = leaf;

        while !node.is_root() {
            let (mut parent, pos) = self.read_parent(&node)?;

            if node.len() < self.min_entries {
                parent.entries.remove(pos);
                let level = node.level();
                log::trace!(
                    "Condensing page {} at level {}: {} entries to reinsert",
                    node.id,
                    level,
                    node.len()
                );
                orphans.extend(node.entries.drain(..).map(|e| (level, e)));
                self.store.free_node(node.id)?;
            } else {
                node.recompute_bounds();
                self.store.write_node(&node)?;
                parent.entries[pos].bounds = node.bounds.clone();
            }
            node = parent;
        }

        node.recompute_bounds();
        self.store.write_node(&node)?;
        Ok(orphans)
    }

    /// An internal root left without children becomes an empty leaf.
    fn reset_empty_root(&mut self) -> SpatialResult<()> {
        let root = self.read_root()?;
        if !root.is_leaf() && root.is_empty() {
            let leaf = Node::new_leaf(root.id, NIL_PAGE, self.store.dimension());
            self.store.write_node(&leaf)?;
            self.store.set_root(leaf.id, 1);
            log::trace!("Root page {} reset to an empty leaf", leaf.id);
        }
        Ok(())
    }

    /// Reinserts condensed entries, highest level first. A subtree taller
    /// than the remaining tree is flattened into its leaf entries.
    fn reinsert_orphans(&mut self, mut orphans: Vec<(u32, Entry)>) -> SpatialResult<()> {
        orphans.sort_by(|a, b| b.0.cmp(&a.0));

        for (level, entry) in orphans {
            let root_level = self.store.height() - 1;
            if level <= root_level {
                let mut overflow = OverflowLevels::default();
                self.insert_at_level(entry, level, &mut overflow)?;
            } else {
                for leaf_entry in self.drain_subtree(entry.id, level - 1)? {
                    let mut overflow = OverflowLevels::default();
                    self.insert_at_level(leaf_entry, 0, &mut overflow)?;
                }
            }
        }
        Ok(())
    }

    /// Frees every page of a detached subtree and returns its leaf entries.
    fn drain_subtree(&mut self, page_id: PageId, level: u32) -> SpatialResult<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut stack = vec![(page_id, level)];

        while let Some((page_id, level)) = stack.pop() {
            let node = self.store.read_node(page_id)?;
            if node.level() != level {
                return Err(SpatialError::corrupt(format!(
                    "page {} is at level {}, expected {}",
                    page_id,
                    node.level(),
                    level
                )));
            }
            if node.is_leaf() {
                entries.extend(node.entries);
            } else {
                stack.extend(node.entries.iter().map(|e| (e.id, level - 1)));
            }
            self.store.free_node(page_id)?;
        }
        Ok(entries)
    }

    /// While the root is internal with a single child, that child becomes
    /// the root.
    fn shrink_root(&mut self) -> SpatialResult<()> {
        loop {
            let root = self.read_root()?;
            if root.is_leaf() || root.len() != 1 {
                return Ok(());
            }

            let mut child = self.read_child(&root, root.entries[0].id)?;
            child.parent = NIL_PAGE;
            self.store.write_node(&child)?;
            self.store.free_node(root.id)?;
            self.store.set_root(child.id, self.store.height() - 1);

            log::trace!(
                "Root shrunk to page {}, height {}",
                child.id,
                self.store.height()
            );
        }
    }

    /// Removes every entry, returning all pages but the root to the free list.
    pub fn clear(&mut self) -> SpatialResult<()> {
        self.ensure_open()?;
        let root = self.read_root()?;

        if !root.is_leaf() {
            for entry in &root.entries {
                self.drain_subtree(entry.id, root.level() - 1)?;
            }
        }

        let leaf = Node::new_leaf(root.id, NIL_PAGE, self.store.dimension());
        self.store.write_node(&leaf)?;
        self.store.set_root(leaf.id, 1);
        self.store.set_element_count(0);
        self.store.commit()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Lazily yields the id of every entry whose bounds intersect `query`.
    pub fn search(&mut self, query: &Envelope) -> SpatialResult<SearchIter<'_, B>> {
        self.search_with(query, SearchMode::Intersects)
    }

    /// Lazily yields the id of every entry whose bounds lie inside `query`.
    pub fn search_within(&mut self, query: &Envelope) -> SpatialResult<SearchIter<'_, B>> {
        self.search_with(query, SearchMode::Within)
    }

    pub fn search_with(
        &mut self,
        query: &Envelope,
        mode: SearchMode,
    ) -> SpatialResult<SearchIter<'_, B>> {
        self.ensure_open()?;
        self.check_dimension(query)?;
        Ok(SearchIter::new(&mut self.store, query.clone(), mode))
    }

    /// The `k` entries closest to `point`, closest first. Distance is
    /// measured to the nearest point of each entry's bounds.
    pub fn nearest(&mut self, point: &[f64], k: usize) -> SpatialResult<Vec<Neighbor>> {
        self.ensure_open()?;
        if point.len() != self.store.dimension() {
            return Err(SpatialError::DimensionMismatch {
                expected: self.store.dimension(),
                found: point.len(),
            });
        }
        nearest(&mut self.store, point, k)
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Walks every reachable node and the free list, checking parent links,
    /// levels, tight bounds, fill and the element count. Corrupt pages are
    /// reported rather than returned as errors.
    pub fn check_integrity(&mut self) -> SpatialResult<IntegrityReport> {
        self.ensure_open()?;
        let mut report = IntegrityReport::new();
        let mut visited = HashSet::new();
        let max_elements = self.store.max_elements();

        let root_id = self.store.root();
        let mut stack: Vec<(PageId, PageId, u32, Option<Envelope>)> =
            vec![(root_id, NIL_PAGE, self.store.height() - 1, None)];

        while let Some((page_id, parent, level, expected_bounds)) = stack.pop() {
            if !visited.insert(page_id) {
                report.fail(format!("page {} is reachable twice", page_id));
                continue;
            }
            report.pages_checked += 1;

            let node = match self.store.read_node(page_id) {
                Ok(node) => node,
                Err(e @ SpatialError::CorruptStructure(_)) => {
                    report.corrupt_page(page_id, &e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Err(e) = check_link(&node, parent, level) {
                report.corrupt_page(page_id, &e);
                continue;
            }

            if node.bounds != node.compute_bounds() {
                report.fail(format!("page {} bounds are not tight", page_id));
            }
            if let Some(expected) = expected_bounds {
                if expected != node.bounds {
                    report.fail(format!(
                        "parent {} holds stale bounds for page {}",
                        parent, page_id
                    ));
                }
            }
            if node.len() > max_elements {
                report.fail(format!(
                    "page {} holds {} entries, fan-out is {}",
                    page_id,
                    node.len(),
                    max_elements
                ));
            }
            if page_id != root_id && node.len() < self.min_entries {
                report.fail(format!(
                    "page {} holds {} entries, minimum is {}",
                    page_id,
                    node.len(),
                    self.min_entries
                ));
            }

            if node.is_leaf() {
                report.entries_found += node.len() as u64;
            } else {
                for entry in &node.entries {
                    stack.push((entry.id, node.id, level - 1, Some(entry.bounds.clone())));
                }
            }
        }

        if report.corrupted_pages.is_empty() && report.entries_found != self.store.element_count()
        {
            report.fail(format!(
                "header counts {} elements, leaves hold {}",
                self.store.element_count(),
                report.entries_found
            ));
        }

        let free: HashSet<PageId> = match self.store.free_pages() {
            Ok(pages) => pages.into_iter().collect(),
            Err(e) => {
                report.fail(format!("free list is broken: {}", e));
                HashSet::new()
            }
        };
        for page_id in free.intersection(&visited) {
            report.fail(format!("page {} is both in the tree and free", page_id));
        }

        for page_id in 0..self.store.next_page_id() {
            if !visited.contains(&page_id) && !free.contains(&page_id) {
                report.orphaned_pages.push(page_id);
            }
        }
        if !report.orphaned_pages.is_empty() {
            report.fail(format!(
                "{} pages are neither in the tree nor free",
                report.orphaned_pages.len()
            ));
        }

        Ok(report)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Writes buffered pages and the header, then syncs the medium.
    pub fn flush(&mut self) -> SpatialResult<()> {
        self.store.flush()
    }

    /// Flushes and releases the medium. Later calls, including a second
    /// `close`, fail with `Closed`.
    pub fn close(&mut self) -> SpatialResult<()> {
        self.store.close()
    }

    pub fn is_open(&self) -> bool {
        self.store.is_open()
    }

    /// Flushes and hands back the backing medium.
    pub fn into_backend(self) -> SpatialResult<B> {
        self.store.into_backend()
    }
}
