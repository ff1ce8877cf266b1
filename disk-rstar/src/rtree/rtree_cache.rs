//! LRU page cache for tree nodes.
//!
//! Pages are only loaded when first accessed. The cache is write-back: a
//! modified node stays dirty in memory until it is evicted or flushed, and
//! evicting a dirty page hands it back to the caller for writing.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::rtree_types::{Node, PageId};

/// A cached page with its data and dirty flag
pub struct CachedPage {
    pub node: Node,
    pub dirty: bool,
}

/// Bounded LRU cache of decoded nodes keyed by page id.
pub struct PageCache {
    pages: LruCache<PageId, CachedPage>,
}

impl PageCache {
    /// Creates a cache holding at most `max_pages` nodes. Returns `None`
    /// for a zero capacity, which means caching is disabled.
    pub fn new(max_pages: usize) -> Option<Self> {
        NonZeroUsize::new(max_pages).map(|cap| Self {
            pages: LruCache::new(cap),
        })
    }

    /// Looks up a page and marks it most recently used.
    pub fn get(&mut self, page_id: PageId) -> Option<&Node> {
        self.pages.get(&page_id).map(|cached| &cached.node)
    }

    /// Stores a node. If this pushes out a different page that is dirty,
    /// that page is returned so it can be written.
    pub fn insert(&mut self, page_id: PageId, node: Node, dirty: bool) -> Option<(PageId, Node)> {
        // A re-insert of a dirty page must stay dirty until it is written.
        let dirty = dirty
            || self
                .pages
                .peek(&page_id)
                .map(|cached| cached.dirty)
                .unwrap_or(false);

        match self.pages.push(page_id, CachedPage { node, dirty }) {
            Some((evicted_id, evicted)) if evicted_id != page_id && evicted.dirty => {
                Some((evicted_id, evicted.node))
            }
            _ => None,
        }
    }

    /// Ids of all pages with unwritten changes, in ascending order.
    pub fn dirty_pages(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self
            .pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns a page without touching the LRU order.
    pub fn peek(&self, page_id: PageId) -> Option<&Node> {
        self.pages.peek(&page_id).map(|cached| &cached.node)
    }

    pub fn mark_clean(&mut self, page_id: PageId) {
        if let Some(cached) = self.pages.peek_mut(&page_id) {
            cached.dirty = false;
        }
    }

    /// Drops a page without writing it.
    pub fn remove(&mut self, page_id: PageId) -> Option<CachedPage> {
        self.pages.pop(&page_id)
    }

    /// Drops everything without writing anything.
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains(&page_id)
    }
}
