//! Disk-based R*-tree implementation for memory-efficient spatial indexing.
//!
//! This module provides the paged tree with:
//! - Fixed-size node slots in a self-describing file (or memory image)
//! - An LRU write-back cache for hot pages
//! - Lazy loading of nodes on demand (never loads all data at once)
//! - R*-tree insertion (forced reinsertion, margin/overlap split) and
//!   deletion with condensation
//!
//! Unlike in-memory R-Trees, this implementation is meant for datasets
//! that exceed available RAM while maintaining good query performance.

pub mod page_store;
pub mod persistence;
pub mod rtree_cache;
pub mod rtree_constants;
pub mod rtree_search;
pub mod rtree_split;
pub mod rtree_storage;
pub mod rtree_types;
mod rtree_impl;

pub use page_store::{worst_case_record_size, PageStore};
pub use persistence::IntegrityReport;
pub use rtree_constants::{DEFAULT_CACHE_PAGES, NIL_PAGE};
pub use rtree_impl::RStarTree;
pub use rtree_search::{Neighbor, SearchIter, SearchMode};
pub use rtree_storage::{FileBackend, MemoryBackend, PageBackend};
pub use rtree_types::{
    ElementId, Entry, FileHeader, Node, NodeKind, PageId, RTreeStats, SpatialError,
    SpatialResult,
};
