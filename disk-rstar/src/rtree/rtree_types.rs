//! Core types and data structures for the paged R*-tree.
//!
//! This module defines the fundamental types used throughout the tree:
//! - Error types and result types
//! - Node types (leaf and internal) and their entries
//! - Statistics structures
//! - File header

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use super::rtree_constants::NIL_PAGE;
use crate::envelope::Envelope;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in spatial index operations
#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Not a spatial index file (magic {0:#010x})")]
    BadMagic(u32),

    #[error("Unsupported file format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    #[error("Corrupt structure: {0}")]
    CorruptStructure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Backing medium already holds a spatial index, open it instead")]
    AlreadyExists,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Tree is closed")]
    Closed,
}

impl SpatialError {
    /// Format and corruption errors: the instance (or file) is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SpatialError::BadMagic(_)
                | SpatialError::UnsupportedVersion { .. }
                | SpatialError::CorruptHeader(_)
                | SpatialError::CorruptStructure(_)
        )
    }

    /// Errors a caller is expected to handle and carry on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SpatialError::NotFound(_))
    }

    /// True for the open-time format errors (bad magic, version, header).
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            SpatialError::BadMagic(_)
                | SpatialError::UnsupportedVersion { .. }
                | SpatialError::CorruptHeader(_)
        )
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("R*-tree corruption detected: {}", msg);
        SpatialError::CorruptStructure(msg)
    }
}

/// Result type for spatial operations
pub type SpatialResult<T> = Result<T, SpatialError>;

/// Opaque element identifier stored in leaf entries
pub type ElementId = u64;

/// Page ID - index of a node slot in the page store
pub type PageId = u64;

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about tree shape and page store activity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RTreeStats {
    pub total_entries: u64,
    pub tree_height: u32,
    pub allocated_pages: u64,
    pub free_pages: u64,
    pub cached_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    /// Overflows resolved by forced reinsertion since the tree was opened.
    pub forced_reinsertions: u64,
    /// Node splits since the tree was opened, root splits included.
    pub splits: u64,
}

// ============================================================================
// Node Types
// ============================================================================

/// A slot in a node: an element reference in a leaf, a child page in an
/// internal node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub bounds: Envelope,
    pub id: u64,
}

impl Entry {
    pub fn new(bounds: Envelope, id: u64) -> Self {
        Self { bounds, id }
    }
}

/// Leaf or internal, with the internal node's height above the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf,
    Internal { level: u32 },
}

/// A persisted tree node, addressed by its own page id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: PageId,
    pub parent: PageId,
    pub kind: NodeKind,
    pub bounds: Envelope,
    pub entries: Vec<Entry>,
}

impl Node {
    pub fn new_leaf(id: PageId, parent: PageId, dimension: usize) -> Self {
        Self {
            id,
            parent,
            kind: NodeKind::Leaf,
            bounds: Envelope::empty(dimension),
            entries: Vec::new(),
        }
    }

    pub fn new_internal(id: PageId, parent: PageId, level: u32, dimension: usize) -> Self {
        Self {
            id,
            parent,
            kind: NodeKind::Internal { level },
            bounds: Envelope::empty(dimension),
            entries: Vec::new(),
        }
    }

    /// Height above the leaf level (leaves are 0)
    pub fn level(&self) -> u32 {
        match self.kind {
            NodeKind::Leaf => 0,
            NodeKind::Internal { level } => level,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    pub fn is_root(&self) -> bool {
        self.parent == NIL_PAGE
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tight union of all entry bounds; empty when the node has no entries.
    pub fn compute_bounds(&self) -> Envelope {
        let mut bounds = Envelope::empty(self.bounds.dimension());
        for e in &self.entries {
            bounds.expand(&e.bounds);
        }
        bounds
    }

    pub fn recompute_bounds(&mut self) {
        self.bounds = self.compute_bounds();
    }

    pub fn position_of(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

// ============================================================================
// File Header
// ============================================================================

/// Header body stored after the raw magic/version prefix at offset 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    pub max_elements: u32,
    pub dimension: u32,
    pub record_size: u32,
    pub root_node_id: PageId,
    pub element_count: u64,
    pub free_list_head: PageId,
    pub free_page_count: u64,
    pub next_page_id: PageId,
    pub height: u32,
    pub crs_descriptor: Vec<u8>,
}

impl FileHeader {
    pub fn new(
        max_elements: usize,
        dimension: usize,
        record_size: usize,
        crs_descriptor: Vec<u8>,
    ) -> Self {
        Self {
            max_elements: max_elements as u32,
            dimension: dimension as u32,
            record_size: record_size as u32,
            root_node_id: 0,
            element_count: 0,
            free_list_head: NIL_PAGE,
            free_page_count: 0,
            next_page_id: 1,
            height: 1,
            crs_descriptor,
        }
    }
}

// ============================================================================
// Checksums
// ============================================================================

/// CRC32-MPEG2 over a byte slice.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}
