//! Reliability features for the paged tree.
//!
//! This module provides:
//! - The on-disk encoding of free-list records
//! - The report produced by a full integrity walk

use super::rtree_constants::{SLOT_PREFIX_LEN, TAG_FREE};
use super::rtree_types::{crc32, PageId, SpatialError, SpatialResult};

// ============================================================================
// Free List Records
// ============================================================================

/// Bytes written when a page is freed: the slot prefix plus the next id.
pub const FREE_RECORD_LEN: usize = SLOT_PREFIX_LEN + 8;

/// Encodes a free-list link into `out[..FREE_RECORD_LEN]`.
///
/// Only the prefix and the first 8 payload bytes of the slot are touched;
/// the old node payload behind them stays on disk until the page is reused.
pub fn encode_free_record(next_free: PageId, out: &mut [u8]) {
    let link = next_free.to_le_bytes();
    out[0] = TAG_FREE;
    out[1..4].fill(0);
    out[4..8].copy_from_slice(&(link.len() as u32).to_le_bytes());
    out[8..12].copy_from_slice(&crc32(&link).to_le_bytes());
    out[SLOT_PREFIX_LEN..FREE_RECORD_LEN].copy_from_slice(&link);
}

/// Decodes the free-list link stored in the slot of `page_id`.
pub fn decode_free_record(page_id: PageId, raw: &[u8]) -> SpatialResult<PageId> {
    if raw.len() < FREE_RECORD_LEN {
        return Err(SpatialError::corrupt(format!(
            "free record of page {} is truncated",
            page_id
        )));
    }
    if raw[0] != TAG_FREE {
        return Err(SpatialError::corrupt(format!(
            "free list points at page {} which is not free (tag {:#04x})",
            page_id, raw[0]
        )));
    }
    let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if len != 8 {
        return Err(SpatialError::corrupt(format!(
            "free record of page {} has length {}",
            page_id, len
        )));
    }
    let crc = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    let link = &raw[SLOT_PREFIX_LEN..FREE_RECORD_LEN];
    if crc32(link) != crc {
        return Err(SpatialError::corrupt(format!(
            "checksum mismatch in free record of page {}",
            page_id
        )));
    }

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(link);
    Ok(PageId::from_le_bytes(bytes))
}

// ============================================================================
// Integrity Checking
// ============================================================================

/// Result of integrity check operation
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    /// Total pages checked
    pub pages_checked: u64,
    /// Leaf entries reached from the root
    pub entries_found: u64,
    /// Pages that could not be read or decoded
    pub corrupted_pages: Vec<PageId>,
    /// Allocated pages neither reachable from the root nor on the free list
    pub orphaned_pages: Vec<PageId>,
    /// Summary of findings
    pub is_valid: bool,
    /// Detailed error messages
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn new() -> Self {
        Self {
            pages_checked: 0,
            entries_found: 0,
            corrupted_pages: Vec::new(),
            orphaned_pages: Vec::new(),
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.is_valid = false;
        self.errors.push(message);
    }

    pub(crate) fn corrupt_page(&mut self, page_id: PageId, error: &SpatialError) {
        self.corrupted_pages.push(page_id);
        self.fail(format!("page {}: {}", page_id, error));
    }
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
