//! Constants for the paged R*-tree file format and its defaults.

use super::rtree_types::PageId;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x5253_5458; // "RSTX"

/// File format version
pub const VERSION: u32 = 1;

/// Sentinel page id: "no page" (root parent, end of the free list)
pub const NIL_PAGE: PageId = u64::MAX;

/// Default read/write buffer size; grown to the worst-case node record
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default cache size in number of pages
pub const DEFAULT_CACHE_PAGES: usize = 256;

/// Share of an overflowing node's entries evicted for forced reinsertion
pub const DEFAULT_REINSERT_FRACTION: f64 = 0.30;

/// Minimum node fill as a share of `max_elements`
pub const DEFAULT_MIN_FILL_FRACTION: f64 = 0.40;

/// Smallest fan-out that can still be split
pub const MIN_MAX_ELEMENTS: usize = 2;

/// Sanity bound on fan-out read from a header
pub const MAX_MAX_ELEMENTS: usize = 65_536;

/// Sanity bound on dimensionality read from a header
pub const MAX_DIMENSION: usize = 64;

/// Raw header prefix: magic, version, header size, body length, body crc
pub const HEADER_PREFIX_LEN: usize = 20;

/// The header region is padded to a multiple of this
pub const HEADER_ALIGN: usize = 512;

/// Node slot prefix: tag, 3 reserved bytes, payload length, payload crc
pub const SLOT_PREFIX_LEN: usize = 12;

/// Slot tag of a live node record
pub const TAG_NODE: u8 = 0x4E;

/// Slot tag of a page sitting on the free list
pub const TAG_FREE: u8 = 0x46;
