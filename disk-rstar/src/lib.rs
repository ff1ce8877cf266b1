//! # Disk R*-tree - Paged Spatial Index
//!
//! This crate provides a disk-backed, bulk-mutable R*-tree over
//! n-dimensional bounding boxes, plus a thin facade that maps caller
//! elements to the opaque ids stored in the tree.
//!
//! ## Features
//!
//! - **Disk-Based Storage**: Fixed-size node slots, loaded on demand
//! - **LRU Cache**: Frequently accessed pages kept in memory, written back lazily
//! - **Self-Describing Files**: Magic, version, fan-out, dimension and CRS descriptor in the header
//! - **R\* Insertion**: Forced reinsertion and margin/overlap driven splits
//! - **Condensing Delete**: Underfull nodes are dissolved and their entries reinserted
//! - **Lazy Search**: Pull-based intersection and containment queries
//! - **Nearest Neighbours**: Best-first k-nearest search
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use disk_rstar::{Envelope, MemoryElementMapper, SpatialElement, SpatialIndex, TreeConfig};
//!
//! #[derive(Clone, PartialEq, Eq, Hash)]
//! struct Parcel(i32, i32);
//!
//! impl SpatialElement for Parcel {
//!     fn envelope(&self) -> Envelope {
//!         let (x, y) = (self.0 as f64, self.1 as f64);
//!         Envelope::from_corners(x, y, x + 1.0, y + 1.0).unwrap()
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mapper = Arc::new(MemoryElementMapper::new());
//! let config = TreeConfig::new(2, 16).with_crs_descriptor(b"EPSG:4326".to_vec());
//! let mut index = SpatialIndex::create("parcels.rtree", &config, mapper)?;
//!
//! index.insert_element(&Parcel(3, 4))?;
//!
//! let query = Envelope::from_corners(0.0, 0.0, 5.0, 5.0)?;
//! for parcel in index.search(&query)? {
//!     let parcel = parcel?;
//!     println!("found parcel at {}, {}", parcel.0, parcel.1);
//! }
//! index.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## R*-Tree API
//!
//! The tree itself only knows envelopes and `u64` ids:
//!
//! ```rust
//! use disk_rstar::{Envelope, MemoryBackend, RStarTree, TreeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut tree = RStarTree::create(MemoryBackend::new(), &TreeConfig::new(2, 8))?;
//! tree.insert(Envelope::from_corners(0.0, 0.0, 10.0, 10.0)?, 1)?;
//!
//! let query = Envelope::from_corners(5.0, 5.0, 15.0, 15.0)?;
//! let ids = tree.search(&query)?.collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(ids, vec![1]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod envelope;
pub mod index;
pub mod mapper;
pub mod rtree;

pub use config::{OpenOptions, TreeConfig, TreeOptions};
pub use envelope::Envelope;
pub use index::{ElementIter, SpatialIndex};
pub use mapper::{
    ElementMapper, EnvelopeFn, FileElementMapper, MemoryElementMapper, SpatialElement,
};
pub use rtree::{
    ElementId, FileBackend, IntegrityReport, MemoryBackend, Neighbor, PageBackend, RStarTree,
    RTreeStats, SearchIter, SearchMode, SpatialError, SpatialResult,
};
