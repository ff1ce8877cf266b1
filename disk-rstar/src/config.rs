use crate::rtree::rtree_constants::{
    DEFAULT_CACHE_PAGES, DEFAULT_MIN_FILL_FRACTION, DEFAULT_REINSERT_FRACTION, MAX_DIMENSION,
    MAX_MAX_ELEMENTS, MIN_MAX_ELEMENTS,
};
use crate::rtree::{SpatialError, SpatialResult};

/// Runtime tuning for a tree instance.
///
/// None of these values are persisted. Reopening a file with different
/// options is format-compatible; the tree just grows a differently shaped
/// (still valid) structure on later inserts.
///
/// # Examples
///
/// ```rust
/// use disk_rstar::TreeOptions;
///
/// let options = TreeOptions::default()
///     .with_cache_pages(1024)
///     .with_buffer_size(16 * 1024);
/// assert_eq!(options.cache_pages(), 1024);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TreeOptions {
    buffer_size: Option<usize>,
    cache_pages: usize,
    reinsert_fraction: f64,
    min_fill_fraction: f64,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            buffer_size: None,
            cache_pages: DEFAULT_CACHE_PAGES,
            reinsert_fraction: DEFAULT_REINSERT_FRACTION,
            min_fill_fraction: DEFAULT_MIN_FILL_FRACTION,
        }
    }
}

impl TreeOptions {
    /// Sets the size of the page store's read/write buffer in bytes.
    ///
    /// The buffer must hold at least one worst-case node record; a smaller
    /// value makes `create`/`open` fail with a capacity error. When unset the
    /// store picks a power of two of at least 4096 bytes that fits a record.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Sets how many decoded nodes the page cache keeps. `0` disables the
    /// cache and every node write goes straight to the backing medium.
    pub fn with_cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    /// Share of an overflowing node's entries evicted for forced reinsertion.
    pub fn with_reinsert_fraction(mut self, fraction: f64) -> Self {
        self.reinsert_fraction = fraction;
        self
    }

    /// Minimum node fill as a share of `max_elements`.
    pub fn with_min_fill_fraction(mut self, fraction: f64) -> Self {
        self.min_fill_fraction = fraction;
        self
    }

    pub fn buffer_size(&self) -> Option<usize> {
        self.buffer_size
    }

    pub fn cache_pages(&self) -> usize {
        self.cache_pages
    }

    pub fn reinsert_fraction(&self) -> f64 {
        self.reinsert_fraction
    }

    pub fn min_fill_fraction(&self) -> f64 {
        self.min_fill_fraction
    }

    pub fn validate(&self) -> SpatialResult<()> {
        if !(self.reinsert_fraction > 0.0 && self.reinsert_fraction < 1.0) {
            return Err(SpatialError::Capacity(format!(
                "reinsert fraction must be in (0, 1), got {}",
                self.reinsert_fraction
            )));
        }
        if !(self.min_fill_fraction > 0.0 && self.min_fill_fraction <= 0.5) {
            return Err(SpatialError::Capacity(format!(
                "minimum fill fraction must be in (0, 0.5], got {}",
                self.min_fill_fraction
            )));
        }
        if self.buffer_size == Some(0) {
            return Err(SpatialError::Capacity("buffer size must be positive".into()));
        }
        Ok(())
    }

    /// Minimum entries per non-root node for a fan-out of `max_elements`:
    /// `clamp(ceil(f * M), 1, (M + 1) / 2)`.
    pub fn min_entries(&self, max_elements: usize) -> usize {
        let m = (self.min_fill_fraction * max_elements as f64).ceil() as usize;
        m.clamp(1, ((max_elements + 1) / 2).max(1))
    }

    /// Entries evicted by forced reinsertion from a node holding
    /// `max_elements + 1` entries: `clamp(round(f * (M + 1)), 1, M + 1 - m)`.
    pub fn reinsert_count(&self, max_elements: usize) -> usize {
        let overflowing = max_elements + 1;
        let p = (self.reinsert_fraction * overflowing as f64).round() as usize;
        let upper = (overflowing - self.min_entries(max_elements)).max(1);
        p.clamp(1, upper)
    }
}

/// Parameters fixed when a tree is created. They are written to the header
/// and read back on every open.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    dimension: usize,
    max_elements: usize,
    crs_descriptor: Vec<u8>,
    options: TreeOptions,
}

impl TreeConfig {
    pub fn new(dimension: usize, max_elements: usize) -> Self {
        Self {
            dimension,
            max_elements,
            crs_descriptor: Vec::new(),
            options: TreeOptions::default(),
        }
    }

    /// Attaches an opaque coordinate reference system descriptor. The tree
    /// stores it verbatim and hands it back after reopening.
    pub fn with_crs_descriptor(mut self, crs_descriptor: impl Into<Vec<u8>>) -> Self {
        self.crs_descriptor = crs_descriptor.into();
        self
    }

    pub fn with_options(mut self, options: TreeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub fn crs_descriptor(&self) -> &[u8] {
        &self.crs_descriptor
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    pub fn validate(&self) -> SpatialResult<()> {
        if self.max_elements < MIN_MAX_ELEMENTS {
            return Err(SpatialError::Capacity(format!(
                "max_elements must be at least {}, got {}",
                MIN_MAX_ELEMENTS, self.max_elements
            )));
        }
        if self.max_elements > MAX_MAX_ELEMENTS {
            return Err(SpatialError::Capacity(format!(
                "max_elements must be at most {}, got {}",
                MAX_MAX_ELEMENTS, self.max_elements
            )));
        }
        if self.dimension == 0 || self.dimension > MAX_DIMENSION {
            return Err(SpatialError::Capacity(format!(
                "dimension must be in 1..={}, got {}",
                MAX_DIMENSION, self.dimension
            )));
        }
        self.options.validate()
    }
}

/// Expectations checked against the header when an existing tree is opened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOptions {
    expected_dimension: Option<usize>,
    expected_max_elements: Option<usize>,
    options: TreeOptions,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the open with `DimensionMismatch` if the file disagrees.
    pub fn expect_dimension(mut self, dimension: usize) -> Self {
        self.expected_dimension = Some(dimension);
        self
    }

    /// Fails the open with a capacity error if the file disagrees.
    pub fn expect_max_elements(mut self, max_elements: usize) -> Self {
        self.expected_max_elements = Some(max_elements);
        self
    }

    pub fn with_options(mut self, options: TreeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn expected_dimension(&self) -> Option<usize> {
        self.expected_dimension
    }

    pub fn expected_max_elements(&self) -> Option<usize> {
        self.expected_max_elements
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }
}
