//! Node persistence for the R*-tree.
//!
//! The store owns the backing medium, the file header and a single reusable
//! record buffer. Every node read and write goes through that buffer; the
//! tree above only ever sees page ids and decoded [`Node`] values.
//!
//! # Layout
//!
//! ```text
//! offset 0            header region (header_size bytes, multiple of 512)
//!                       magic u32 | version u32 | header_size u32
//!                       body_len u32 | body_crc u32 | bincode body ...
//! header_size + id*R  slot of node `id` (R = record_size)
//!                       tag u8 | reserved [u8; 3] | len u32 | crc u32
//!                       bincode payload, zero padded to R
//! ```

use bincode::config;

use super::persistence::{decode_free_record, encode_free_record, FREE_RECORD_LEN};
use super::rtree_cache::PageCache;
use super::rtree_constants::{
    DEFAULT_BUFFER_SIZE, HEADER_ALIGN, HEADER_PREFIX_LEN, MAGIC, MAX_DIMENSION,
    MAX_MAX_ELEMENTS, MIN_MAX_ELEMENTS, NIL_PAGE, SLOT_PREFIX_LEN, TAG_FREE, TAG_NODE, VERSION,
};
use super::rtree_storage::PageBackend;
use super::rtree_types::{
    crc32, Entry, FileHeader, Node, PageId, RTreeStats, SpatialError, SpatialResult,
};
use crate::config::{OpenOptions, TreeConfig, TreeOptions};
use crate::envelope::Envelope;

/// Where node slots live and how big they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordLayout {
    header_size: u64,
    record_size: usize,
}

impl RecordLayout {
    fn offset(&self, page_id: PageId) -> u64 {
        self.header_size + page_id * self.record_size as u64
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct IoCounters {
    cache_hits: u64,
    cache_misses: u64,
    disk_reads: u64,
    disk_writes: u64,
}

/// Fixed-slot node store over a [`PageBackend`].
pub struct PageStore<B: PageBackend> {
    backend: Option<B>,
    header: FileHeader,
    layout: RecordLayout,
    buffer: Vec<u8>,
    cache: Option<PageCache>,
    counters: IoCounters,
}

/// Size of the largest record a node of this shape can need: an internal
/// node holding `max_elements` entries, plus the slot prefix, rounded to 8.
pub fn worst_case_record_size(max_elements: usize, dimension: usize) -> SpatialResult<usize> {
    let mut node = Node::new_internal(NIL_PAGE, NIL_PAGE, u32::MAX, dimension);
    node.entries = vec![Entry::new(Envelope::empty(dimension), u64::MAX); max_elements];

    let payload = bincode::serde::encode_to_vec(&node, config::legacy())
        .map_err(|e| SpatialError::Serialization(e.to_string()))?;
    Ok((payload.len() + SLOT_PREFIX_LEN).next_multiple_of(8))
}

fn default_buffer_size(record_size: usize) -> usize {
    DEFAULT_BUFFER_SIZE.max(record_size.next_power_of_two())
}

fn resolve_buffer_size(options: &TreeOptions, record_size: usize) -> SpatialResult<usize> {
    match options.buffer_size() {
        Some(size) if size < record_size => Err(SpatialError::Capacity(format!(
            "buffer of {} bytes cannot hold a {} byte node record",
            size, record_size
        ))),
        Some(size) => Ok(size),
        None => Ok(default_buffer_size(record_size)),
    }
}

fn encode_header_body(header: &FileHeader) -> SpatialResult<Vec<u8>> {
    bincode::serde::encode_to_vec(header, config::legacy())
        .map_err(|e| SpatialError::Serialization(e.to_string()))
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

/// Reads and validates the header region. Returns the header and the size
/// of the region.
fn read_header<B: PageBackend>(backend: &mut B) -> SpatialResult<(FileHeader, u64)> {
    let len = backend.len()?;
    if len < 4 {
        return Err(SpatialError::BadMagic(0));
    }

    let mut prefix = [0u8; HEADER_PREFIX_LEN];
    let available = (len as usize).min(HEADER_PREFIX_LEN);
    backend.read_at(0, &mut prefix[..available])?;

    let magic = read_u32(&prefix, 0);
    if magic != MAGIC {
        return Err(SpatialError::BadMagic(magic));
    }
    if available < HEADER_PREFIX_LEN {
        return Err(SpatialError::CorruptHeader(format!(
            "header prefix truncated to {} bytes",
            available
        )));
    }

    let version = read_u32(&prefix, 4);
    if version != VERSION {
        return Err(SpatialError::UnsupportedVersion {
            found: version,
            expected: VERSION,
        });
    }

    let header_size = read_u32(&prefix, 8) as u64;
    let body_len = read_u32(&prefix, 12) as usize;
    let body_crc = read_u32(&prefix, 16);

    if header_size == 0 || header_size % HEADER_ALIGN as u64 != 0 {
        return Err(SpatialError::CorruptHeader(format!(
            "header size {} is not a positive multiple of {}",
            header_size, HEADER_ALIGN
        )));
    }
    if (HEADER_PREFIX_LEN + body_len) as u64 > header_size {
        return Err(SpatialError::CorruptHeader(format!(
            "header body of {} bytes does not fit a {} byte header",
            body_len, header_size
        )));
    }
    if len < (HEADER_PREFIX_LEN + body_len) as u64 {
        return Err(SpatialError::CorruptHeader(format!(
            "file of {} bytes is shorter than its header",
            len
        )));
    }

    let mut body = vec![0u8; body_len];
    backend.read_at(HEADER_PREFIX_LEN as u64, &mut body)?;
    if crc32(&body) != body_crc {
        return Err(SpatialError::CorruptHeader("header checksum mismatch".into()));
    }

    let (header, _): (FileHeader, usize) =
        bincode::serde::decode_from_slice(&body, config::legacy())
            .map_err(|e| SpatialError::CorruptHeader(format!("undecodable header: {}", e)))?;

    check_header(&header)?;
    Ok((header, header_size))
}

/// Sanity bounds on a decoded header.
fn check_header(header: &FileHeader) -> SpatialResult<()> {
    let max_elements = header.max_elements as usize;
    let dimension = header.dimension as usize;

    if !(MIN_MAX_ELEMENTS..=MAX_MAX_ELEMENTS).contains(&max_elements) {
        return Err(SpatialError::CorruptHeader(format!(
            "max_elements {} out of range",
            max_elements
        )));
    }
    if dimension == 0 || dimension > MAX_DIMENSION {
        return Err(SpatialError::CorruptHeader(format!(
            "dimension {} out of range",
            dimension
        )));
    }

    let needed = worst_case_record_size(max_elements, dimension)
        .map_err(|e| SpatialError::CorruptHeader(e.to_string()))?;
    if (header.record_size as usize) < needed {
        return Err(SpatialError::CorruptHeader(format!(
            "record size {} is smaller than the {} bytes a node needs",
            header.record_size, needed
        )));
    }
    if header.next_page_id == 0 || header.root_node_id >= header.next_page_id {
        return Err(SpatialError::CorruptHeader(format!(
            "root page {} outside allocated range 0..{}",
            header.root_node_id, header.next_page_id
        )));
    }
    if header.free_list_head != NIL_PAGE && header.free_list_head >= header.next_page_id {
        return Err(SpatialError::CorruptHeader(format!(
            "free list head {} outside allocated range 0..{}",
            header.free_list_head, header.next_page_id
        )));
    }
    if header.height == 0 {
        return Err(SpatialError::CorruptHeader("tree height is zero".into()));
    }
    Ok(())
}

/// Encodes `node` into the slot buffer and writes the whole slot.
fn write_node_record<B: PageBackend>(
    backend: &mut B,
    buffer: &mut [u8],
    layout: RecordLayout,
    counters: &mut IoCounters,
    node: &Node,
) -> SpatialResult<()> {
    let slot = &mut buffer[..layout.record_size];
    let (prefix, payload) = slot.split_at_mut(SLOT_PREFIX_LEN);

    let len = bincode::serde::encode_into_slice(node, payload, config::legacy()).map_err(|e| {
        SpatialError::Capacity(format!("node {} does not fit its record: {}", node.id, e))
    })?;
    payload[len..].fill(0);
    let crc = crc32(&payload[..len]);

    prefix[0] = TAG_NODE;
    prefix[1..4].fill(0);
    prefix[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    prefix[8..12].copy_from_slice(&crc.to_le_bytes());

    backend.write_at(layout.offset(node.id), slot)?;
    counters.disk_writes += 1;
    Ok(())
}

/// Validates and decodes one slot read from disk.
fn decode_node_record(page_id: PageId, slot: &[u8], dimension: usize) -> SpatialResult<Node> {
    match slot[0] {
        TAG_NODE => {}
        TAG_FREE => {
            return Err(SpatialError::corrupt(format!(
                "page {} is on the free list",
                page_id
            )))
        }
        tag => {
            return Err(SpatialError::corrupt(format!(
                "page {} has unknown tag {:#04x}",
                page_id, tag
            )))
        }
    }

    let len = read_u32(slot, 4) as usize;
    if len == 0 || len > slot.len() - SLOT_PREFIX_LEN {
        return Err(SpatialError::corrupt(format!(
            "page {} has invalid payload length {}",
            page_id, len
        )));
    }
    let payload = &slot[SLOT_PREFIX_LEN..SLOT_PREFIX_LEN + len];
    if crc32(payload) != read_u32(slot, 8) {
        return Err(SpatialError::corrupt(format!(
            "checksum mismatch on page {}",
            page_id
        )));
    }

    let (node, _): (Node, usize) = bincode::serde::decode_from_slice(payload, config::legacy())
        .map_err(|e| SpatialError::corrupt(format!("page {} is undecodable: {}", page_id, e)))?;

    if node.id != page_id {
        return Err(SpatialError::corrupt(format!(
            "page {} holds node {}",
            page_id, node.id
        )));
    }
    if node.bounds.dimension() != dimension {
        return Err(SpatialError::corrupt(format!(
            "page {} has dimension {}, tree has {}",
            page_id,
            node.bounds.dimension(),
            dimension
        )));
    }
    Ok(node)
}

impl<B: PageBackend> PageStore<B> {
    /// Writes a fresh header and an empty root leaf to `backend`.
    ///
    /// Fails with `AlreadyExists` if the medium already holds a valid header,
    /// and with the header error if it holds an index this version cannot
    /// read. Only empty or foreign media are overwritten.
    pub fn create(mut backend: B, config: &TreeConfig) -> SpatialResult<Self> {
        config.validate()?;
        match read_header(&mut backend) {
            Ok(_) => return Err(SpatialError::AlreadyExists),
            Err(SpatialError::BadMagic(_)) => {}
            Err(e) => return Err(e),
        }

        let record_size = worst_case_record_size(config.max_elements(), config.dimension())?;
        let buffer_size = resolve_buffer_size(config.options(), record_size)?;

        let header = FileHeader::new(
            config.max_elements(),
            config.dimension(),
            record_size,
            config.crs_descriptor().to_vec(),
        );
        let body_len = encode_header_body(&header)?.len();
        let header_size = (HEADER_PREFIX_LEN + body_len).next_multiple_of(HEADER_ALIGN) as u64;

        backend.truncate(0)?;

        let mut store = Self {
            backend: Some(backend),
            header,
            layout: RecordLayout {
                header_size,
                record_size,
            },
            buffer: vec![0u8; buffer_size],
            cache: PageCache::new(config.options().cache_pages()),
            counters: IoCounters::default(),
        };

        store.write_header()?;
        let root = Node::new_leaf(0, NIL_PAGE, config.dimension());
        store.write_through(&root)?;
        store.backend_mut()?.sync()?;

        log::debug!(
            "Created page store: dimension={}, max_elements={}, record_size={}, header_size={}",
            config.dimension(),
            config.max_elements(),
            record_size,
            header_size
        );
        Ok(store)
    }

    /// Reads and validates the header of an existing store. No node is read.
    pub fn open(mut backend: B, options: &OpenOptions) -> SpatialResult<Self> {
        options.options().validate()?;
        let (header, header_size) = read_header(&mut backend)?;

        if let Some(expected) = options.expected_dimension() {
            if expected != header.dimension as usize {
                return Err(SpatialError::DimensionMismatch {
                    expected,
                    found: header.dimension as usize,
                });
            }
        }
        if let Some(expected) = options.expected_max_elements() {
            if expected != header.max_elements as usize {
                return Err(SpatialError::Capacity(format!(
                    "expected max_elements {}, file has {}",
                    expected, header.max_elements
                )));
            }
        }

        let record_size = header.record_size as usize;
        let buffer_size = resolve_buffer_size(options.options(), record_size)?;

        log::debug!(
            "Opened page store: dimension={}, max_elements={}, elements={}, pages={}, free={}",
            header.dimension,
            header.max_elements,
            header.element_count,
            header.next_page_id,
            header.free_page_count
        );

        Ok(Self {
            backend: Some(backend),
            header,
            layout: RecordLayout {
                header_size,
                record_size,
            },
            buffer: vec![0u8; buffer_size],
            cache: PageCache::new(options.options().cache_pages()),
            counters: IoCounters::default(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    fn backend_mut(&mut self) -> SpatialResult<&mut B> {
        self.backend.as_mut().ok_or(SpatialError::Closed)
    }

    fn ensure_open(&self) -> SpatialResult<()> {
        if self.backend.is_some() {
            Ok(())
        } else {
            Err(SpatialError::Closed)
        }
    }

    fn check_allocated(&self, page_id: PageId) -> SpatialResult<()> {
        if page_id >= self.header.next_page_id {
            return Err(SpatialError::corrupt(format!(
                "page {} is beyond the allocated range 0..{}",
                page_id, self.header.next_page_id
            )));
        }
        Ok(())
    }

    /// Returns the node stored at `page_id`, from the cache when possible.
    pub fn read_node(&mut self, page_id: PageId) -> SpatialResult<Node> {
        self.ensure_open()?;
        self.check_allocated(page_id)?;

        if let Some(cache) = self.cache.as_mut() {
            if let Some(node) = cache.get(page_id) {
                self.counters.cache_hits += 1;
                return Ok(node.clone());
            }
            self.counters.cache_misses += 1;
        }

        let node = self.read_record(page_id)?;
        self.cache_node(node.clone(), false)?;
        Ok(node)
    }

    /// Reads a node straight from the medium, bypassing the cache.
    fn read_record(&mut self, page_id: PageId) -> SpatialResult<Node> {
        let layout = self.layout;
        let dimension = self.header.dimension as usize;
        let backend = self.backend.as_mut().ok_or(SpatialError::Closed)?;
        let slot = &mut self.buffer[..layout.record_size];

        match backend.read_at(layout.offset(page_id), slot) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SpatialError::corrupt(format!(
                    "page {} lies past the end of the medium",
                    page_id
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.counters.disk_reads += 1;

        decode_node_record(page_id, slot, dimension)
    }

    /// Stores `node` at its own page id. With caching enabled the write is
    /// deferred until eviction or [`flush`](Self::flush).
    pub fn write_node(&mut self, node: &Node) -> SpatialResult<()> {
        self.ensure_open()?;
        self.check_allocated(node.id)?;
        if node.entries.len() > self.header.max_elements as usize {
            return Err(SpatialError::Capacity(format!(
                "node {} holds {} entries, fan-out is {}",
                node.id,
                node.entries.len(),
                self.header.max_elements
            )));
        }

        if self.cache.is_some() {
            self.cache_node(node.clone(), true)
        } else {
            self.write_through(node)
        }
    }

    fn write_through(&mut self, node: &Node) -> SpatialResult<()> {
        let backend = self.backend.as_mut().ok_or(SpatialError::Closed)?;
        write_node_record(
            backend,
            &mut self.buffer,
            self.layout,
            &mut self.counters,
            node,
        )
    }

    fn cache_node(&mut self, node: Node, dirty: bool) -> SpatialResult<()> {
        let Some(cache) = self.cache.as_mut() else {
            return Ok(());
        };
        if let Some((_, evicted)) = cache.insert(node.id, node, dirty) {
            self.write_through(&evicted)?;
        }
        Ok(())
    }

    /// Hands out a page id: the head of the free list, or a new slot at the
    /// end of the store.
    pub fn allocate_node(&mut self) -> SpatialResult<PageId> {
        self.ensure_open()?;

        let head = self.header.free_list_head;
        if head == NIL_PAGE {
            let page_id = self.header.next_page_id;
            self.header.next_page_id += 1;
            return Ok(page_id);
        }

        let next = self.read_free_link(head)?;
        self.header.free_list_head = next;
        self.header.free_page_count = self.header.free_page_count.saturating_sub(1);
        Ok(head)
    }

    /// Pushes `page_id` onto the free list. The slot's payload bytes stay
    /// on disk until the page is handed out again.
    pub fn free_node(&mut self, page_id: PageId) -> SpatialResult<()> {
        self.ensure_open()?;
        self.check_allocated(page_id)?;

        if let Some(cache) = self.cache.as_mut() {
            cache.remove(page_id);
        }

        let offset = self.layout.offset(page_id);
        let record = &mut self.buffer[..FREE_RECORD_LEN];
        encode_free_record(self.header.free_list_head, record);
        let backend = self.backend.as_mut().ok_or(SpatialError::Closed)?;
        backend.write_at(offset, record)?;
        self.counters.disk_writes += 1;

        self.header.free_list_head = page_id;
        self.header.free_page_count += 1;
        Ok(())
    }

    fn read_free_link(&mut self, page_id: PageId) -> SpatialResult<PageId> {
        self.check_allocated(page_id)?;
        let offset = self.layout.offset(page_id);
        let backend = self.backend.as_mut().ok_or(SpatialError::Closed)?;
        let record = &mut self.buffer[..FREE_RECORD_LEN];

        match backend.read_at(offset, record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SpatialError::corrupt(format!(
                    "free page {} lies past the end of the medium",
                    page_id
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.counters.disk_reads += 1;

        let next = decode_free_record(page_id, record)?;
        if next != NIL_PAGE && next >= self.header.next_page_id {
            return Err(SpatialError::corrupt(format!(
                "free page {} links to unallocated page {}",
                page_id, next
            )));
        }
        Ok(next)
    }

    /// Walks the whole free list. Fails on a broken or cyclic chain.
    pub fn free_pages(&mut self) -> SpatialResult<Vec<PageId>> {
        self.ensure_open()?;
        let mut pages = Vec::new();
        let mut current = self.header.free_list_head;
        while current != NIL_PAGE {
            if pages.len() as u64 >= self.header.next_page_id {
                return Err(SpatialError::corrupt("free list contains a cycle"));
            }
            pages.push(current);
            current = self.read_free_link(current)?;
        }
        Ok(pages)
    }

    /// Rewrites the header region in place.
    fn write_header(&mut self) -> SpatialResult<()> {
        let body = encode_header_body(&self.header)?;
        let header_size = self.layout.header_size as usize;
        if HEADER_PREFIX_LEN + body.len() > header_size {
            return Err(SpatialError::Capacity(format!(
                "header body of {} bytes outgrew its {} byte region",
                body.len(),
                header_size
            )));
        }

        let mut region = vec![0u8; header_size];
        region[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        region[4..8].copy_from_slice(&VERSION.to_le_bytes());
        region[8..12].copy_from_slice(&(header_size as u32).to_le_bytes());
        region[12..16].copy_from_slice(&(body.len() as u32).to_le_bytes());
        region[16..20].copy_from_slice(&crc32(&body).to_le_bytes());
        region[HEADER_PREFIX_LEN..HEADER_PREFIX_LEN + body.len()].copy_from_slice(&body);

        self.backend_mut()?.write_at(0, &region)?;
        self.counters.disk_writes += 1;
        Ok(())
    }

    /// Persists the header after a structural change.
    pub fn commit(&mut self) -> SpatialResult<()> {
        self.ensure_open()?;
        self.write_header()
    }

    /// Writes every dirty page and the header, then syncs the medium.
    pub fn flush(&mut self) -> SpatialResult<()> {
        let backend = self.backend.as_mut().ok_or(SpatialError::Closed)?;

        if let Some(cache) = self.cache.as_mut() {
            let dirty = cache.dirty_pages();
            for page_id in &dirty {
                if let Some(node) = cache.peek(*page_id) {
                    write_node_record(
                        backend,
                        &mut self.buffer,
                        self.layout,
                        &mut self.counters,
                        node,
                    )?;
                }
                cache.mark_clean(*page_id);
            }
        }

        self.write_header()?;
        self.backend_mut()?.sync()?;
        Ok(())
    }

    /// Flushes and releases the medium. Every later call fails with `Closed`,
    /// including a second `close`.
    pub fn close(&mut self) -> SpatialResult<()> {
        self.ensure_open()?;
        let result = self.flush();
        self.backend = None;
        self.cache = None;
        log::debug!("Closed page store");
        result
    }

    /// Flushes and hands the medium back to the caller.
    pub fn into_backend(mut self) -> SpatialResult<B> {
        self.flush()?;
        self.cache = None;
        self.backend.take().ok_or(SpatialError::Closed)
    }

    // ------------------------------------------------------------------
    // Header access
    // ------------------------------------------------------------------

    pub fn root(&self) -> PageId {
        self.header.root_node_id
    }

    pub fn set_root(&mut self, page_id: PageId, height: u32) {
        self.header.root_node_id = page_id;
        self.header.height = height;
    }

    /// Number of levels; a lone root leaf has height 1.
    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn element_count(&self) -> u64 {
        self.header.element_count
    }

    pub fn set_element_count(&mut self, count: u64) {
        self.header.element_count = count;
    }

    pub fn dimension(&self) -> usize {
        self.header.dimension as usize
    }

    pub fn max_elements(&self) -> usize {
        self.header.max_elements as usize
    }

    pub fn crs_descriptor(&self) -> &[u8] {
        &self.header.crs_descriptor
    }

    pub fn next_page_id(&self) -> PageId {
        self.header.next_page_id
    }

    pub fn free_page_count(&self) -> u64 {
        self.header.free_page_count
    }

    pub fn record_size(&self) -> usize {
        self.layout.record_size
    }

    pub fn header_size(&self) -> u64 {
        self.layout.header_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> RTreeStats {
        RTreeStats {
            total_entries: self.header.element_count,
            tree_height: self.header.height,
            allocated_pages: self.header.next_page_id,
            free_pages: self.header.free_page_count,
            cached_pages: self.cache.as_ref().map(|c| c.len() as u64).unwrap_or(0),
            cache_hits: self.counters.cache_hits,
            cache_misses: self.counters.cache_misses,
            disk_reads: self.counters.disk_reads,
            disk_writes: self.counters.disk_writes,
            forced_reinsertions: 0,
            splits: 0,
        }
    }
}

impl<B: PageBackend> Drop for PageStore<B> {
    fn drop(&mut self) {
        if self.backend.is_some() {
            if let Err(e) = self.flush() {
                log::warn!("Failed to flush page store on drop: {}", e);
            }
        }
    }
}
