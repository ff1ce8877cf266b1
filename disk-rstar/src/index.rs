use std::path::Path;
use std::sync::Arc;

use crate::config::{OpenOptions, TreeConfig};
use crate::envelope::Envelope;
use crate::mapper::ElementMapper;
use crate::rtree::{
    FileBackend, IntegrityReport, MemoryBackend, PageBackend, RStarTree, RTreeStats, SearchIter,
    SearchMode, SpatialError, SpatialResult,
};

/// A spatial index over caller elements.
///
/// Pairs an [`RStarTree`], which only knows envelopes and 64-bit ids, with
/// the caller's [`ElementMapper`], which turns elements into ids and back.
/// The mapper is shared: the index never flushes or closes it.
pub struct SpatialIndex<M: ElementMapper, B: PageBackend = FileBackend> {
    tree: RStarTree<B>,
    mapper: Arc<M>,
}

impl<M: ElementMapper> SpatialIndex<M, MemoryBackend> {
    /// Creates an index held entirely in process memory.
    pub fn in_memory(config: &TreeConfig, mapper: Arc<M>) -> SpatialResult<Self> {
        let tree = RStarTree::create(MemoryBackend::new(), config)?;
        Ok(Self { tree, mapper })
    }
}

impl<M: ElementMapper> SpatialIndex<M, FileBackend> {
    /// Creates a fresh index file at `path`. An existing file holding an
    /// index is refused with `AlreadyExists`.
    pub fn create(
        path: impl AsRef<Path>,
        config: &TreeConfig,
        mapper: Arc<M>,
    ) -> SpatialResult<Self> {
        let path = path.as_ref();
        log::debug!("Creating spatial index at {:?}", path);
        let backend = FileBackend::create(path)?;
        let tree = RStarTree::create(backend, config)?;
        Ok(Self { tree, mapper })
    }

    /// Opens an existing index file. Dimension, fan-out and CRS descriptor
    /// come from the file header.
    pub fn open(
        path: impl AsRef<Path>,
        options: &OpenOptions,
        mapper: Arc<M>,
    ) -> SpatialResult<Self> {
        let path = path.as_ref();
        log::debug!("Opening spatial index at {:?}", path);
        let backend = FileBackend::open(path)?;
        let tree = RStarTree::open(backend, options)?;
        Ok(Self { tree, mapper })
    }
}

impl<M: ElementMapper, B: PageBackend> SpatialIndex<M, B> {
    /// Wraps an already constructed tree.
    pub fn from_tree(tree: RStarTree<B>, mapper: Arc<M>) -> Self {
        Self { tree, mapper }
    }

    pub fn mapper(&self) -> &Arc<M> {
        &self.mapper
    }

    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn height(&self) -> u32 {
        self.tree.height()
    }

    pub fn dimension(&self) -> usize {
        self.tree.dimension()
    }

    pub fn max_elements(&self) -> usize {
        self.tree.max_elements()
    }

    pub fn crs_descriptor(&self) -> &[u8] {
        self.tree.crs_descriptor()
    }

    pub fn stats(&self) -> RTreeStats {
        self.tree.stats()
    }

    /// Bounds of everything indexed, `None` when empty.
    pub fn bounds(&mut self) -> SpatialResult<Option<Envelope>> {
        self.tree.bounds()
    }

    fn ensure_open(&self) -> SpatialResult<()> {
        if self.tree.is_open() {
            Ok(())
        } else {
            Err(SpatialError::Closed)
        }
    }

    fn check_envelope(&self, envelope: &Envelope) -> SpatialResult<()> {
        if envelope.dimension() != self.tree.dimension() {
            return Err(SpatialError::DimensionMismatch {
                expected: self.tree.dimension(),
                found: envelope.dimension(),
            });
        }
        if envelope.is_empty() {
            return Err(SpatialError::InvalidEnvelope(
                "cannot index an empty envelope".to_string(),
            ));
        }
        Ok(())
    }

    /// Indexes `element` under `envelope`.
    pub fn insert(&mut self, envelope: Envelope, element: &M::Element) -> SpatialResult<()> {
        self.ensure_open()?;
        self.check_envelope(&envelope)?;
        let id = self.mapper.id_of(element)?;
        self.tree.insert(envelope, id)
    }

    /// Indexes `element` under the envelope its mapper reports.
    pub fn insert_element(&mut self, element: &M::Element) -> SpatialResult<()> {
        let envelope = self.mapper.envelope_of(element)?;
        self.insert(envelope, element)
    }

    /// Removes the entry for `element` stored under exactly `envelope`.
    /// An element the mapper has never seen is `NotFound`.
    pub fn delete(&mut self, envelope: &Envelope, element: &M::Element) -> SpatialResult<()> {
        self.ensure_open()?;
        let id = self.mapper.find_id(element)?.ok_or_else(|| {
            SpatialError::NotFound("element is not known to the mapper".to_string())
        })?;
        self.tree.delete(envelope, id)
    }

    pub fn delete_element(&mut self, element: &M::Element) -> SpatialResult<()> {
        let envelope = self.mapper.envelope_of(element)?;
        self.delete(&envelope, element)
    }

    /// Lazily yields every element whose envelope intersects `query`.
    pub fn search(&mut self, query: &Envelope) -> SpatialResult<ElementIter<'_, M, B>> {
        self.search_with(query, SearchMode::Intersects)
    }

    /// Lazily yields every element whose envelope lies inside `query`.
    pub fn search_within(&mut self, query: &Envelope) -> SpatialResult<ElementIter<'_, M, B>> {
        self.search_with(query, SearchMode::Within)
    }

    fn search_with(
        &mut self,
        query: &Envelope,
        mode: SearchMode,
    ) -> SpatialResult<ElementIter<'_, M, B>> {
        let ids = self.tree.search_with(query, mode)?;
        Ok(ElementIter {
            ids,
            mapper: self.mapper.as_ref(),
            failed: false,
        })
    }

    /// The `k` elements closest to `point` with their distances, closest
    /// first.
    pub fn nearest(&mut self, point: &[f64], k: usize) -> SpatialResult<Vec<(M::Element, f64)>> {
        self.tree
            .nearest(point, k)?
            .into_iter()
            .map(|n| Ok((self.mapper.element_of(n.id)?, n.distance)))
            .collect()
    }

    pub fn check_integrity(&mut self) -> SpatialResult<IntegrityReport> {
        self.tree.check_integrity()
    }

    /// Flushes the tree. The mapper is flushed separately by its owner.
    pub fn flush(&mut self) -> SpatialResult<()> {
        self.tree.flush()
    }

    /// Flushes and closes the tree. The mapper stays open.
    pub fn close(&mut self) -> SpatialResult<()> {
        self.tree.close()?;
        log::debug!("Closed spatial index");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.tree.is_open()
    }

    /// Releases the tree, keeping the mapper.
    pub fn into_parts(self) -> (RStarTree<B>, Arc<M>) {
        (self.tree, self.mapper)
    }
}

/// Lazy search results resolved through the element mapper.
///
/// Each step pulls one id from the tree and resolves it. After the first
/// error the iterator is exhausted.
pub struct ElementIter<'a, M: ElementMapper, B: PageBackend> {
    ids: SearchIter<'a, B>,
    mapper: &'a M,
    failed: bool,
}

impl<'a, M: ElementMapper, B: PageBackend> ElementIter<'a, M, B> {
    pub fn query(&self) -> &Envelope {
        self.ids.query()
    }
}

impl<'a, M: ElementMapper, B: PageBackend> Iterator for ElementIter<'a, M, B> {
    type Item = SpatialResult<M::Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = match self.ids.next()? {
            Ok(id) => self.mapper.element_of(id),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{MemoryElementMapper, SpatialElement};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Tile {
        name: String,
        x: i32,
        y: i32,
    }

    impl SpatialElement for Tile {
        fn envelope(&self) -> Envelope {
            let (x, y) = (self.x as f64, self.y as f64);
            Envelope::from_corners(x, y, x + 1.0, y + 1.0).unwrap()
        }
    }

    fn tile(x: i32, y: i32) -> Tile {
        Tile {
            name: format!("{}:{}", x, y),
            x,
            y,
        }
    }

    fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope::from_corners(min_x, min_y, max_x, max_y).unwrap()
    }

    fn names<M: ElementMapper<Element = Tile>, B: PageBackend>(
        index: &mut SpatialIndex<M, B>,
        query: &Envelope,
    ) -> Vec<String> {
        let mut names: Vec<String> = index
            .search(query)
            .unwrap()
            .map(|t| t.unwrap().name)
            .collect();
        names.sort();
        names
    }

    fn memory_index(max_elements: usize) -> SpatialIndex<MemoryElementMapper<Tile>, MemoryBackend> {
        let _ = env_logger::builder().is_test(true).try_init();
        SpatialIndex::in_memory(
            &TreeConfig::new(2, max_elements),
            Arc::new(MemoryElementMapper::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_search_elements() {
        let mut index = memory_index(4);
        for x in 0..10 {
            for y in 0..10 {
                index.insert_element(&tile(x * 2, y * 2)).unwrap();
            }
        }
        assert_eq!(index.len(), 100);
        assert!(index.height() > 1);

        assert_eq!(
            names(&mut index, &rect(1.5, 1.5, 2.5, 2.5)),
            vec!["2:2".to_string()]
        );
        // Touching edges count as intersecting.
        assert_eq!(
            names(&mut index, &rect(4.0, 4.0, 6.0, 4.5)),
            vec!["4:4".to_string(), "6:4".to_string()]
        );
        assert_eq!(
            index.bounds().unwrap(),
            Some(rect(0.0, 0.0, 19.0, 19.0))
        );
    }

    #[test]
    fn test_search_within() {
        let mut index = memory_index(4);
        for x in 0..5 {
            index.insert_element(&tile(x, 0)).unwrap();
        }
        let within: Vec<Tile> = index
            .search_within(&rect(0.5, 0.0, 3.0, 1.0))
            .unwrap()
            .collect::<SpatialResult<_>>()
            .unwrap();
        assert_eq!(within.len(), 2);
        assert!(within.iter().all(|t| t.x == 1 || t.x == 2));
    }

    #[test]
    fn test_delete_elements() {
        let mut index = memory_index(4);
        for x in 0..20 {
            index.insert_element(&tile(x, x)).unwrap();
        }
        index.delete_element(&tile(5, 5)).unwrap();
        assert_eq!(index.len(), 19);
        assert!(names(&mut index, &rect(5.2, 5.2, 5.8, 5.8)).is_empty());

        // Wrong envelope for a known element.
        let result = index.delete(&rect(0.0, 0.0, 1.0, 1.0), &tile(6, 6));
        assert!(matches!(result, Err(SpatialError::NotFound(_))));

        // Element the mapper has never seen.
        let result = index.delete_element(&tile(100, 100));
        assert!(matches!(result, Err(SpatialError::NotFound(_))));
        assert_eq!(index.len(), 19);
        assert!(index.check_integrity().unwrap().is_valid);
    }

    #[test]
    fn test_rejects_bad_envelopes_before_assigning_ids() {
        let mut index = memory_index(4);
        let bad = Envelope::new(vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0]).unwrap();
        assert!(matches!(
            index.insert(bad, &tile(0, 0)),
            Err(SpatialError::DimensionMismatch { expected: 2, found: 3 })
        ));
        assert!(index.mapper().is_empty());
    }

    #[test]
    fn test_nearest_elements() {
        let mut index = memory_index(4);
        for x in 0..10 {
            index.insert_element(&tile(x * 3, 0)).unwrap();
        }
        let found = index.nearest(&[7.0, 0.5], 2).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, tile(6, 0));
        assert_eq!(found[0].1, 0.0);
        assert_eq!(found[1].0, tile(9, 0));
        assert_eq!(found[1].1, 2.0);
    }

    #[test]
    fn test_file_index_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiles.rtree");
        let mapper = Arc::new(MemoryElementMapper::<Tile>::new());

        {
            let config = TreeConfig::new(2, 6).with_crs_descriptor(b"EPSG:3857".to_vec());
            let mut index = SpatialIndex::create(&path, &config, Arc::clone(&mapper)).unwrap();
            for x in 0..30 {
                index.insert_element(&tile(x, 30 - x)).unwrap();
            }
            index.close().unwrap();
            assert!(matches!(index.close(), Err(SpatialError::Closed)));
        }

        // The mapper outlives the index.
        assert!(!mapper.is_closed());

        let mut index = SpatialIndex::open(&path, &OpenOptions::new(), mapper).unwrap();
        assert_eq!(index.len(), 30);
        assert_eq!(index.crs_descriptor(), b"EPSG:3857");
        assert_eq!(index.dimension(), 2);
        assert_eq!(index.max_elements(), 6);
        assert_eq!(
            names(&mut index, &rect(10.2, 20.2, 10.8, 20.8)),
            vec!["10:20".to_string()]
        );

        assert!(matches!(
            SpatialIndex::create(&path, &TreeConfig::new(2, 6), Arc::clone(index.mapper())),
            Err(SpatialError::AlreadyExists)
        ));
    }

    #[test]
    fn test_search_after_close() {
        let mut index = memory_index(4);
        index.insert_element(&tile(0, 0)).unwrap();
        index.close().unwrap();
        assert!(!index.is_open());
        assert!(matches!(
            index.search(&rect(0.0, 0.0, 1.0, 1.0)),
            Err(SpatialError::Closed)
        ));
    }

    #[test]
    fn test_insert_after_close_assigns_no_id() {
        let mut index = memory_index(4);
        index.close().unwrap();
        assert!(matches!(
            index.insert(rect(0.0, 0.0, 1.0, 1.0), &tile(0, 0)),
            Err(SpatialError::Closed)
        ));
        assert!(matches!(
            index.insert_element(&tile(1, 1)),
            Err(SpatialError::Closed)
        ));
        assert!(index.mapper().is_empty());
        assert_eq!(index.mapper().find_id(&tile(0, 0)).unwrap(), None);
    }

    #[test]
    fn test_closed_mapper_ends_iteration() {
        let mut index = memory_index(4);
        for x in 0..3 {
            index.insert_element(&tile(x, 0)).unwrap();
        }
        index.mapper().close().unwrap();

        let results: Vec<SpatialResult<Tile>> =
            index.search(&rect(0.0, 0.0, 5.0, 1.0)).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(SpatialError::Closed)));
    }
}
