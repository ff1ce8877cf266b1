//! Integration tests for the disk-backed R*-tree
//!
//! Exercises the tree through its public API only:
//! - The reference grid scenario (insert, query, delete, re-query)
//! - Close/reopen round trips over real files
//! - Structural invariants under random insert/delete workloads
//! - Error reporting for closed trees, foreign files and corrupted pages

#[cfg(test)]
mod rtree_integration_tests {
    use std::collections::BTreeSet;
    use std::fs;

    use disk_rstar::rtree::worst_case_record_size;
    use disk_rstar::{
        Envelope, FileBackend, MemoryBackend, OpenOptions, RStarTree, SpatialError, TreeConfig,
        TreeOptions,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Envelope {
        Envelope::from_corners(min_x, min_y, max_x, max_y).unwrap()
    }

    fn diagonal_box(i: u64) -> Envelope {
        let v = i as f64;
        rect(v, v, v + 1.0, v + 1.0)
    }

    fn ids<B: disk_rstar::PageBackend>(tree: &mut RStarTree<B>, query: &Envelope) -> BTreeSet<u64> {
        tree.search(query)
            .unwrap()
            .collect::<Result<BTreeSet<_>, _>>()
            .unwrap()
    }

    fn brute_force(entries: &[(Envelope, u64)], query: &Envelope) -> BTreeSet<u64> {
        entries
            .iter()
            .filter(|(bounds, _)| bounds.intersects(query))
            .map(|(_, id)| *id)
            .collect()
    }

    // =========================================================================
    // REFERENCE SCENARIO
    // =========================================================================

    #[test]
    fn test_diagonal_grid_query_and_delete() {
        init_logger();
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid.rtree");

        let config = TreeConfig::new(2, 4).with_crs_descriptor(b"LOCAL_CS[\"engineering\"]".to_vec());
        let backend = FileBackend::create(&path).unwrap();
        let mut tree = RStarTree::create(backend, &config).unwrap();

        for i in (0..=398u64).step_by(2) {
            tree.insert(diagonal_box(i), i).unwrap();
        }
        assert_eq!(tree.len(), 200);

        let query = rect(2.0, 2.0, 6.0, 6.0);
        assert_eq!(ids(&mut tree, &query), BTreeSet::from([2, 4, 6]));

        tree.delete(&diagonal_box(4), 4).unwrap();
        assert_eq!(ids(&mut tree, &query), BTreeSet::from([2, 6]));
        assert_eq!(tree.len(), 199);

        let report = tree.check_integrity().unwrap();
        assert!(report.is_valid, "integrity errors: {:?}", report.errors);
        tree.close().unwrap();
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    #[test]
    fn test_reopen_yields_identical_results() {
        init_logger();
        let dir = tempdir().unwrap();
        let path = dir.path().join("roundtrip.rtree");
        let mut rng = StdRng::seed_from_u64(7);

        let mut entries = Vec::new();
        let queries: Vec<Envelope> = (0..20)
            .map(|_| {
                let x = rng.gen_range(0.0..90.0);
                let y = rng.gen_range(0.0..90.0);
                rect(x, y, x + rng.gen_range(0.0..20.0), y + rng.gen_range(0.0..20.0))
            })
            .collect();

        let before: Vec<BTreeSet<u64>> = {
            let backend = FileBackend::create(&path).unwrap();
            let config = TreeConfig::new(2, 8)
                .with_crs_descriptor(b"EPSG:4326".to_vec())
                .with_options(TreeOptions::default().with_cache_pages(16));
            let mut tree = RStarTree::create(backend, &config).unwrap();
            for id in 0..500u64 {
                let x = rng.gen_range(0.0..100.0);
                let y = rng.gen_range(0.0..100.0);
                let bounds = rect(x, y, x + rng.gen_range(0.0..3.0), y + rng.gen_range(0.0..3.0));
                tree.insert(bounds.clone(), id).unwrap();
                entries.push((bounds, id));
            }
            for id in (0..500u64).step_by(5) {
                tree.delete(&entries[id as usize].0, id).unwrap();
            }
            entries.retain(|(_, id)| id % 5 != 0);

            let results = queries.iter().map(|q| ids(&mut tree, q)).collect();
            tree.close().unwrap();
            results
        };

        let backend = FileBackend::open(&path).unwrap();
        let options = OpenOptions::new().expect_dimension(2).expect_max_elements(8);
        let mut tree = RStarTree::open(backend, &options).unwrap();
        assert_eq!(tree.len(), entries.len() as u64);
        assert_eq!(tree.crs_descriptor(), b"EPSG:4326");

        for (query, expected) in queries.iter().zip(&before) {
            let found = ids(&mut tree, query);
            assert_eq!(&found, expected);
            assert_eq!(found, brute_force(&entries, query));
        }
        assert!(tree.check_integrity().unwrap().is_valid);
    }

    #[test]
    fn test_memory_image_reopens() {
        let mut tree = RStarTree::create(MemoryBackend::new(), &TreeConfig::new(3, 5)).unwrap();
        for i in 0..40u64 {
            let v = i as f64;
            let bounds = Envelope::new(vec![v, 0.0, -v], vec![v + 0.5, 1.0, -v + 0.5]).unwrap();
            tree.insert(bounds, i).unwrap();
        }
        let bytes = tree.into_backend().unwrap().into_bytes();

        let mut tree =
            RStarTree::open(MemoryBackend::from_bytes(bytes), &OpenOptions::new()).unwrap();
        assert_eq!(tree.dimension(), 3);
        let query = Envelope::new(vec![10.0, 0.0, -12.0], vec![12.0, 1.0, -10.0]).unwrap();
        assert_eq!(ids(&mut tree, &query), BTreeSet::from([10, 11, 12]));
    }

    #[test]
    fn test_open_with_wrong_expectations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("expect.rtree");
        {
            let backend = FileBackend::create(&path).unwrap();
            let mut tree = RStarTree::create(backend, &TreeConfig::new(2, 6)).unwrap();
            tree.close().unwrap();
        }

        let result = RStarTree::open(
            FileBackend::open(&path).unwrap(),
            &OpenOptions::new().expect_dimension(3),
        );
        assert!(matches!(
            result,
            Err(SpatialError::DimensionMismatch { expected: 3, found: 2 })
        ));

        let result = RStarTree::open(
            FileBackend::open(&path).unwrap(),
            &OpenOptions::new().expect_max_elements(10),
        );
        assert!(matches!(result, Err(SpatialError::Capacity(_))));
    }

    // =========================================================================
    // INVARIANTS
    // =========================================================================

    #[test]
    fn test_random_workload_keeps_invariants() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(2024);

        for &max_elements in &[2usize, 3, 4, 9] {
            let config = TreeConfig::new(2, max_elements)
                .with_options(TreeOptions::default().with_cache_pages(4));
            let mut tree = RStarTree::create(MemoryBackend::new(), &config).unwrap();
            let mut live: Vec<(Envelope, u64)> = Vec::new();
            let mut next_id = 0u64;

            for round in 0..400 {
                if live.is_empty() || rng.gen_bool(0.65) {
                    let x = rng.gen_range(-50.0..50.0);
                    let y = rng.gen_range(-50.0..50.0);
                    // Some degenerate point entries.
                    let (w, h) = if rng.gen_bool(0.2) {
                        (0.0, 0.0)
                    } else {
                        (rng.gen_range(0.0..5.0), rng.gen_range(0.0..5.0))
                    };
                    let bounds = rect(x, y, x + w, y + h);
                    tree.insert(bounds.clone(), next_id).unwrap();
                    live.push((bounds, next_id));
                    next_id += 1;
                } else {
                    let victim = live.swap_remove(rng.gen_range(0..live.len()));
                    tree.delete(&victim.0, victim.1).unwrap();
                }

                if round % 50 == 49 {
                    let report = tree.check_integrity().unwrap();
                    assert!(
                        report.is_valid,
                        "M={} round {}: {:?}",
                        max_elements, round, report.errors
                    );
                    assert_eq!(report.entries_found, live.len() as u64);
                }
            }

            assert_eq!(tree.len(), live.len() as u64);
            for _ in 0..25 {
                let x = rng.gen_range(-60.0..60.0);
                let y = rng.gen_range(-60.0..60.0);
                let query = rect(x, y, x + rng.gen_range(0.0..30.0), y + rng.gen_range(0.0..30.0));
                assert_eq!(ids(&mut tree, &query), brute_force(&live, &query));
            }

            // Point queries and the full extent.
            if let Some((bounds, id)) = live.first().cloned() {
                let corner = Envelope::point(bounds.lower().to_vec()).unwrap();
                assert!(ids(&mut tree, &corner).contains(&id));
            }
            if let Some(extent) = tree.bounds().unwrap() {
                assert_eq!(ids(&mut tree, &extent).len(), live.len());
            }
        }
    }

    #[test]
    fn test_missing_delete_leaves_tree_unchanged() {
        let mut tree = RStarTree::create(MemoryBackend::new(), &TreeConfig::new(2, 4)).unwrap();
        for i in 0..30u64 {
            tree.insert(diagonal_box(i * 2), i).unwrap();
        }
        let everything = rect(-1.0, -1.0, 100.0, 100.0);
        let before = ids(&mut tree, &everything);

        // Right bounds, wrong id; right id, wrong bounds.
        let err = tree.delete(&diagonal_box(0), 99).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            tree.delete(&diagonal_box(1), 0),
            Err(SpatialError::NotFound(_))
        ));

        assert_eq!(ids(&mut tree, &everything), before);
        assert_eq!(tree.len(), 30);
        assert!(tree.check_integrity().unwrap().is_valid);

        // Deleted entries disappear from every query that covers them.
        tree.delete(&diagonal_box(10), 5).unwrap();
        assert!(!ids(&mut tree, &everything).contains(&5));
        assert!(!ids(&mut tree, &diagonal_box(10)).contains(&5));
    }

    #[test]
    fn test_delete_all_then_reuse() {
        let mut tree = RStarTree::create(MemoryBackend::new(), &TreeConfig::new(2, 3)).unwrap();
        for i in 0..60u64 {
            tree.insert(diagonal_box(i), i).unwrap();
        }
        for i in (0..60u64).rev() {
            tree.delete(&diagonal_box(i), i).unwrap();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.bounds().unwrap(), None);
        assert!(tree.check_integrity().unwrap().is_valid);

        let stats = tree.stats();
        assert!(stats.free_pages > 0);
        tree.insert(diagonal_box(1), 1).unwrap();
        assert_eq!(ids(&mut tree, &diagonal_box(1)), BTreeSet::from([1]));
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[test]
    fn test_close_is_not_idempotent_but_clean() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("close.rtree");
        let backend = FileBackend::create(&path).unwrap();
        let mut tree = RStarTree::create(backend, &TreeConfig::new(2, 4)).unwrap();
        tree.insert(rect(0.0, 0.0, 1.0, 1.0), 1).unwrap();

        tree.close().unwrap();
        assert!(matches!(tree.close(), Err(SpatialError::Closed)));
        assert!(matches!(
            tree.search(&rect(0.0, 0.0, 1.0, 1.0)),
            Err(SpatialError::Closed)
        ));
        assert!(matches!(
            tree.insert(rect(0.0, 0.0, 1.0, 1.0), 2),
            Err(SpatialError::Closed)
        ));

        // The file is still intact.
        let mut tree = RStarTree::open(FileBackend::open(&path).unwrap(), &OpenOptions::new())
            .unwrap();
        assert_eq!(ids(&mut tree, &rect(0.0, 0.0, 1.0, 1.0)), BTreeSet::from([1]));
    }

    #[test]
    fn test_format_errors_on_open() {
        let dir = tempdir().unwrap();

        let empty = dir.path().join("empty.bin");
        fs::write(&empty, b"").unwrap();
        let result = RStarTree::open(FileBackend::open(&empty).unwrap(), &OpenOptions::new());
        assert!(matches!(result, Err(SpatialError::BadMagic(0))));

        let foreign = dir.path().join("foreign.bin");
        fs::write(&foreign, b"PK\x03\x04 this is a zip archive, honest").unwrap();
        let err = RStarTree::open(FileBackend::open(&foreign).unwrap(), &OpenOptions::new())
            .err()
            .unwrap();
        assert!(err.is_format_error());
        assert!(matches!(err, SpatialError::BadMagic(_)));

        let path = dir.path().join("valid.rtree");
        {
            let mut tree =
                RStarTree::create(FileBackend::create(&path).unwrap(), &TreeConfig::new(2, 4))
                    .unwrap();
            tree.close().unwrap();
        }
        let original = fs::read(&path).unwrap();

        let mut future = original.clone();
        future[4..8].copy_from_slice(&99u32.to_le_bytes());
        fs::write(&path, &future).unwrap();
        let result = RStarTree::open(FileBackend::open(&path).unwrap(), &OpenOptions::new());
        assert!(matches!(
            result,
            Err(SpatialError::UnsupportedVersion { found: 99, .. })
        ));

        let mut damaged = original.clone();
        damaged[21] ^= 0xFF;
        fs::write(&path, &damaged).unwrap();
        let result = RStarTree::open(FileBackend::open(&path).unwrap(), &OpenOptions::new());
        assert!(matches!(result, Err(SpatialError::CorruptHeader(_))));

        // Refuses to overwrite an existing index.
        fs::write(&path, &original).unwrap();
        let result = RStarTree::create(FileBackend::create(&path).unwrap(), &TreeConfig::new(2, 4));
        assert!(matches!(result, Err(SpatialError::AlreadyExists)));
    }

    #[test]
    fn test_create_never_wipes_unreadable_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("newer.rtree");
        {
            let mut tree =
                RStarTree::create(FileBackend::create(&path).unwrap(), &TreeConfig::new(2, 4))
                    .unwrap();
            for i in 0..50u64 {
                tree.insert(diagonal_box(i), i).unwrap();
            }
            tree.close().unwrap();
        }

        let mut newer = fs::read(&path).unwrap();
        newer[4..8].copy_from_slice(&99u32.to_le_bytes());
        fs::write(&path, &newer).unwrap();

        let result = RStarTree::create(FileBackend::create(&path).unwrap(), &TreeConfig::new(2, 4));
        assert!(matches!(
            result,
            Err(SpatialError::UnsupportedVersion { found: 99, .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), newer);

        let mut damaged = newer.clone();
        damaged[4..8].copy_from_slice(&disk_rstar::rtree::rtree_constants::VERSION.to_le_bytes());
        damaged[22] ^= 0xFF;
        fs::write(&path, &damaged).unwrap();

        let result = RStarTree::create(FileBackend::create(&path).unwrap(), &TreeConfig::new(2, 4));
        assert!(matches!(result, Err(SpatialError::CorruptHeader(_))));
        assert_eq!(fs::read(&path).unwrap(), damaged);
    }

    #[test]
    fn test_invalid_configuration() {
        for config in [TreeConfig::new(2, 1), TreeConfig::new(0, 8)] {
            let result = RStarTree::create(MemoryBackend::new(), &config);
            assert!(matches!(result, Err(SpatialError::Capacity(_))));
        }

        let config = TreeConfig::new(2, 64).with_options(TreeOptions::default().with_buffer_size(16));
        let result = RStarTree::create(MemoryBackend::new(), &config);
        assert!(matches!(result, Err(SpatialError::Capacity(_))));
    }

    #[test]
    fn test_corrupted_leaf_detected_during_search() {
        init_logger();
        let config = TreeConfig::new(2, 4).with_options(TreeOptions::default().with_cache_pages(0));
        let mut tree = RStarTree::create(MemoryBackend::new(), &config).unwrap();
        // Nine entries: at least three leaves under a single root, and the
        // root is never the last slot.
        for i in 0..9u64 {
            tree.insert(diagonal_box(i * 3), i).unwrap();
        }
        assert_eq!(tree.height(), 2);
        let mut bytes = tree.into_backend().unwrap().into_bytes();

        let record_size = worst_case_record_size(4, 2).unwrap();
        let last_slot = bytes.len() - record_size;
        // First payload byte, past the 12-byte slot prefix.
        bytes[last_slot + 12] ^= 0x5A;

        let mut tree =
            RStarTree::open(MemoryBackend::from_bytes(bytes), &OpenOptions::new().with_options(
                TreeOptions::default().with_cache_pages(0),
            ))
            .unwrap();
        let results: Vec<_> = tree.search(&rect(-1.0, -1.0, 100.0, 100.0)).unwrap().collect();
        let err = results.last().unwrap().as_ref().unwrap_err();
        assert!(matches!(err, SpatialError::CorruptStructure(_)));
        assert!(err.is_fatal());
        // Iteration stops at the first error.
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);

        let report = tree.check_integrity().unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.corrupted_pages.len(), 1);
    }
}
