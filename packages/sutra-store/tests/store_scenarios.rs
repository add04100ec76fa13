/// End-to-end scenarios for the single-shard store: round trips, crash
/// recovery, adaptive reconciliation, ANN persistence.
use std::time::{Duration, Instant};
use sutra_store::{
    AssociationType, ConceptId, PathConfig, PathStrategy, ReconcilerConfig, ShardedStore,
    StoreConfig, StoreError,
};
use tempfile::TempDir;

fn id(n: u64) -> ConceptId {
    ConceptId::from_u64(n)
}

fn base_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        storage_path: dir.path().to_path_buf(),
        vector_dimension: 4,
        num_shards: 1,
        wal_fsync: false,
        reconciler: ReconcilerConfig {
            i_base_ms: 5,
            i_max_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn scenario_single_shard_round_trip() {
    let dir = TempDir::new().unwrap();

    {
        let store = ShardedStore::open(base_config(&dir)).unwrap();

        let a = id(1);
        let b = id(2);
        store
            .learn_concept(a, b"alpha".to_vec(), Some(vec![1.0, 0.0, 0.0, 0.0]), 1.0, 0.9)
            .unwrap();
        store
            .learn_concept(b, b"beta".to_vec(), Some(vec![0.0, 1.0, 0.0, 0.0]), 1.0, 0.9)
            .unwrap();
        store
            .create_association(a, b, AssociationType::Semantic, 0.8)
            .unwrap();
        store.flush_pending(None).unwrap();

        // Vector search: exact hit at distance 0, orthogonal at 1
        let results = store.semantic_search(&[1.0, 0.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, a);
        assert!(results[0].1.abs() < 1e-4);
        assert_eq!(results[1].0, b);
        assert!((results[1].1 - 1.0).abs() < 1e-4);

        // One path A -> B with confidence equal to the single edge weight
        let paths = store
            .find_paths(
                a,
                &[b],
                Some(PathConfig {
                    strategy: PathStrategy::Bfs,
                    max_depth: 3,
                    ..Default::default()
                }),
            )
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].concepts, vec![a, b]);
        assert!((paths[0].confidence - 0.8).abs() < 1e-5);

        store.close().unwrap();
    }

    // Reopen and re-query: identical results
    {
        let store = ShardedStore::open(base_config(&dir)).unwrap();

        let results = store.semantic_search(&[1.0, 0.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, id(1));

        let paths = store.find_paths(id(1), &[id(2)], None).unwrap();
        assert_eq!(paths.len(), 1);
        assert!((paths[0].confidence - 0.8).abs() < 1e-5);

        let concept = store.get_concept(&id(1)).unwrap();
        assert_eq!(concept.content.as_ref(), b"alpha");

        store.close().unwrap();
    }
}

#[test]
fn scenario_crash_recovery_from_wal() {
    let dir = TempDir::new().unwrap();
    let concepts = 300u64;
    let edges = 600u64;

    {
        let store = ShardedStore::open(base_config(&dir)).unwrap();
        for i in 0..concepts {
            let mut vector = vec![0.0f32; 4];
            vector[(i % 4) as usize] = 1.0;
            store
                .learn_concept(id(i), format!("concept {}", i).into_bytes(), Some(vector), 1.0, 0.9)
                .unwrap();
        }
        for i in 0..edges {
            let src = i % concepts;
            let dst = (i * 7 + 1) % concepts;
            if src != dst {
                store
                    .create_association(id(src), id(dst), AssociationType::Semantic, 0.7)
                    .unwrap();
            }
        }
        store.flush_pending(None).unwrap();
        // No flush(): the segment is never written. Dropping simulates the
        // process dying with only the WAL on disk.
    }

    let store = ShardedStore::open(base_config(&dir)).unwrap();
    let stats = store.stats();
    assert_eq!(stats.total_concepts, concepts as usize);
    assert!(stats.total_edges > 0);

    for i in (0..concepts).step_by(37) {
        let concept = store.get_concept(&id(i)).unwrap();
        assert_eq!(concept.content.as_ref(), format!("concept {}", i).as_bytes());
        assert_eq!(store.get_vector(&id(i)).unwrap().len(), 4);
    }
    store.close().unwrap();
}

#[test]
fn scenario_reconciler_adapts_to_load() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    // Small queue and batch so a burst visibly backs the reconciler up
    config.reconciler = ReconcilerConfig {
        q_max: 100,
        batch_budget: 50,
        i_min_ms: 1,
        i_base_ms: 10,
        i_max_ms: 100,
        ..Default::default()
    };
    let store = ShardedStore::open(config).unwrap();

    // Idle: the interval backs off to the maximum
    let idle_deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let interval = store.stats().shard_stats[0]
            .reconciler
            .as_ref()
            .unwrap()
            .current_interval_ms;
        if interval == 100 {
            break;
        }
        assert!(Instant::now() < idle_deadline, "interval never reached i_max");
        std::thread::sleep(Duration::from_millis(20));
    }

    // Burst: the interval collapses below the base
    let mut saw_hot = false;
    let mut min_interval = u64::MAX;
    for i in 0..2000u64 {
        let ack = store
            .learn_concept(id(i), vec![i as u8], None, 1.0, 0.9)
            .unwrap();
        saw_hot |= ack.hot;
    }
    assert!(saw_hot, "burst past the watermark should ack hot");

    // Keep sampling the interval while the backlog drains
    let drain_deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = store.stats();
        let reconciler = stats.shard_stats[0].reconciler.clone().unwrap();
        min_interval = min_interval.min(reconciler.current_interval_ms);
        if reconciler.queue_depth == 0 {
            break;
        }
        assert!(Instant::now() < drain_deadline, "backlog never drained");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(min_interval <= 10, "interval should shorten under load, saw {}", min_interval);

    store.flush_pending(None).unwrap();
    assert_eq!(store.stats().total_concepts, 2000);
    store.close().unwrap();
}

#[test]
fn scenario_ann_persistence_no_rebuild() {
    let dir = TempDir::new().unwrap();

    {
        let store = ShardedStore::open(base_config(&dir)).unwrap();
        for i in 0..500u64 {
            let mut vector = vec![0.1f32; 4];
            vector[(i % 4) as usize] = 0.9;
            store
                .learn_concept(id(i), format!("v{}", i).into_bytes(), Some(vector), 1.0, 0.9)
                .unwrap();
        }
        store.close().unwrap();
    }

    // The persisted index and sidecar are on disk
    assert!(dir.path().join("storage.usearch").exists());
    assert!(dir.path().join("storage.hnsw.meta").exists());

    let store = ShardedStore::open(base_config(&dir)).unwrap();
    let stats = store.stats();
    assert_eq!(stats.total_vectors, 500);

    // First search works straight after the mmap load
    let results = store.semantic_search(&[0.9, 0.1, 0.1, 0.1], 10, None).unwrap();
    assert_eq!(results.len(), 10);
    store.close().unwrap();
}

#[test]
fn scenario_empty_store_queries() {
    let dir = TempDir::new().unwrap();
    let store = ShardedStore::open(base_config(&dir)).unwrap();

    assert!(store.semantic_search(&[1.0, 0.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    assert!(matches!(
        store.find_paths(id(1), &[id(2)], None),
        Err(StoreError::NotFound)
    ));
    assert_eq!(store.stats().total_concepts, 0);
    store.close().unwrap();
}

#[test]
fn scenario_zero_vector_allowed() {
    let dir = TempDir::new().unwrap();
    let store = ShardedStore::open(base_config(&dir)).unwrap();

    store
        .learn_concept(id(1), b"null island".to_vec(), Some(vec![0.0; 4]), 1.0, 0.9)
        .unwrap();
    store
        .learn_concept(id(2), b"axis".to_vec(), Some(vec![1.0, 0.0, 0.0, 0.0]), 1.0, 0.9)
        .unwrap();
    store.flush_pending(None).unwrap();

    let results = store.semantic_search(&[0.0, 1.0, 0.0, 0.0], 2, None).unwrap();
    assert_eq!(results.len(), 2);
    store.close().unwrap();
}

#[test]
fn scenario_ef_search_override() {
    let dir = TempDir::new().unwrap();
    let store = ShardedStore::open(base_config(&dir)).unwrap();

    for i in 0..100u64 {
        let mut vector = vec![0.25f32; 4];
        vector[(i % 4) as usize] += (i as f32 % 10.0) / 20.0;
        store
            .learn_concept(id(i), vec![i as u8], Some(vector), 1.0, 0.9)
            .unwrap();
    }
    store.flush_pending(None).unwrap();

    let wide = store.semantic_search(&[0.5, 0.25, 0.25, 0.25], 10, Some(200)).unwrap();
    assert_eq!(wide.len(), 10);
    store.close().unwrap();
}
