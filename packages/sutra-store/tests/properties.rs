/// Property-based invariants: round trips and replay determinism
use proptest::prelude::*;
use sutra_store::{ConceptId, ReconcilerConfig, ShardedStore, StoreConfig};
use tempfile::TempDir;

fn config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        storage_path: dir.path().to_path_buf(),
        vector_dimension: 4,
        num_shards: 1,
        wal_fsync: false,
        reconciler: ReconcilerConfig {
            i_base_ms: 2,
            i_max_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn concept_strategy() -> impl Strategy<Value = (u64, Vec<u8>, Option<Vec<f32>>, f32, f32)> {
    (
        1u64..10_000,
        proptest::collection::vec(any::<u8>(), 0..256),
        proptest::option::of(proptest::collection::vec(-1.0f32..1.0, 4..=4)),
        0.0f32..=1.0,
        0.0f32..=1.0,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// learn + barrier -> read back bitwise content and per-component vectors
    #[test]
    fn prop_concept_round_trip(concepts in proptest::collection::vec(concept_strategy(), 1..12)) {
        let dir = TempDir::new().unwrap();
        let store = ShardedStore::open(config(&dir)).unwrap();

        // Last write per id wins the content slot (first actually: merge keeps
        // content), so track the first occurrence of each id
        let mut expected: std::collections::HashMap<u64, (Vec<u8>, Option<Vec<f32>>)> =
            std::collections::HashMap::new();

        for (raw_id, content, vector, strength, confidence) in &concepts {
            store
                .learn_concept(
                    ConceptId::from_u64(*raw_id),
                    content.clone(),
                    vector.clone(),
                    *strength,
                    *confidence,
                )
                .unwrap();
            let entry = expected.entry(*raw_id).or_insert_with(|| (content.clone(), None));
            // A later vector write replaces the stored vector even on merge
            if vector.is_some() {
                entry.1 = vector.clone();
            }
        }
        store.flush_pending(None).unwrap();

        for (raw_id, (content, vector)) in &expected {
            let id = ConceptId::from_u64(*raw_id);
            let node = store.get_concept(&id).unwrap();
            prop_assert_eq!(node.content.as_ref(), content.as_slice());

            match vector {
                Some(expected_vec) => {
                    let got = store.get_vector(&id).unwrap();
                    prop_assert_eq!(got.len(), expected_vec.len());
                    for (a, b) in got.iter().zip(expected_vec.iter()) {
                        prop_assert!((a - b).abs() < 1e-6);
                    }
                }
                None => prop_assert!(store.get_vector(&id).is_err()),
            }
        }
        store.close().unwrap();
    }

    /// Reopening after a simulated crash reproduces the pre-crash state
    #[test]
    fn prop_wal_replay_determinism(concepts in proptest::collection::vec(concept_strategy(), 1..10)) {
        let dir = TempDir::new().unwrap();

        let expected: Vec<(u64, Vec<u8>)> = {
            let store = ShardedStore::open(config(&dir)).unwrap();
            let mut seen = std::collections::HashMap::new();
            for (raw_id, content, vector, strength, confidence) in &concepts {
                store
                    .learn_concept(
                        ConceptId::from_u64(*raw_id),
                        content.clone(),
                        vector.clone(),
                        *strength,
                        *confidence,
                    )
                    .unwrap();
                seen.entry(*raw_id).or_insert_with(|| content.clone());
            }
            store.flush_pending(None).unwrap();
            // Drop without flush: recovery must come from the WAL alone
            seen.into_iter().collect()
        };

        let store = ShardedStore::open(config(&dir)).unwrap();
        for (raw_id, content) in &expected {
            let node = store.get_concept(&ConceptId::from_u64(*raw_id)).unwrap();
            prop_assert_eq!(node.content.as_ref(), content.as_slice());
        }
        prop_assert_eq!(store.stats().total_concepts, expected.len());
        store.close().unwrap();
    }
}
