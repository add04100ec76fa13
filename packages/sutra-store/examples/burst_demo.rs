/// Burst ingest demo
///
/// Exercises the store under an unpredictable mix of burst writes, barrier
/// waits, vector search and multi-path reasoning.
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use sutra_store::{AssociationType, ConceptId, ShardedStore, StoreConfig};

fn main() {
    let config = StoreConfig {
        storage_path: "./demo_storage".into(),
        vector_dimension: 8,
        num_shards: 2,
        ..Default::default()
    };

    let store = Arc::new(ShardedStore::open(config).expect("open store"));
    println!("store open: {} shards, dim 8", store.num_shards());

    // Burst 1: write-heavy learning phase
    let start = Instant::now();
    let mut hot_acks = 0u32;
    for i in 0..5_000u64 {
        let id = ConceptId::from_u64(i);
        let content = format!("concept {}: knowledge fragment", i).into_bytes();
        let mut vector = vec![0.1f32; 8];
        vector[(i % 8) as usize] = 0.9;

        match store.learn_concept(id, content, Some(vector), 1.0, 0.9) {
            Ok(ack) if ack.hot => hot_acks += 1,
            Ok(_) => {}
            Err(e) => eprintln!("write failed: {}", e),
        }
    }
    let elapsed = start.elapsed();
    println!(
        "burst: 5000 concepts in {:?} ({:.0} writes/sec, {} hot acks)",
        elapsed,
        5000.0 / elapsed.as_secs_f64(),
        hot_acks
    );

    // Burst 2: associations forming a chain with shortcuts
    for i in 0..2_500u64 {
        let source = ConceptId::from_u64(i);
        let target = ConceptId::from_u64(i + 1);
        store
            .create_association(source, target, AssociationType::Semantic, 0.8)
            .ok();
        if i % 10 == 0 {
            let shortcut = ConceptId::from_u64(i + 5);
            store
                .create_association(source, shortcut, AssociationType::Causal, 0.6)
                .ok();
        }
    }

    // Barrier: everything written so far becomes visible
    let seq = store.flush_pending(None).expect("barrier");
    let stats = store.stats();
    println!(
        "reconciled through snapshot {}: {} concepts, {} edges, health {:.2}",
        seq, stats.total_concepts, stats.total_edges, stats.health_score
    );

    // Concurrent readers while a writer keeps appending
    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let start = Instant::now();
            let mut found = 0u32;
            for round in 0..50u64 {
                let query_idx = (round * 97) % 5_000;
                let mut query = vec![0.1f32; 8];
                query[(query_idx % 8) as usize] = 0.9;
                if let Ok(hits) = store.semantic_search(&query, 10, None) {
                    found += hits.len() as u32;
                }

                let source = ConceptId::from_u64(query_idx);
                let target = ConceptId::from_u64(query_idx + 4);
                if let Ok(paths) = store.find_paths(source, &[target], None) {
                    found += paths.len() as u32;
                }
            }
            (found, start.elapsed())
        })
    };

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 5_000..6_000u64 {
                let id = ConceptId::from_u64(i);
                store
                    .learn_concept(id, format!("late {}", i).into_bytes(), None, 1.0, 0.9)
                    .ok();
            }
        })
    };

    let (hits, read_time) = reader.join().unwrap();
    writer.join().unwrap();
    println!("mixed phase: {} query hits in {:?}, writer uncontended", hits, read_time);

    store.flush_pending(None).expect("barrier");
    let stats = store.stats();
    println!(
        "final: {} concepts, {} edges, {} vectors, queue utilization {:.2}",
        stats.total_concepts, stats.total_edges, stats.total_vectors, stats.queue_utilization
    );

    store.close().expect("close");
    println!("closed; durable state under ./demo_storage");
}
