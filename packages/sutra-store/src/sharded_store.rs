/// Sharded store - hash-partitioned horizontal scaling
///
/// Distributes concepts across independent shards, each a full
/// ConcurrentMemory instance with its own WAL, segment and HNSW index.
///
/// Dispatch rules:
/// - Point operations route to the owning shard of the concept
/// - Neighbor queries are local: out-edges live with their source, and
///   cross-shard edges leave a reverse-direction companion on the far shard
/// - Cross-shard associations go through the 2PC coordinator
/// - Semantic search fans out to every shard and merges by distance
/// - Pathfinding starts on the owning shard of the start node and follows
///   ids across shard boundaries through a pinned cross-shard view
use crate::concurrent_memory::{ConcurrentConfig, ConcurrentMemory, ConcurrentStats, WriteAck};
use crate::consensus::{aggregate_paths, AnswerPath, Consensus};
use crate::error::{Result, StoreError, TxnAbortReason};
use crate::hnsw_container::HnswConfig;
use crate::pathfinder::{GraphAccess, PathConfig, PathFinder};
use crate::read_view::{ConceptNode, GraphSnapshot};
use crate::reconciler::ReconcilerConfig;
use crate::transaction::{TransactionCoordinator, TxnCoordinatorStats, TxnError, TxnOperation};
use crate::types::{AssociationRecord, AssociationType, ConceptId, GraphPath};
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Store configuration, supplied once at open
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Parent directory; shards live in `shard_0000`, `shard_0001`, ...
    /// when `num_shards > 1`, or directly here for a single shard
    pub storage_path: PathBuf,

    /// Vector dimension, immutable after first open
    pub vector_dimension: u32,

    /// Shard count, fixed at store creation
    pub num_shards: u32,

    pub read_only: bool,
    pub wal_fsync: bool,

    pub reconciler: ReconcilerConfig,
    pub ann: HnswConfig,
    pub pathfinder: PathConfig,

    /// 2PC transaction timeout in seconds
    pub txn_timeout_secs: u32,

    pub capacity: Option<crate::concurrent_memory::CapacityLimits>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./sutra_store"),
            vector_dimension: 768,
            num_shards: 1,
            read_only: false,
            wal_fsync: true,
            reconciler: ReconcilerConfig::default(),
            ann: HnswConfig::default(),
            pathfinder: PathConfig::default(),
            txn_timeout_secs: 5,
            capacity: None,
        }
    }
}

/// Deterministic shard routing. DefaultHasher keys are fixed, so placement
/// is stable across process restarts.
pub(crate) fn shard_of(id: &ConceptId, num_shards: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    id.0.hash(&mut hasher);
    (hasher.finish() % num_shards as u64) as u32
}

/// Pinned snapshots of every shard, routable by concept id. One shard
/// lookup per hop that crosses a boundary.
struct CrossShardView {
    snapshots: Vec<Arc<GraphSnapshot>>,
}

impl GraphAccess for CrossShardView {
    fn node(&self, id: &ConceptId) -> Option<ConceptNode> {
        let shard = shard_of(id, self.snapshots.len() as u32) as usize;
        self.snapshots[shard].get_concept(id)
    }
}

/// Sharded storage manager and public store facade
pub struct ShardedStore {
    config: StoreConfig,
    shards: Vec<Arc<ConcurrentMemory>>,
    coordinator: Arc<TransactionCoordinator>,
    sweeper_running: Arc<AtomicBool>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ShardedStore {
    /// Open (or create) the store, running recovery on every shard
    pub fn open(config: StoreConfig) -> Result<Self> {
        if config.num_shards == 0 {
            return Err(StoreError::Corrupt("num_shards must be >= 1".into()));
        }
        std::fs::create_dir_all(&config.storage_path)?;
        validate_layout(&config)?;

        let mut shards = Vec::with_capacity(config.num_shards as usize);
        for shard_id in 0..config.num_shards {
            let shard_path = if config.num_shards == 1 {
                config.storage_path.clone()
            } else {
                config.storage_path.join(format!("shard_{:04}", shard_id))
            };

            let shard_config = ConcurrentConfig {
                storage_path: shard_path,
                vector_dimension: config.vector_dimension,
                shard_id,
                read_only: config.read_only,
                wal_fsync: config.wal_fsync,
                reconciler: config.reconciler.clone(),
                ann: config.ann.clone(),
                pathfinder: config.pathfinder.clone(),
                capacity: config.capacity,
            };

            shards.push(Arc::new(ConcurrentMemory::open(shard_config)?));
            log::info!("Initialized shard {}/{}", shard_id + 1, config.num_shards);
        }

        let coordinator = Arc::new(TransactionCoordinator::new(config.txn_timeout_secs as u64));
        let sweeper_running = Arc::new(AtomicBool::new(false));

        let store = Self {
            config,
            shards,
            coordinator,
            sweeper_running,
            sweeper: parking_lot::Mutex::new(None),
        };
        store.start_sweeper();
        Ok(store)
    }

    /// Periodic sweep: force-abort coordinator transactions past the
    /// timeout, and let participants presume abort past twice the timeout.
    fn start_sweeper(&self) {
        if self.config.read_only {
            return;
        }
        self.sweeper_running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.sweeper_running);
        let coordinator = Arc::clone(&self.coordinator);
        let shards: Vec<Arc<ConcurrentMemory>> = self.shards.clone();
        let participant_patience = coordinator.timeout() * 2;

        let handle = std::thread::Builder::new()
            .name("sutra-txn-sweep".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(250));
                    let aborted = coordinator.cleanup_timedout();
                    if aborted > 0 {
                        log::warn!("Txn sweep force-aborted {} transactions", aborted);
                    }
                    for shard in &shards {
                        shard.sweep_prepared(participant_patience);
                    }
                }
            })
            .expect("failed to spawn txn sweep thread");

        *self.sweeper.lock() = Some(handle);
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn num_shards(&self) -> u32 {
        self.config.num_shards
    }

    pub fn shard_id_of(&self, id: &ConceptId) -> u32 {
        shard_of(id, self.config.num_shards)
    }

    fn shard(&self, id: &ConceptId) -> &Arc<ConcurrentMemory> {
        &self.shards[self.shard_id_of(id) as usize]
    }

    /// Direct handle to one shard's engine
    pub fn shard_handle(&self, shard_id: u32) -> &Arc<ConcurrentMemory> {
        &self.shards[shard_id as usize]
    }

    // ========================
    // POINT OPERATIONS
    // ========================

    pub fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
    ) -> Result<WriteAck> {
        self.shard(&id).learn_concept(id, content, vector, strength, confidence)
    }

    pub fn get_concept(&self, id: &ConceptId) -> Result<ConceptNode> {
        self.shard(id).get_concept(id)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.shard(id).contains(id)
    }

    pub fn delete_concept(&self, id: ConceptId) -> Result<WriteAck> {
        self.shard(&id).delete_concept(id)
    }

    pub fn set_vector(&self, id: ConceptId, vector: Vec<f32>) -> Result<WriteAck> {
        self.shard(&id).set_vector(id, vector)
    }

    pub fn get_vector(&self, id: &ConceptId) -> Result<Vec<f32>> {
        self.shard(id).get_vector(id)
    }

    /// Local to the owning shard: out-edges live with their source, and
    /// cross-shard in-edges left a companion copy here
    pub fn get_neighbors(&self, id: &ConceptId) -> Result<Vec<(ConceptId, AssociationType, f32)>> {
        self.shard(id).get_neighbors(id)
    }

    // ========================
    // ASSOCIATIONS
    // ========================

    /// Create a directed association. Same-shard pairs take the fast path;
    /// cross-shard pairs run two-phase commit, installing the forward edge
    /// on the source shard and a reverse-direction companion on the target
    /// shard so neighbor queries stay local. On success both edges are
    /// visible; on abort neither is.
    pub fn create_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
    ) -> Result<WriteAck> {
        let source_shard = self.shard_id_of(&source);
        let target_shard = self.shard_id_of(&target);

        if source_shard == target_shard {
            // Fast path: no coordination needed
            return self.shards[source_shard as usize]
                .create_association(source, target, assoc_type, weight);
        }

        let record = AssociationRecord::new(source, target, assoc_type, weight.clamp(0.0, 1.0));
        self.create_association_2pc(record, source_shard, target_shard)
    }

    fn create_association_2pc(
        &self,
        record: AssociationRecord,
        source_shard: u32,
        target_shard: u32,
    ) -> Result<WriteAck> {
        let deadline = Instant::now() + self.coordinator.timeout();

        // Participants must see both endpoints; make enqueued learns visible
        self.shards[source_shard as usize].flush_pending(Some(deadline))?;
        self.shards[target_shard as usize].flush_pending(Some(deadline))?;

        let txn_id = self.coordinator.begin(TxnOperation::CreateAssociation {
            record,
            source_shard,
            target_shard,
        });

        // Forward edge on the source shard, companion on the target shard.
        // Prepare in lesser-endpoint-id order to keep lock acquisition
        // deadlock-free.
        let mut legs = vec![
            (source_shard, record, record.source_id),
            (target_shard, record.companion(), record.target_id),
        ];
        legs.sort_by_key(|(_, _, endpoint)| *endpoint);

        let mut prepared_shards: Vec<u32> = Vec::new();
        for (shard_id, leg_record, endpoint) in &legs {
            let vote = self.shards[*shard_id as usize]
                .prepare_association(txn_id, *leg_record, *endpoint)
                .and_then(|()| {
                    self.coordinator
                        .mark_prepared(txn_id, *shard_id)
                        .map_err(map_txn_error)
                });

            match vote {
                Ok(()) => prepared_shards.push(*shard_id),
                Err(e) => {
                    self.abort_2pc(txn_id, &prepared_shards);
                    return Err(match e {
                        StoreError::Timeout | StoreError::TxnAborted(TxnAbortReason::Timeout) => {
                            StoreError::TxnAborted(TxnAbortReason::Timeout)
                        }
                        StoreError::TxnAborted(reason) => StoreError::TxnAborted(reason),
                        _ => {
                            log::warn!("2PC: participant {} voted NO: {}", shard_id, e);
                            StoreError::TxnAborted(TxnAbortReason::ParticipantRefused)
                        }
                    });
                }
            }
        }

        match self.coordinator.is_ready_to_commit(txn_id) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.abort_2pc(txn_id, &prepared_shards);
                return Err(StoreError::TxnAborted(TxnAbortReason::Timeout));
            }
        }

        self.coordinator.commit(txn_id).map_err(|e| {
            self.abort_2pc(txn_id, &prepared_shards);
            map_txn_error(e)
        })?;

        // Apply on both participants and wait until both edges are visible,
        // so a successful return means every subsequent snapshot shows them
        let mut source_seq = 0;
        for (shard_id, leg_record, _) in &legs {
            let seq = self.shards[*shard_id as usize].commit_prepared(txn_id)?;
            if leg_record.source_id == record.source_id {
                source_seq = seq;
            }
        }
        for (shard_id, _, _) in &legs {
            self.shards[*shard_id as usize].flush_pending(None)?;
        }

        self.coordinator.complete(txn_id);
        Ok(WriteAck {
            sequence: source_seq,
            hot: false,
        })
    }

    fn abort_2pc(&self, txn_id: u64, prepared_shards: &[u32]) {
        let _ = self.coordinator.abort(txn_id);
        for shard_id in prepared_shards {
            if let Err(e) = self.shards[*shard_id as usize].abort_prepared(txn_id) {
                log::warn!("2PC: abort on shard {} failed: {}", shard_id, e);
            }
        }
        self.coordinator.complete(txn_id);
    }

    // ========================
    // QUERIES
    // ========================

    /// Fan-out k-NN over every shard, merged by increasing distance. Each
    /// shard searches with budget max(ceil(k/S), 10).
    pub fn semantic_search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        let per_shard_k = k.div_ceil(self.config.num_shards as usize).max(10);

        let mut all_results: Vec<(ConceptId, f32)> = self
            .shards
            .par_iter()
            .map(|shard| shard.semantic_search(query, per_shard_k, ef))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        all_results.sort_by(|a, b| a.1.total_cmp(&b.1));
        all_results.truncate(k);
        Ok(all_results)
    }

    /// Bounded-depth multi-path search. Runs against pinned snapshots of
    /// all shards so traversal can follow edges across shard boundaries.
    pub fn find_paths(
        &self,
        start: ConceptId,
        targets: &[ConceptId],
        params: Option<PathConfig>,
    ) -> Result<Vec<GraphPath>> {
        let view = CrossShardView {
            snapshots: self.shards.iter().map(|s| s.snapshot()).collect(),
        };

        if view.node(&start).is_none() || targets.iter().any(|t| view.node(t).is_none()) {
            return Err(StoreError::NotFound);
        }

        let config = params.unwrap_or_else(|| self.config.pathfinder.clone());
        Ok(PathFinder::new(config).find_paths(&view, start, targets))
    }

    /// Consensus over alternative reasoning outputs. Pure function, no
    /// store state involved.
    pub fn aggregate_paths(&self, answers: &[AnswerPath]) -> Option<Consensus> {
        aggregate_paths(answers)
    }

    // ========================
    // SYSTEM
    // ========================

    /// Barrier over every shard; returns the highest snapshot sequence
    pub fn flush_pending(&self, deadline: Option<Instant>) -> Result<u64> {
        let mut max_seq = 0;
        for shard in &self.shards {
            max_seq = max_seq.max(shard.flush_pending(deadline)?);
        }
        Ok(max_seq)
    }

    /// Flush all shards to durable storage (parallel)
    pub fn flush(&self) -> Result<()> {
        self.shards.par_iter().try_for_each(|shard| shard.flush())
    }

    /// Close the store: flush every shard, stop background threads
    pub fn close(&self) -> Result<()> {
        self.stop_sweeper();
        for shard in &self.shards {
            shard.close()?;
        }
        Ok(())
    }

    fn stop_sweeper(&self) {
        self.sweeper_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.join().ok();
        }
    }

    /// Aggregated statistics across all shards
    pub fn stats(&self) -> AggregatedStats {
        let shard_stats: Vec<ConcurrentStats> = self.shards.iter().map(|s| s.stats()).collect();

        AggregatedStats {
            num_shards: self.config.num_shards,
            total_concepts: shard_stats.iter().map(|s| s.snapshot.concept_count).sum(),
            total_edges: shard_stats.iter().map(|s| s.snapshot.edge_count).sum(),
            total_vectors: shard_stats.iter().map(|s| s.ann.num_vectors).sum(),
            queue_utilization: shard_stats
                .iter()
                .filter_map(|s| s.reconciler.as_ref().map(|r| r.queue_utilization))
                .fold(0.0, f64::max),
            health_score: shard_stats
                .iter()
                .map(|s| s.health_score)
                .fold(1.0, f64::min),
            txn: self.coordinator.stats(),
            shard_stats,
        }
    }
}

impl Drop for ShardedStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

fn map_txn_error(e: TxnError) -> StoreError {
    match e {
        TxnError::Timeout(_) => StoreError::TxnAborted(TxnAbortReason::Timeout),
        TxnError::NotFound(_) => StoreError::TxnAborted(TxnAbortReason::Network),
        _ => StoreError::TxnAborted(TxnAbortReason::ParticipantRefused),
    }
}

/// Reject opens whose shard layout disagrees with the directory contents
fn validate_layout(config: &StoreConfig) -> Result<()> {
    let root_segment = config.storage_path.join("storage.dat");
    let mut shard_dirs = 0u32;
    if let Ok(entries) = std::fs::read_dir(&config.storage_path) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("shard_") {
                    shard_dirs += 1;
                }
            }
        }
    }

    if config.num_shards == 1 && shard_dirs > 0 {
        return Err(StoreError::Corrupt(format!(
            "directory holds {} shard subdirectories but num_shards is 1",
            shard_dirs
        )));
    }
    if config.num_shards > 1 {
        if root_segment.exists() {
            return Err(StoreError::Corrupt(
                "directory holds a single-shard store but num_shards > 1".into(),
            ));
        }
        if shard_dirs > config.num_shards {
            return Err(StoreError::Corrupt(format!(
                "directory holds {} shard subdirectories but num_shards is {}",
                shard_dirs, config.num_shards
            )));
        }
    }
    Ok(())
}

/// Aggregated statistics across all shards
#[derive(Debug, Clone)]
pub struct AggregatedStats {
    pub num_shards: u32,
    pub total_concepts: usize,
    pub total_edges: usize,
    pub total_vectors: usize,
    pub queue_utilization: f64,
    pub health_score: f64,
    pub txn: TxnCoordinatorStats,
    pub shard_stats: Vec<ConcurrentStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, num_shards: u32) -> StoreConfig {
        StoreConfig {
            storage_path: dir.path().to_path_buf(),
            vector_dimension: 4,
            num_shards,
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
    fn test_shard_routing_is_deterministic_and_balanced() {
        let num_shards = 8;
        let mut counts = vec![0usize; num_shards as usize];

        for i in 0..4000u64 {
            let id = ConceptId::from_u64(i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let shard = shard_of(&id, num_shards);
            assert_eq!(shard, shard_of(&id, num_shards));
            counts[shard as usize] += 1;
        }

        let expected = 4000 / num_shards as usize;
        for count in counts {
            // Within 5 sqrt(N/S) of the mean
            let tolerance = 5.0 * (expected as f64).sqrt();
            assert!(
                (count as f64 - expected as f64).abs() <= tolerance,
                "shard imbalance: {} vs expected {}",
                count,
                expected
            );
        }
    }

    #[test]
    fn test_basic_sharded_operations() {
        let dir = TempDir::new().unwrap();
        let store = ShardedStore::open(test_config(&dir, 4)).unwrap();

        for i in 0..100u64 {
            let id = ConceptId::from_u64(i);
            store
                .learn_concept(id, format!("concept {}", i).into_bytes(), None, 1.0, 0.9)
                .unwrap();
        }
        store.flush_pending(None).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_concepts, 100);
        assert_eq!(stats.num_shards, 4);

        let populated = stats
            .shard_stats
            .iter()
            .filter(|s| s.snapshot.concept_count > 0)
            .count();
        assert!(populated >= 3, "concepts should spread across shards");

        store.close().unwrap();
    }

    #[test]
    fn test_cross_shard_search() {
        let dir = TempDir::new().unwrap();
        let store = ShardedStore::open(test_config(&dir, 4)).unwrap();

        for i in 0..50u64 {
            let id = ConceptId::from_u64(i);
            let mut vector = vec![0.0f32; 4];
            vector[(i % 4) as usize] = 1.0;
            store
                .learn_concept(id, format!("C{}", i).into_bytes(), Some(vector), 1.0, 0.9)
                .unwrap();
        }
        store.flush_pending(None).unwrap();

        let results = store.semantic_search(&[1.0, 0.0, 0.0, 0.0], 10, None).unwrap();
        assert_eq!(results.len(), 10);
        // Ordered by increasing distance, best matches first
        assert!(results[0].1 <= results[9].1);
        assert!(results[0].1.abs() < 1e-4);

        store.close().unwrap();
    }

    #[test]
    fn test_layout_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        {
            let store = ShardedStore::open(test_config(&dir, 2)).unwrap();
            store.close().unwrap();
        }
        let result = ShardedStore::open(test_config(&dir, 1));
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }
}
