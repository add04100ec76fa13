/// Concurrent Memory - per-shard coordinator for burst-tolerant storage
///
/// Unified API that hides the write-plane/read-plane split.
///
/// Architecture:
/// - Writes -> WAL (durable) -> WriteLog (lock-free, never blocks)
/// - Reads -> ReadView (immutable snapshot, never blocks)
/// - Background reconciler merges continuously and feeds the ANN index
///
/// Recovery on open: manifest -> segment (CRC-validated) -> WAL tail replay
/// -> ANN load-or-rebuild -> reconciler start. A corrupt segment falls back
/// to WAL-only recovery transparently; the error surfaces only if both
/// paths fail.
use crate::error::{Result, StoreError};
use crate::hnsw_container::{HnswConfig, HnswContainer, HnswStats};
use crate::manifest::Manifest;
use crate::pathfinder::{PathConfig, PathFinder};
use crate::read_view::{ConceptNode, GraphSnapshot, ReadView};
use crate::reconciler::{ReconcileBarrier, Reconciler, ReconcilerConfig, ReconcilerStats};
use crate::segment;
use crate::transaction::PreparedWrite;
use crate::types::{
    current_timestamp_secs, current_timestamp_us, AssociationRecord, AssociationType, ConceptId,
    GraphPath,
};
use crate::wal::{LogEntry, Operation, WriteAheadLog};
use crate::write_log::{ReconcileSignal, WriteEntry, WriteLog, WriteLogStats};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Optional hard limits gating writes with `Capacity`
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CapacityLimits {
    pub max_concepts: usize,
    pub max_vectors: usize,
}

/// Per-shard configuration
#[derive(Debug, Clone)]
pub struct ConcurrentConfig {
    /// Directory holding storage.dat, wal.log, manifest.json, storage.usearch
    pub storage_path: PathBuf,

    /// Vector dimension, immutable after first open
    pub vector_dimension: u32,

    /// Which shard this engine serves
    pub shard_id: u32,

    /// Reject all mutations
    pub read_only: bool,

    /// fsync the WAL on every append (disable only in tests)
    pub wal_fsync: bool,

    pub reconciler: ReconcilerConfig,
    pub ann: HnswConfig,
    pub pathfinder: PathConfig,
    pub capacity: Option<CapacityLimits>,
}

impl Default for ConcurrentConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./storage"),
            vector_dimension: 768,
            shard_id: 0,
            read_only: false,
            wal_fsync: true,
            reconciler: ReconcilerConfig::default(),
            ann: HnswConfig::default(),
            pathfinder: PathConfig::default(),
            capacity: None,
        }
    }
}

impl ConcurrentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vector_dimension == 0 {
            return Err(StoreError::Corrupt("vector_dimension must be > 0".into()));
        }
        self.reconciler.validate()
    }
}

/// Acknowledgement for accepted writes. `hot` is the advisory back-pressure
/// flag: the write succeeded but the queue is above its watermark.
#[derive(Debug, Clone, Copy)]
pub struct WriteAck {
    pub sequence: u64,
    pub hot: bool,
}

/// Main concurrent memory system (one per shard)
pub struct ConcurrentMemory {
    config: ConcurrentConfig,

    /// Write plane (lock-free pending queue)
    write_log: Arc<WriteLog>,

    /// Read plane (immutable snapshots)
    read_view: Arc<ReadView>,

    /// Background reconciler
    reconciler: Mutex<Option<Reconciler>>,

    /// Vector index
    ann: Arc<HnswContainer>,

    /// Write-Ahead Log; absent on read-only handles
    wal: Option<Arc<Mutex<WriteAheadLog>>>,

    signal: Arc<ReconcileSignal>,
    barrier: Arc<ReconcileBarrier>,

    /// Monotonic write sequence
    sequence: AtomicU64,

    /// Set when reconciliation I/O fails persistently
    degraded: Arc<AtomicBool>,

    in_flight: AtomicUsize,
    closed: AtomicBool,

    pathfinder: PathFinder,

    /// 2PC participant state
    prepared: Mutex<HashMap<u64, PreparedWrite>>,
    locked_nodes: Mutex<HashSet<ConceptId>>,
}

/// RAII in-flight counter so `close` can refuse while ops are running
struct OpGuard<'a>(&'a AtomicUsize);

impl<'a> OpGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrentMemory {
    /// Open (or create) a store at the configured path, running recovery
    pub fn open(mut config: ConcurrentConfig) -> Result<Self> {
        config.ann.dimension = config.vector_dimension as usize;
        config.validate()?;
        std::fs::create_dir_all(&config.storage_path)?;

        let manifest_path = config.storage_path.join("manifest.json");
        let manifest = if manifest_path.exists() {
            let manifest = Manifest::load(&manifest_path)?;
            if manifest.vector_dim != config.vector_dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: manifest.vector_dim as usize,
                    actual: config.vector_dimension as usize,
                });
            }
            if manifest.shard_id != config.shard_id {
                return Err(StoreError::Corrupt(format!(
                    "directory belongs to shard {}, expected {}",
                    manifest.shard_id, config.shard_id
                )));
            }
            manifest
        } else {
            Manifest::new(config.vector_dimension, config.shard_id)
        };

        // Boot snapshot from the segment, falling back to WAL-only recovery
        // when the segment fails validation
        let segment_path = config.storage_path.join("storage.dat");
        let wal_path = config.storage_path.join("wal.log");

        let mut replay_from = manifest.last_segment_seq;
        let mut snapshot = GraphSnapshot::new(1);

        if segment_path.exists() {
            match segment::load_segment(&segment_path) {
                Ok(loaded) => {
                    populate_snapshot(&mut snapshot, loaded);
                }
                Err(e @ StoreError::Corrupt(_)) => {
                    if wal_path.exists() {
                        log::error!("Segment corrupt ({}), attempting WAL-only recovery", e);
                        replay_from = 0;
                        snapshot = GraphSnapshot::new(1);
                    } else {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Replay the WAL tail into the boot snapshot
        let mut recovered_seq = manifest.last_segment_seq;
        if wal_path.exists() {
            let entries = WriteAheadLog::replay(&wal_path)?;
            let mut applied = 0usize;
            for entry in entries {
                if entry.sequence <= replay_from {
                    continue;
                }
                recovered_seq = recovered_seq.max(entry.sequence);
                if apply_wal_entry(&mut snapshot, &entry) {
                    applied += 1;
                }
            }
            if applied > 0 {
                log::info!("Replayed {} WAL entries past sequence {}", applied, replay_from);
            }
        }

        snapshot.update_stats();
        let snapshot_seq = snapshot.sequence;
        log::info!(
            "Shard {} recovered: {} concepts, {} edges (sequence {})",
            config.shard_id,
            snapshot.concept_count(),
            snapshot.edge_count(),
            recovered_seq
        );

        // Vector index: mmap load when the sidecars are intact, else rebuild
        let ann = Arc::new(HnswContainer::new(
            config.storage_path.join("storage"),
            config.ann.clone(),
        ));
        let vectors: HashMap<ConceptId, Vec<f32>> = snapshot
            .concepts
            .values()
            .filter_map(|node| node.vector.as_ref().map(|v| (node.id, v.to_vec())))
            .collect();
        ann.load_or_build(&vectors)?;

        let read_view = Arc::new(ReadView::from_snapshot(snapshot));
        let signal = Arc::new(ReconcileSignal::new());
        let write_log = Arc::new(WriteLog::new(config.reconciler.q_max, Arc::clone(&signal)));
        let barrier = Arc::new(ReconcileBarrier::new());
        let degraded = Arc::new(AtomicBool::new(false));

        // Everything recovered so far is already visible
        barrier.publish(recovered_seq, snapshot_seq);

        let wal = if config.read_only {
            None
        } else {
            let wal = if wal_path.exists() {
                WriteAheadLog::open(&wal_path, config.wal_fsync)?
            } else {
                WriteAheadLog::create(&wal_path, config.wal_fsync)?
            };
            // Persist the manifest on first open so reopen checks have
            // something to validate against
            if !manifest_path.exists() {
                manifest.save(&manifest_path)?;
            }
            Some(Arc::new(Mutex::new(wal)))
        };

        let reconciler = wal.as_ref().map(|wal| {
            let mut reconciler = Reconciler::new(
                config.reconciler.clone(),
                Arc::clone(&write_log),
                Arc::clone(&read_view),
                Arc::clone(&ann),
                Arc::clone(wal),
                Arc::clone(&signal),
                Arc::clone(&barrier),
                Arc::clone(&degraded),
            );
            reconciler.start();
            reconciler
        });

        let pathfinder = PathFinder::new(config.pathfinder.clone());

        Ok(Self {
            config,
            write_log,
            read_view,
            reconciler: Mutex::new(reconciler),
            ann,
            wal,
            signal,
            barrier,
            sequence: AtomicU64::new(recovered_seq),
            degraded,
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            pathfinder,
            prepared: Mutex::new(HashMap::new()),
            locked_nodes: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &ConcurrentConfig {
        &self.config
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::InUse);
        }
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        if self.degraded.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store degraded after persistent reconciliation failure",
            )));
        }
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.vector_dimension as usize {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.vector_dimension as usize,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn wal(&self) -> Result<&Arc<Mutex<WriteAheadLog>>> {
        self.wal.as_ref().ok_or(StoreError::ReadOnly)
    }

    // ========================
    // WRITE API (never blocks on readers)
    // ========================

    /// Learn a concept. Idempotent on an existing id: content is kept and
    /// metadata merges (max of strengths/confidences, summed access counts).
    pub fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
    ) -> Result<WriteAck> {
        let _guard = OpGuard::new(&self.in_flight);
        self.check_writable()?;
        if let Some(vec) = &vector {
            self.check_dimension(vec)?;
        }

        if let Some(limits) = self.config.capacity {
            let snap = self.read_view.load();
            if !snap.contains(&id) && snap.concept_count() >= limits.max_concepts {
                return Err(StoreError::Capacity(format!(
                    "concept limit {} reached",
                    limits.max_concepts
                )));
            }
        }

        let strength = strength.clamp(0.0, 1.0);
        let confidence = confidence.clamp(0.0, 1.0);
        let created = current_timestamp_secs();
        let sequence = self.next_sequence();

        // WAL first: the entry carries the full payload so replay can
        // reconstruct state without the segment
        self.wal()?.lock().append(
            sequence,
            Operation::WriteConcept {
                concept_id: id,
                content: content.clone(),
                vector: vector.clone(),
                strength,
                confidence,
                created,
            },
        )?;

        let hot = self
            .write_log
            .append_concept(sequence, id, content, vector, strength, confidence, created);

        Ok(WriteAck { sequence, hot })
    }

    /// Create an association local to this shard
    pub fn create_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
    ) -> Result<WriteAck> {
        let _guard = OpGuard::new(&self.in_flight);
        self.check_writable()?;

        let record = AssociationRecord::new(source, target, assoc_type, weight.clamp(0.0, 1.0));
        let sequence = self.next_sequence();

        self.wal()?
            .lock()
            .append(sequence, Operation::WriteAssociation { record })?;
        let hot = self.write_log.append_association(sequence, record);

        Ok(WriteAck { sequence, hot })
    }

    /// Delete a concept and all adjacent edges in the next snapshot
    pub fn delete_concept(&self, id: ConceptId) -> Result<WriteAck> {
        let _guard = OpGuard::new(&self.in_flight);
        self.check_writable()?;

        if !self.read_view.load().contains(&id) {
            return Err(StoreError::NotFound);
        }

        let sequence = self.next_sequence();
        self.wal()?
            .lock()
            .append(sequence, Operation::DeleteConcept { concept_id: id })?;
        let hot = self.write_log.append(sequence, WriteEntry::DeleteConcept { id });

        Ok(WriteAck { sequence, hot })
    }

    /// Set or replace a concept's vector
    pub fn set_vector(&self, id: ConceptId, vector: Vec<f32>) -> Result<WriteAck> {
        let _guard = OpGuard::new(&self.in_flight);
        self.check_writable()?;
        self.check_dimension(&vector)?;

        let snap = self.read_view.load();
        let node = snap.concepts.get(&id).ok_or(StoreError::NotFound)?;

        if let Some(limits) = self.config.capacity {
            let vector_count = snap.concepts.values().filter(|n| n.vector.is_some()).count();
            if node.vector.is_none() && vector_count >= limits.max_vectors {
                return Err(StoreError::Capacity(format!(
                    "vector limit {} reached",
                    limits.max_vectors
                )));
            }
        }

        let sequence = self.next_sequence();
        self.wal()?.lock().append(
            sequence,
            Operation::WriteVector {
                concept_id: id,
                vector: vector.clone(),
            },
        )?;
        let hot = self.write_log.append(
            sequence,
            WriteEntry::SetVector {
                id,
                vector: vector.into_boxed_slice(),
            },
        );

        Ok(WriteAck { sequence, hot })
    }

    /// Update concept strength (for temporal decay driven by the host)
    pub fn update_strength(&self, id: ConceptId, strength: f32) -> Result<WriteAck> {
        let _guard = OpGuard::new(&self.in_flight);
        self.check_writable()?;

        let sequence = self.next_sequence();
        let hot = self.write_log.append(
            sequence,
            WriteEntry::UpdateStrength {
                id,
                strength: strength.clamp(0.0, 1.0),
            },
        );
        Ok(WriteAck { sequence, hot })
    }

    // ========================
    // READ API (never blocks)
    // ========================

    /// Query a concept by ID. Bumps the access counter through the write
    /// log, deferred until the next reconciliation.
    pub fn get_concept(&self, id: &ConceptId) -> Result<ConceptNode> {
        let _guard = OpGuard::new(&self.in_flight);
        let node = self.read_view.load().get_concept(id).ok_or(StoreError::NotFound)?;

        if !self.config.read_only && !self.closed.load(Ordering::SeqCst) {
            let sequence = self.next_sequence();
            self.write_log.append(
                sequence,
                WriteEntry::RecordAccess {
                    id: *id,
                    timestamp: current_timestamp_us(),
                },
            );
        }

        Ok(node)
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.read_view.load().contains(id)
    }

    /// Out-neighbors with type and weight, strongest first
    pub fn get_neighbors(&self, id: &ConceptId) -> Result<Vec<(ConceptId, AssociationType, f32)>> {
        let snap = self.read_view.load();
        if !snap.contains(id) {
            return Err(StoreError::NotFound);
        }
        Ok(snap.get_neighbors(id))
    }

    pub fn get_vector(&self, id: &ConceptId) -> Result<Vec<f32>> {
        self.read_view
            .load()
            .get_vector(id)
            .map(|v| v.to_vec())
            .ok_or(StoreError::NotFound)
    }

    /// Pin the current snapshot for external traversal
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.read_view.load()
    }

    // ========================
    // QUERY API
    // ========================

    /// k-nearest-neighbor search over the vector index. Returns
    /// `(concept_id, cosine distance)` in increasing distance order.
    pub fn semantic_search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
    ) -> Result<Vec<(ConceptId, f32)>> {
        let _guard = OpGuard::new(&self.in_flight);
        self.check_dimension(query)?;
        Ok(self.ann.search(query, k, ef))
    }

    /// Bounded-depth multi-path search from `start` to any of `targets`
    pub fn find_paths(
        &self,
        start: ConceptId,
        targets: &[ConceptId],
        params: Option<PathConfig>,
    ) -> Result<Vec<GraphPath>> {
        let _guard = OpGuard::new(&self.in_flight);
        let snapshot = self.read_view.load();

        if !snapshot.contains(&start) || targets.iter().any(|t| !snapshot.contains(t)) {
            return Err(StoreError::NotFound);
        }

        let paths = match params {
            Some(config) => PathFinder::new(config).find_paths(&snapshot, start, targets),
            None => self.pathfinder.find_paths(&snapshot, start, targets),
        };
        Ok(paths)
    }

    // ========================
    // 2PC PARTICIPANT API
    // ========================

    /// Phase 1: validate the local endpoint, lock it, append an uncommitted
    /// PREPARE to the WAL. Returning Ok is the YES vote; after that this
    /// shard must be able to commit.
    pub fn prepare_association(
        &self,
        txn_id: u64,
        record: AssociationRecord,
        local_endpoint: ConceptId,
    ) -> Result<()> {
        let _guard = OpGuard::new(&self.in_flight);
        self.check_writable()?;

        if !self.read_view.load().contains(&local_endpoint) {
            return Err(StoreError::NotFound);
        }

        {
            let mut locked = self.locked_nodes.lock();
            if !locked.insert(local_endpoint) {
                // Another transaction holds this node
                return Err(StoreError::TxnAborted(
                    crate::error::TxnAbortReason::ParticipantRefused,
                ));
            }
        }

        let sequence = self.next_sequence();
        let wal_offset = match self
            .wal()?
            .lock()
            .append_uncommitted(sequence, Operation::TxnPrepare { txn_id, record })
        {
            Ok(offset) => offset,
            Err(e) => {
                self.locked_nodes.lock().remove(&local_endpoint);
                return Err(e);
            }
        };

        self.prepared.lock().insert(
            txn_id,
            PreparedWrite {
                txn_id,
                record,
                locked: local_endpoint,
                wal_offset,
                prepared_at: Instant::now(),
            },
        );

        Ok(())
    }

    /// Phase 2, COMMIT decision: flip the prepared WAL record, append the
    /// terminal record, apply the edge, release the lock. Returns the
    /// sequence of the applied write for barrier waits.
    pub fn commit_prepared(&self, txn_id: u64) -> Result<u64> {
        let _guard = OpGuard::new(&self.in_flight);

        let prepared = self
            .prepared
            .lock()
            .remove(&txn_id)
            .ok_or(StoreError::TxnAborted(crate::error::TxnAbortReason::Timeout))?;

        let sequence = self.next_sequence();
        {
            let wal = self.wal()?;
            let mut wal = wal.lock();
            wal.mark_committed(prepared.wal_offset)?;
            wal.append(sequence, Operation::TxnCommit { txn_id })?;
        }

        self.write_log.append_association(sequence, prepared.record);
        self.locked_nodes.lock().remove(&prepared.locked);

        Ok(sequence)
    }

    /// Phase 2, ABORT decision: leave the PREPARE uncommitted (replay
    /// discards it), append the terminal record, release the lock.
    pub fn abort_prepared(&self, txn_id: u64) -> Result<()> {
        let _guard = OpGuard::new(&self.in_flight);

        let Some(prepared) = self.prepared.lock().remove(&txn_id) else {
            return Ok(());
        };

        if let Ok(wal) = self.wal() {
            let sequence = self.next_sequence();
            if let Err(e) = wal.lock().append(sequence, Operation::TxnAbort { txn_id }) {
                log::warn!("Failed to log abort for txn {}: {}", txn_id, e);
            }
        }
        self.locked_nodes.lock().remove(&prepared.locked);

        Ok(())
    }

    /// Presumed abort: drop prepares stuck past `max_age`. Called by the
    /// router's periodic sweep with twice the transaction timeout.
    pub fn sweep_prepared(&self, max_age: std::time::Duration) -> usize {
        let stale: Vec<u64> = {
            let prepared = self.prepared.lock();
            prepared
                .values()
                .filter(|p| p.prepared_at.elapsed() > max_age)
                .map(|p| p.txn_id)
                .collect()
        };

        for txn_id in &stale {
            log::warn!("2PC: participant unilaterally aborting stale txn {}", txn_id);
            let _ = self.abort_prepared(*txn_id);
        }
        stale.len()
    }

    // ========================
    // SYSTEM API
    // ========================

    /// Reconciliation barrier: blocks until every write issued before this
    /// call is visible in the live snapshot. Returns the snapshot sequence.
    pub fn flush_pending(&self, deadline: Option<Instant>) -> Result<u64> {
        let _guard = OpGuard::new(&self.in_flight);
        let target = self.sequence.load(Ordering::SeqCst);
        self.signal.notify();
        self.barrier.wait_for(target, deadline)
    }

    /// Flush to durable storage: new segment, manifest update, WAL truncate,
    /// ANN save. Writers should be quiesced for the duration; `close`
    /// enforces this with its in-flight check.
    pub fn flush(&self) -> Result<()> {
        let _guard = OpGuard::new(&self.in_flight);
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }

        self.flush_pending(None)?;
        let snapshot = self.read_view.load();

        segment::write_segment(&self.config.storage_path.join("storage.dat"), &snapshot)?;

        let mut manifest = Manifest::new(self.config.vector_dimension, self.config.shard_id);
        manifest.last_segment_seq = self.barrier.applied_seq();
        manifest.save(self.config.storage_path.join("manifest.json"))?;

        // Segment now covers everything; the WAL can restart empty
        self.wal()?.lock().truncate()?;
        self.ann.save()?;

        log::info!(
            "Shard {} flushed: {} concepts durable through sequence {}",
            self.config.shard_id,
            snapshot.concept_count(),
            manifest.last_segment_seq
        );
        Ok(())
    }

    /// Close the store: refuse while ops are in flight, then flush, fsync
    /// and stop the reconciler.
    pub fn close(&self) -> Result<()> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Err(StoreError::InUse);
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.config.read_only && !self.degraded.load(Ordering::SeqCst) {
            self.flush()?;
        }
        if let Some(reconciler) = self.reconciler.lock().as_mut() {
            reconciler.stop();
        }
        Ok(())
    }

    pub fn write_stats(&self) -> WriteLogStats {
        self.write_log.stats()
    }

    pub fn reconciler_stats(&self) -> Option<ReconcilerStats> {
        self.reconciler.lock().as_ref().map(|r| r.stats())
    }

    pub fn ann_stats(&self) -> HnswStats {
        self.ann.stats()
    }

    pub fn snapshot_info(&self) -> SnapshotInfo {
        let (sequence, timestamp, concepts, edges) = self.read_view.snapshot_info();
        SnapshotInfo {
            sequence,
            timestamp,
            concept_count: concepts,
            edge_count: edges,
        }
    }

    /// Complete system statistics
    pub fn stats(&self) -> ConcurrentStats {
        let reconciler = self.reconciler_stats();
        let health_score = reconciler.as_ref().map(|r| r.health_score).unwrap_or(1.0);
        ConcurrentStats {
            write_log: self.write_stats(),
            reconciler,
            snapshot: self.snapshot_info(),
            ann: self.ann_stats(),
            health_score,
            degraded: self.degraded.load(Ordering::SeqCst),
        }
    }
}

impl Drop for ConcurrentMemory {
    fn drop(&mut self) {
        if let Some(reconciler) = self.reconciler.lock().as_mut() {
            reconciler.stop();
        }
    }
}

/// Snapshot metadata
#[derive(Debug, Clone, Copy)]
pub struct SnapshotInfo {
    pub sequence: u64,
    pub timestamp: u64,
    pub concept_count: usize,
    pub edge_count: usize,
}

/// Complete system statistics
#[derive(Debug, Clone)]
pub struct ConcurrentStats {
    pub write_log: WriteLogStats,
    pub reconciler: Option<ReconcilerStats>,
    pub snapshot: SnapshotInfo,
    pub ann: HnswStats,
    pub health_score: f64,
    pub degraded: bool,
}

/// Build the boot snapshot from parsed segment contents. Edge types default
/// to semantic here; WAL replay restores types for entries it still covers.
fn populate_snapshot(snapshot: &mut GraphSnapshot, loaded: segment::LoadedSegment) {
    for concept in loaded.concepts {
        let mut node = ConceptNode::new(
            concept.id,
            concept.content,
            None,
            concept.strength,
            concept.confidence,
            concept.created,
        );
        node.access_count = concept.access_count;
        snapshot.concepts.insert(concept.id, node);
    }

    for edge in loaded.edges {
        if let Some(mut source) = snapshot.concepts.get(&edge.source).cloned() {
            source.add_edge(crate::types::Edge {
                target: edge.target,
                assoc_type: AssociationType::Semantic,
                weight: edge.weight,
            });
            snapshot.concepts.insert(edge.source, source);
        }
        if let Some(mut target) = snapshot.concepts.get(&edge.target).cloned() {
            target.add_inbound(edge.source);
            snapshot.concepts.insert(edge.target, target);
        }
    }

    for (id, vector) in loaded.vectors {
        if let Some(mut node) = snapshot.concepts.get(&id).cloned() {
            node.vector = Some(Arc::from(vector));
            snapshot.concepts.insert(id, node);
        }
    }
}

/// Apply one committed WAL entry to the boot snapshot during recovery.
/// Returns whether the entry mutated state.
fn apply_wal_entry(snapshot: &mut GraphSnapshot, entry: &LogEntry) -> bool {
    match &entry.operation {
        Operation::WriteConcept {
            concept_id,
            content,
            vector,
            strength,
            confidence,
            created,
        } => {
            if let Some(mut existing) = snapshot.concepts.get(concept_id).cloned() {
                existing.merge_metadata(*strength, *confidence, 0);
                if let Some(vec) = vector {
                    existing.vector = Some(Arc::from(vec.clone()));
                }
                snapshot.concepts.insert(*concept_id, existing);
            } else {
                let node = ConceptNode::new(
                    *concept_id,
                    content.clone(),
                    vector.clone(),
                    *strength,
                    *confidence,
                    *created,
                );
                snapshot.concepts.insert(*concept_id, node);
            }
            true
        }
        Operation::WriteAssociation { record } | Operation::TxnPrepare { record, .. } => {
            if let Some(mut source) = snapshot.concepts.get(&record.source_id).cloned() {
                source.add_edge(record.edge());
                snapshot.concepts.insert(record.source_id, source);
                if let Some(mut target) = snapshot.concepts.get(&record.target_id).cloned() {
                    target.add_inbound(record.source_id);
                    snapshot.concepts.insert(record.target_id, target);
                }
                true
            } else {
                false
            }
        }
        Operation::WriteVector { concept_id, vector } => {
            if let Some(mut node) = snapshot.concepts.get(concept_id).cloned() {
                node.vector = Some(Arc::from(vector.clone()));
                snapshot.concepts.insert(*concept_id, node);
                true
            } else {
                false
            }
        }
        Operation::DeleteConcept { concept_id } => {
            if let Some(node) = snapshot.concepts.get(concept_id).cloned() {
                for source_id in &node.inbound {
                    if let Some(mut source) = snapshot.concepts.get(source_id).cloned() {
                        source.remove_edges_to(concept_id);
                        snapshot.concepts.insert(*source_id, source);
                    }
                }
                snapshot.concepts.remove(concept_id);
                true
            } else {
                false
            }
        }
        Operation::TxnCommit { .. } | Operation::TxnAbort { .. } | Operation::Checkpoint { .. } => {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ConcurrentConfig {
        ConcurrentConfig {
            storage_path: dir.path().to_path_buf(),
            vector_dimension: 4,
            wal_fsync: false,
            reconciler: ReconcilerConfig {
                i_base_ms: 5,
                i_max_ms: 20,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn id(n: u64) -> ConceptId {
        ConceptId::from_u64(n)
    }

    #[test]
    fn test_basic_operations() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let ack = memory
            .learn_concept(id(1), b"test concept".to_vec(), None, 1.0, 0.9)
            .unwrap();
        assert_eq!(ack.sequence, 1);
        assert!(!ack.hot);

        memory.flush_pending(None).unwrap();

        let concept = memory.get_concept(&id(1)).unwrap();
        assert_eq!(concept.content.as_ref(), b"test concept");
        assert_eq!(concept.strength, 1.0);
        assert_eq!(concept.confidence, 0.9);

        assert!(matches!(memory.get_concept(&id(2)), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_associations() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
        memory.learn_concept(id(2), vec![2], None, 1.0, 0.9).unwrap();
        memory
            .create_association(id(1), id(2), AssociationType::Causal, 0.8)
            .unwrap();

        memory.flush_pending(None).unwrap();

        let neighbors = memory.get_neighbors(&id(1)).unwrap();
        assert_eq!(neighbors, vec![(id(2), AssociationType::Causal, 0.8)]);

        // Directed: no reverse edge within a shard
        assert!(memory.get_neighbors(&id(2)).unwrap().is_empty());
    }

    #[test]
    fn test_vector_roundtrip_and_search() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        memory
            .learn_concept(id(1), b"alpha".to_vec(), Some(vec![1.0, 0.0, 0.0, 0.0]), 1.0, 0.9)
            .unwrap();
        memory
            .learn_concept(id(2), b"beta".to_vec(), Some(vec![0.0, 1.0, 0.0, 0.0]), 1.0, 0.9)
            .unwrap();
        memory.flush_pending(None).unwrap();

        assert_eq!(memory.get_vector(&id(1)).unwrap(), vec![1.0, 0.0, 0.0, 0.0]);

        let results = memory.semantic_search(&[1.0, 0.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, id(1));
        assert!(results[0].1.abs() < 1e-4);
        assert!((results[1].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let result = memory.learn_concept(id(1), vec![1], Some(vec![1.0, 0.0]), 1.0, 0.9);
        assert!(matches!(
            result,
            Err(StoreError::DimensionMismatch { expected: 4, actual: 2 })
        ));

        memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
        memory.flush_pending(None).unwrap();
        let result = memory.set_vector(id(1), vec![1.0; 8]);
        assert!(matches!(
            result,
            Err(StoreError::DimensionMismatch { expected: 4, actual: 8 })
        ));

        let result = memory.semantic_search(&[1.0; 3], 5, None);
        assert!(matches!(result, Err(StoreError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_set_vector_requires_concept() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        let result = memory.set_vector(id(9), vec![1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[test]
    fn test_delete_concept() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
        memory.learn_concept(id(2), vec![2], None, 1.0, 0.9).unwrap();
        memory
            .create_association(id(1), id(2), AssociationType::Semantic, 0.8)
            .unwrap();
        memory.flush_pending(None).unwrap();

        memory.delete_concept(id(2)).unwrap();
        memory.flush_pending(None).unwrap();

        assert!(!memory.contains(&id(2)));
        // The edge into the deleted concept went with it
        assert!(memory.get_neighbors(&id(1)).unwrap().is_empty());

        assert!(matches!(memory.delete_concept(id(2)), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_find_paths() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
        memory.learn_concept(id(2), vec![2], None, 1.0, 0.9).unwrap();
        memory.learn_concept(id(3), vec![3], None, 1.0, 0.9).unwrap();
        memory
            .create_association(id(1), id(2), AssociationType::Semantic, 0.8)
            .unwrap();
        memory
            .create_association(id(2), id(3), AssociationType::Semantic, 0.8)
            .unwrap();
        memory.flush_pending(None).unwrap();

        let paths = memory.find_paths(id(1), &[id(3)], None).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].concepts, vec![id(1), id(2), id(3)]);

        assert!(matches!(
            memory.find_paths(id(1), &[id(99)], None),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_idempotent_relearn() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        memory.learn_concept(id(1), b"first".to_vec(), None, 0.4, 0.8).unwrap();
        memory.learn_concept(id(1), b"second".to_vec(), None, 0.9, 0.2).unwrap();
        memory.flush_pending(None).unwrap();

        let node = memory.get_concept(&id(1)).unwrap();
        assert_eq!(node.content.as_ref(), b"first");
        assert_eq!(node.strength, 0.9);
        assert_eq!(node.confidence, 0.8);

        assert_eq!(memory.snapshot_info().concept_count, 1);
    }

    #[test]
    fn test_read_only_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            memory.learn_concept(id(1), b"kept".to_vec(), None, 1.0, 0.9).unwrap();
            memory.flush_pending(None).unwrap();
            memory.close().unwrap();
        }

        let config = ConcurrentConfig {
            read_only: true,
            ..test_config(&dir)
        };
        let memory = ConcurrentMemory::open(config).unwrap();

        assert_eq!(memory.get_concept(&id(1)).unwrap().content.as_ref(), b"kept");
        assert!(matches!(
            memory.learn_concept(id(2), vec![2], None, 1.0, 0.9),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(memory.flush(), Err(StoreError::ReadOnly)));
        // Barrier returns immediately: nothing can be pending
        memory.flush_pending(None).unwrap();
    }

    #[test]
    fn test_capacity_limit() {
        let dir = TempDir::new().unwrap();
        let config = ConcurrentConfig {
            capacity: Some(CapacityLimits {
                max_concepts: 2,
                max_vectors: 2,
            }),
            ..test_config(&dir)
        };
        let memory = ConcurrentMemory::open(config).unwrap();

        memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
        memory.learn_concept(id(2), vec![2], None, 1.0, 0.9).unwrap();
        memory.flush_pending(None).unwrap();

        assert!(matches!(
            memory.learn_concept(id(3), vec![3], None, 1.0, 0.9),
            Err(StoreError::Capacity(_))
        ));
        // Re-learning an existing id is still allowed at the limit
        memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            memory
                .learn_concept(id(1), b"alpha".to_vec(), Some(vec![1.0, 0.0, 0.0, 0.0]), 1.0, 0.9)
                .unwrap();
            memory.learn_concept(id(2), b"beta".to_vec(), None, 0.5, 0.7).unwrap();
            memory
                .create_association(id(1), id(2), AssociationType::Hierarchical, 0.6)
                .unwrap();
            memory.close().unwrap();
        }

        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
        assert_eq!(memory.snapshot_info().concept_count, 2);
        assert_eq!(memory.get_concept(&id(1)).unwrap().content.as_ref(), b"alpha");
        assert_eq!(memory.get_vector(&id(1)).unwrap(), vec![1.0, 0.0, 0.0, 0.0]);

        // Edge type was restored from the WAL... or defaulted after
        // truncation; the weight always survives the segment
        let neighbors = memory.get_neighbors(&id(1)).unwrap();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, id(2));
        assert_eq!(neighbors[0].2, 0.6);
    }

    #[test]
    fn test_wal_replay_without_flush() {
        let dir = TempDir::new().unwrap();
        {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            memory
                .learn_concept(id(1), b"survives".to_vec(), Some(vec![0.0, 1.0, 0.0, 0.0]), 1.0, 0.9)
                .unwrap();
            memory.flush_pending(None).unwrap();
            // No flush: drop simulates a crash, storage.dat never written
        }

        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
        let node = memory.get_concept(&id(1)).unwrap();
        assert_eq!(node.content.as_ref(), b"survives");
        assert_eq!(memory.get_vector(&id(1)).unwrap(), vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_reopen_with_wrong_dimension_fails() {
        let dir = TempDir::new().unwrap();
        {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
            memory.close().unwrap();
        }

        let config = ConcurrentConfig {
            vector_dimension: 8,
            ..test_config(&dir)
        };
        assert!(matches!(
            ConcurrentMemory::open(config),
            Err(StoreError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_segment_falls_back_to_wal() {
        let dir = TempDir::new().unwrap();
        {
            let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
            memory.learn_concept(id(1), b"alpha".to_vec(), None, 1.0, 0.9).unwrap();
            memory.flush_pending(None).unwrap();
            // Crash without flush: the WAL holds everything
        }

        // Plant a corrupt segment next to the intact WAL
        std::fs::write(dir.path().join("storage.dat"), vec![0xFF; 80]).unwrap();

        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();
        assert_eq!(memory.get_concept(&id(1)).unwrap().content.as_ref(), b"alpha");
    }

    #[test]
    fn test_access_count_bumped_by_reads() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        memory.learn_concept(id(1), vec![1], None, 1.0, 0.9).unwrap();
        memory.flush_pending(None).unwrap();

        memory.get_concept(&id(1)).unwrap();
        memory.get_concept(&id(1)).unwrap();
        memory.flush_pending(None).unwrap();

        let node = memory.snapshot().get_concept(&id(1)).unwrap();
        assert_eq!(node.access_count, 2);
    }

    #[test]
    fn test_concurrent_read_write() {
        use std::thread;

        let dir = TempDir::new().unwrap();
        let memory = Arc::new(ConcurrentMemory::open(test_config(&dir)).unwrap());

        let writer = Arc::clone(&memory);
        let write_handle = thread::spawn(move || {
            for i in 0..100u64 {
                writer.learn_concept(id(i), vec![i as u8], None, 1.0, 0.9).unwrap();
            }
            writer.flush_pending(None).unwrap();
        });

        let reader = Arc::clone(&memory);
        let read_handle = thread::spawn(move || {
            let mut found = 0;
            for _ in 0..50 {
                for i in 0..100u64 {
                    if reader.contains(&id(i)) {
                        found += 1;
                    }
                }
                thread::yield_now();
            }
            found
        });

        write_handle.join().unwrap();
        read_handle.join().unwrap();

        assert_eq!(memory.snapshot_info().concept_count, 100);
    }

    #[test]
    fn test_snapshot_immutability_under_writes() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        memory.learn_concept(id(1), b"one".to_vec(), None, 1.0, 0.9).unwrap();
        memory.flush_pending(None).unwrap();

        let pinned = memory.snapshot();
        assert_eq!(pinned.concept_count(), 1);

        memory.learn_concept(id(2), b"two".to_vec(), None, 1.0, 0.9).unwrap();
        memory.flush_pending(None).unwrap();

        // The pinned handle still sees the old world
        assert!(!pinned.contains(&id(2)));
        assert_eq!(pinned.concept_count(), 1);
        // New readers see both
        assert_eq!(memory.snapshot().concept_count(), 2);
    }

    #[test]
    fn test_stats_surface() {
        let dir = TempDir::new().unwrap();
        let memory = ConcurrentMemory::open(test_config(&dir)).unwrap();

        for i in 0..10u64 {
            memory.learn_concept(id(i), vec![i as u8], None, 1.0, 0.9).unwrap();
        }
        memory.flush_pending(None).unwrap();

        let stats = memory.stats();
        assert!(stats.write_log.written >= 10);
        assert_eq!(stats.snapshot.concept_count, 10);
        assert!(stats.health_score > 0.0);
        assert!(!stats.degraded);
        let reconciler = stats.reconciler.unwrap();
        assert!(reconciler.entries_processed >= 10);
        assert!(!reconciler.recommendation.is_empty());
    }
}
