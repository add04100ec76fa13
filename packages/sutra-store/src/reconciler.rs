/// Adaptive reconciler - self-tuning write-plane/read-plane merge
///
/// A dedicated thread periodically drains the write log into a successor
/// snapshot, swaps the live pointer, feeds the ANN index, and appends a WAL
/// checkpoint. The sleep interval adapts to load via an EMA of queue depth:
/// idle stores back off to the max interval, hot stores collapse toward the
/// minimum so the queue drains before it can overflow.
use crate::error::{Result, StoreError};
use crate::hnsw_container::HnswContainer;
use crate::read_view::{ConceptNode, GraphSnapshot, ReadView};
use crate::wal::{Operation, WriteAheadLog};
use crate::write_log::{Pending, ReconcileSignal, WriteEntry, WriteLog};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Reconciler configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconcilerConfig {
    /// EMA smoothing factor for queue depth (0-1, higher = more reactive)
    pub alpha: f64,

    /// Queue depth treated as full utilization
    pub q_max: usize,

    /// Minimum interval (milliseconds) - high load
    pub i_min_ms: u64,

    /// Base interval (milliseconds) - nominal load
    pub i_base_ms: u64,

    /// Maximum interval (milliseconds) - idle
    pub i_max_ms: u64,

    /// Max entries drained per cycle
    pub batch_budget: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            q_max: 10_000,
            i_min_ms: 1,
            i_base_ms: 50,
            i_max_ms: 1_000,
            batch_budget: 10_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.alpha <= 0.0 || self.alpha > 1.0 {
            return Err(StoreError::Corrupt(format!(
                "reconciler alpha must be in (0.0, 1.0], got {}",
                self.alpha
            )));
        }
        if self.i_min_ms == 0 {
            return Err(StoreError::Corrupt("i_min_ms must be > 0".into()));
        }
        if self.i_min_ms > self.i_base_ms || self.i_base_ms > self.i_max_ms {
            return Err(StoreError::Corrupt(format!(
                "interval ordering violated: {} <= {} <= {} required",
                self.i_min_ms, self.i_base_ms, self.i_max_ms
            )));
        }
        if self.q_max == 0 {
            return Err(StoreError::Corrupt("q_max must be > 0".into()));
        }
        if self.batch_budget == 0 {
            return Err(StoreError::Corrupt("batch_budget must be > 0".into()));
        }
        Ok(())
    }
}

/// Barrier state published after every snapshot swap. `flush_pending`
/// callers block here until their write sequence has been applied.
pub struct ReconcileBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

#[derive(Debug, Clone, Copy, Default)]
struct BarrierState {
    applied_seq: u64,
    snapshot_seq: u64,
}

impl ReconcileBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn publish(&self, applied_seq: u64, snapshot_seq: u64) {
        let mut state = self.state.lock();
        state.applied_seq = state.applied_seq.max(applied_seq);
        state.snapshot_seq = snapshot_seq;
        self.cvar.notify_all();
    }

    /// Block until `target_seq` has been applied; returns the sequence of
    /// the snapshot that covers it.
    pub fn wait_for(&self, target_seq: u64, deadline: Option<Instant>) -> Result<u64> {
        let mut state = self.state.lock();
        while state.applied_seq < target_seq {
            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut state, deadline).timed_out() {
                        return Err(StoreError::Timeout);
                    }
                }
                None => self.cvar.wait(&mut state),
            }
        }
        Ok(state.snapshot_seq)
    }

    pub fn applied_seq(&self) -> u64 {
        self.state.lock().applied_seq
    }
}

impl Default for ReconcileBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// EMA-based load tracker driving interval and health decisions
struct TrendState {
    queue_ema: f64,
    /// Whether the previous cycle ran past its interval
    last_cycle_overran: bool,
}

impl TrendState {
    fn new() -> Self {
        Self {
            queue_ema: 0.0,
            last_cycle_overran: false,
        }
    }

    fn update(&mut self, alpha: f64, queue_depth: usize) {
        if self.queue_ema == 0.0 {
            self.queue_ema = queue_depth as f64;
        } else {
            self.queue_ema = alpha * queue_depth as f64 + (1.0 - alpha) * self.queue_ema;
        }
    }

    fn utilization(&self, q_max: usize) -> f64 {
        self.queue_ema / q_max as f64
    }

    /// Piecewise interval control:
    /// - u < 0.20: idle, back off to i_max
    /// - 0.20 <= u <= 0.70: nominal, i_base
    /// - u > 0.70: hot, slide from i_base down to i_min
    fn optimal_interval(&self, config: &ReconcilerConfig) -> Duration {
        let u = self.utilization(config.q_max);

        let interval_ms = if u < 0.20 {
            config.i_max_ms as f64
        } else if u <= 0.70 {
            config.i_base_ms as f64
        } else {
            let pressure = ((u - 0.70) / 0.30).min(1.0);
            config.i_min_ms as f64
                + (1.0 - pressure) * (config.i_base_ms - config.i_min_ms) as f64
        };

        Duration::from_micros((interval_ms * 1000.0) as u64)
            .max(Duration::from_millis(config.i_min_ms))
    }

    /// Health in [0, 1]. Degrades with utilization above 0.9 and when the
    /// most recent cycle ran longer than its interval.
    fn health_score(&self, q_max: usize) -> f64 {
        let u = self.utilization(q_max);

        let base = if u < 0.30 {
            1.0
        } else if u < 0.70 {
            1.0 - (u - 0.30) * 1.25
        } else if u < 0.90 {
            0.5 - (u - 0.70) * 1.5
        } else {
            0.2 - (u - 0.90) * 2.0
        }
        .max(0.0);

        if self.last_cycle_overran {
            base * 0.5
        } else {
            base
        }
    }
}

/// Shared state between the reconciler handle and its thread
struct ReconcilerShared {
    config: ReconcilerConfig,
    write_log: Arc<WriteLog>,
    read_view: Arc<ReadView>,
    ann: Arc<HnswContainer>,
    wal: Arc<Mutex<WriteAheadLog>>,
    signal: Arc<ReconcileSignal>,
    barrier: Arc<ReconcileBarrier>,

    running: AtomicBool,
    degraded: Arc<AtomicBool>,

    reconciliations: AtomicU64,
    entries_processed: AtomicU64,
    current_interval_us: AtomicU64,
    health_bits: AtomicU64,
    trend: Mutex<TrendState>,
}

/// Adaptive reconciler handle
pub struct Reconciler {
    shared: Arc<ReconcilerShared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReconcilerConfig,
        write_log: Arc<WriteLog>,
        read_view: Arc<ReadView>,
        ann: Arc<HnswContainer>,
        wal: Arc<Mutex<WriteAheadLog>>,
        signal: Arc<ReconcileSignal>,
        barrier: Arc<ReconcileBarrier>,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        let current_interval_us = AtomicU64::new(config.i_base_ms * 1000);
        Self {
            shared: Arc::new(ReconcilerShared {
                config,
                write_log,
                read_view,
                ann,
                wal,
                signal,
                barrier,
                running: AtomicBool::new(false),
                degraded,
                reconciliations: AtomicU64::new(0),
                entries_processed: AtomicU64::new(0),
                current_interval_us,
                health_bits: AtomicU64::new(1.0f64.to_bits()),
                trend: Mutex::new(TrendState::new()),
            }),
            thread_handle: None,
        }
    }

    /// Start the reconciliation thread
    pub fn start(&mut self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("sutra-reconciler".into())
            .spawn(move || reconcile_loop(shared))
            .expect("failed to spawn reconciler thread");

        self.thread_handle = Some(handle);
        log::info!(
            "Adaptive reconciler started (base interval: {}ms)",
            self.shared.config.i_base_ms
        );
    }

    /// Stop the reconciliation thread, draining remaining work first
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.signal.notify();

        if let Some(handle) = self.thread_handle.take() {
            handle.join().ok();
        }

        log::info!("Adaptive reconciler stopped");
    }

    pub fn health_score(&self) -> f64 {
        if self.shared.degraded.load(Ordering::Relaxed) {
            return 0.0;
        }
        f64::from_bits(self.shared.health_bits.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> ReconcilerStats {
        let shared = &self.shared;
        let queue_depth = shared.write_log.pending();
        let q_max = shared.config.q_max;
        let degraded = shared.degraded.load(Ordering::Relaxed);

        let (utilization, ema) = {
            let trend = shared.trend.lock();
            (trend.utilization(q_max), trend.queue_ema)
        };
        let health_score = self.health_score();

        let recommendation = if degraded {
            "Critical: persistent I/O failure, store is degraded".to_string()
        } else if health_score > 0.8 {
            "Excellent: system running optimally".to_string()
        } else if health_score > 0.5 {
            "Good: normal operation, monitoring".to_string()
        } else if health_score > 0.2 {
            format!("Warning: high queue depth ({}/{})", queue_depth, q_max)
        } else {
            format!("Critical: queue near capacity ({}/{})", queue_depth, q_max)
        };

        ReconcilerStats {
            reconciliations: shared.reconciliations.load(Ordering::Relaxed),
            entries_processed: shared.entries_processed.load(Ordering::Relaxed),
            running: shared.running.load(Ordering::Relaxed),
            queue_depth,
            queue_capacity: q_max,
            queue_utilization: utilization,
            queue_ema: ema,
            current_interval_ms: shared.current_interval_us.load(Ordering::Relaxed) / 1000,
            health_score,
            degraded,
            recommendation,
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reconciler statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconcilerStats {
    pub reconciliations: u64,
    pub entries_processed: u64,
    pub running: bool,

    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_utilization: f64,
    pub queue_ema: f64,

    pub current_interval_ms: u64,
    pub health_score: f64,
    pub degraded: bool,
    pub recommendation: String,
}

/// Main reconciliation loop
fn reconcile_loop(shared: Arc<ReconcilerShared>) {
    loop {
        let running = shared.running.load(Ordering::Relaxed);

        // Observe load and pick this cycle's interval
        let queue_depth = shared.write_log.pending();
        let interval = {
            let mut trend = shared.trend.lock();
            trend.update(shared.config.alpha, queue_depth);
            trend.optimal_interval(&shared.config)
        };
        shared
            .current_interval_us
            .store(interval.as_micros() as u64, Ordering::Relaxed);

        if running {
            shared.signal.wait(interval);
        }

        let cycle_start = Instant::now();
        let batch = shared.write_log.drain_batch(shared.config.batch_budget);

        if !batch.is_empty() {
            apply_batch(&shared, &batch);
        }

        // Shutdown: keep draining until empty, then exit
        if !running {
            if shared.write_log.pending() == 0 {
                break;
            }
            continue;
        }

        let cycle_duration = cycle_start.elapsed();
        let health = {
            let mut trend = shared.trend.lock();
            trend.last_cycle_overran = !batch.is_empty() && cycle_duration > interval;
            trend.health_score(shared.config.q_max)
        };
        shared.health_bits.store(health.to_bits(), Ordering::Relaxed);
    }
}

fn apply_batch(shared: &Arc<ReconcilerShared>, batch: &[Pending]) {
    let current = shared.read_view.load();
    let mut next = current.successor();

    let mut ann_upserts: Vec<(crate::types::ConceptId, Arc<[f32]>)> = Vec::new();
    let mut ann_removes: Vec<crate::types::ConceptId> = Vec::new();
    let mut max_seq = 0u64;

    for pending in batch {
        max_seq = max_seq.max(pending.sequence);
        apply_entry(&mut next, &pending.entry, &mut ann_upserts, &mut ann_removes);
    }

    next.update_stats();
    let snapshot_seq = next.sequence;

    // Swap first: readers see the new state even if index maintenance lags
    shared.read_view.store(next);

    for id in &ann_removes {
        if let Err(e) = shared.ann.remove(id) {
            log::error!("ANN remove failed for {}: {}", id, e);
        }
    }
    for (id, vector) in &ann_upserts {
        if let Err(e) = shared.ann.insert(*id, vector.as_ref()) {
            log::error!("ANN insert failed for {}: {}", id, e);
        }
    }

    append_checkpoint(shared, max_seq, snapshot_seq);

    shared.reconciliations.fetch_add(1, Ordering::Relaxed);
    shared
        .entries_processed
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    shared.barrier.publish(max_seq, snapshot_seq);
}

/// Append the checkpoint record, retrying transient I/O with backoff.
/// Persistent failure marks the store degraded: health collapses and
/// subsequent mutations fail fast.
fn append_checkpoint(shared: &Arc<ReconcilerShared>, sequence: u64, snapshot_seq: u64) {
    let mut delay = Duration::from_millis(100);

    for attempt in 0..3 {
        let result = shared
            .wal
            .lock()
            .append(sequence, Operation::Checkpoint { snapshot_seq });

        match result {
            Ok(()) => return,
            Err(e) if attempt < 2 => {
                log::warn!(
                    "WAL checkpoint failed (attempt {}): {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => {
                log::error!("WAL checkpoint failed persistently: {}, marking store degraded", e);
                shared.degraded.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Apply a single write entry to the snapshot under construction
fn apply_entry(
    snapshot: &mut GraphSnapshot,
    entry: &WriteEntry,
    ann_upserts: &mut Vec<(crate::types::ConceptId, Arc<[f32]>)>,
    ann_removes: &mut Vec<crate::types::ConceptId>,
) {
    match entry {
        WriteEntry::AddConcept {
            id,
            content,
            vector,
            strength,
            confidence,
            created,
        } => {
            if let Some(mut existing) = snapshot.concepts.get(id).cloned() {
                // Idempotent re-learn: content wins on first write, metadata merges
                existing.merge_metadata(*strength, *confidence, 0);
                if let Some(vec) = vector {
                    let shared: Arc<[f32]> = Arc::from(vec.to_vec());
                    existing.vector = Some(Arc::clone(&shared));
                    ann_upserts.push((*id, shared));
                }
                snapshot.concepts.insert(*id, existing);
            } else {
                let node = ConceptNode::new(
                    *id,
                    content.to_vec(),
                    vector.as_ref().map(|v| v.to_vec()),
                    *strength,
                    *confidence,
                    *created,
                );
                if let Some(vec) = &node.vector {
                    ann_upserts.push((*id, Arc::clone(vec)));
                }
                snapshot.concepts.insert(*id, node);
            }
        }

        WriteEntry::AddAssociation { record } => {
            // The source must be local; the target may live on another shard
            if let Some(mut source_node) = snapshot.concepts.get(&record.source_id).cloned() {
                source_node.add_edge(record.edge());
                snapshot.concepts.insert(record.source_id, source_node);

                if let Some(mut target_node) = snapshot.concepts.get(&record.target_id).cloned() {
                    target_node.add_inbound(record.source_id);
                    snapshot.concepts.insert(record.target_id, target_node);
                }
            } else {
                log::warn!(
                    "Dropping association from unknown concept {}",
                    record.source_id
                );
            }
        }

        WriteEntry::SetVector { id, vector } => {
            if let Some(mut node) = snapshot.concepts.get(id).cloned() {
                let shared: Arc<[f32]> = Arc::from(vector.to_vec());
                node.vector = Some(Arc::clone(&shared));
                snapshot.concepts.insert(*id, node);
                ann_upserts.push((*id, shared));
            }
        }

        WriteEntry::UpdateStrength { id, strength } => {
            if let Some(mut node) = snapshot.concepts.get(id).cloned() {
                node.strength = *strength;
                snapshot.concepts.insert(*id, node);
            }
        }

        WriteEntry::RecordAccess { id, timestamp } => {
            if let Some(mut node) = snapshot.concepts.get(id).cloned() {
                node.last_accessed = *timestamp;
                node.access_count += 1;
                snapshot.concepts.insert(*id, node);
            }
        }

        WriteEntry::DeleteConcept { id } => {
            let Some(node) = snapshot.concepts.get(id).cloned() else {
                return;
            };

            // Strip edges into the deleted concept from their sources
            for source_id in &node.inbound {
                if let Some(mut source) = snapshot.concepts.get(source_id).cloned() {
                    source.remove_edges_to(id);
                    snapshot.concepts.insert(*source_id, source);
                }
            }
            // Drop back-references held by the deleted concept's targets
            for edge in &node.edges {
                if let Some(mut target) = snapshot.concepts.get(&edge.target).cloned() {
                    target.inbound.retain(|s| s != id);
                    snapshot.concepts.insert(edge.target, target);
                }
            }

            snapshot.concepts.remove(id);
            ann_removes.push(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw_container::HnswConfig;
    use crate::types::{AssociationRecord, AssociationType, ConceptId};
    use tempfile::TempDir;

    fn test_setup(dir: &TempDir, config: ReconcilerConfig) -> (Reconciler, Arc<WriteLog>, Arc<ReadView>, Arc<ReconcileBarrier>) {
        let signal = Arc::new(ReconcileSignal::new());
        let write_log = Arc::new(WriteLog::new(config.q_max, Arc::clone(&signal)));
        let read_view = Arc::new(ReadView::new());
        let ann = Arc::new(HnswContainer::new(
            dir.path().join("storage"),
            HnswConfig { dimension: 4, ..Default::default() },
        ));
        ann.load_or_build(&std::collections::HashMap::new()).unwrap();
        let wal = Arc::new(Mutex::new(
            WriteAheadLog::create(dir.path().join("wal.log"), false).unwrap(),
        ));
        let barrier = Arc::new(ReconcileBarrier::new());

        let reconciler = Reconciler::new(
            config,
            Arc::clone(&write_log),
            Arc::clone(&read_view),
            ann,
            wal,
            signal,
            Arc::clone(&barrier),
            Arc::new(AtomicBool::new(false)),
        );
        (reconciler, write_log, read_view, barrier)
    }

    #[test]
    fn test_interval_bands() {
        let config = ReconcilerConfig::default();
        let mut trend = TrendState::new();

        // Idle: back off to i_max
        trend.update(config.alpha, 100);
        assert_eq!(trend.optimal_interval(&config), Duration::from_millis(config.i_max_ms));

        // Nominal: i_base
        trend.queue_ema = 5_000.0;
        assert_eq!(trend.optimal_interval(&config), Duration::from_millis(config.i_base_ms));

        // Hot: slides toward i_min
        trend.queue_ema = 9_900.0;
        let hot = trend.optimal_interval(&config);
        assert!(hot < Duration::from_millis(config.i_base_ms));
        assert!(hot >= Duration::from_millis(config.i_min_ms));

        // Saturated: pinned at i_min
        trend.queue_ema = 20_000.0;
        assert_eq!(trend.optimal_interval(&config), Duration::from_millis(config.i_min_ms));
    }

    #[test]
    fn test_health_score_bands() {
        let mut trend = TrendState::new();

        trend.queue_ema = 1_000.0;
        assert!(trend.health_score(10_000) > 0.8);

        trend.queue_ema = 9_500.0;
        assert!(trend.health_score(10_000) < 0.2);

        // A cycle overrun halves the score
        trend.queue_ema = 1_000.0;
        trend.last_cycle_overran = true;
        assert!(trend.health_score(10_000) <= 0.5);
    }

    #[test]
    fn test_config_validation() {
        assert!(ReconcilerConfig::default().validate().is_ok());

        let bad = ReconcilerConfig { alpha: 1.5, ..Default::default() };
        assert!(bad.validate().is_err());

        let bad = ReconcilerConfig { i_min_ms: 100, i_base_ms: 50, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_reconcile_applies_writes() {
        let dir = TempDir::new().unwrap();
        let config = ReconcilerConfig { i_base_ms: 5, i_max_ms: 10, ..Default::default() };
        let (mut reconciler, write_log, read_view, barrier) = test_setup(&dir, config);
        reconciler.start();

        let id1 = ConceptId::from_u64(1);
        let id2 = ConceptId::from_u64(2);
        write_log.append_concept(1, id1, b"one".to_vec(), Some(vec![1.0, 0.0, 0.0, 0.0]), 1.0, 0.9, 100);
        write_log.append_concept(2, id2, b"two".to_vec(), None, 1.0, 0.9, 100);
        write_log.append_association(3, AssociationRecord::new(id1, id2, AssociationType::Causal, 0.8));

        barrier.wait_for(3, Some(Instant::now() + Duration::from_secs(5))).unwrap();

        let snap = read_view.load();
        assert_eq!(snap.concept_count(), 2);
        assert_eq!(snap.edge_count(), 1);

        let neighbors = snap.get_neighbors(&id1);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, id2);
        assert_eq!(neighbors[0].1, AssociationType::Causal);

        // Inbound reference maintained for backward traversal
        assert_eq!(snap.get_concept(&id2).unwrap().inbound.as_slice(), &[id1]);

        reconciler.stop();
    }

    #[test]
    fn test_delete_removes_adjacent_edges() {
        let dir = TempDir::new().unwrap();
        let config = ReconcilerConfig { i_base_ms: 5, i_max_ms: 10, ..Default::default() };
        let (mut reconciler, write_log, read_view, barrier) = test_setup(&dir, config);
        reconciler.start();

        let a = ConceptId::from_u64(1);
        let b = ConceptId::from_u64(2);
        let c = ConceptId::from_u64(3);
        write_log.append_concept(1, a, b"a".to_vec(), None, 1.0, 0.9, 100);
        write_log.append_concept(2, b, b"b".to_vec(), None, 1.0, 0.9, 100);
        write_log.append_concept(3, c, b"c".to_vec(), None, 1.0, 0.9, 100);
        write_log.append_association(4, AssociationRecord::new(a, b, AssociationType::Semantic, 0.8));
        write_log.append_association(5, AssociationRecord::new(b, c, AssociationType::Semantic, 0.8));

        barrier.wait_for(5, Some(Instant::now() + Duration::from_secs(5))).unwrap();

        write_log.append(6, WriteEntry::DeleteConcept { id: b });
        barrier.wait_for(6, Some(Instant::now() + Duration::from_secs(5))).unwrap();

        let snap = read_view.load();
        assert!(!snap.contains(&b));
        // The edge a->b went away with b
        assert!(snap.get_neighbors(&a).is_empty());
        // c no longer lists b as an inbound source
        assert!(snap.get_concept(&c).unwrap().inbound.is_empty());

        reconciler.stop();
    }

    #[test]
    fn test_idempotent_relearn_merges_metadata() {
        let dir = TempDir::new().unwrap();
        let config = ReconcilerConfig { i_base_ms: 5, i_max_ms: 10, ..Default::default() };
        let (mut reconciler, write_log, read_view, barrier) = test_setup(&dir, config);
        reconciler.start();

        let id = ConceptId::from_u64(1);
        write_log.append_concept(1, id, b"original".to_vec(), None, 0.5, 0.6, 100);
        write_log.append_concept(2, id, b"ignored".to_vec(), None, 0.9, 0.3, 200);

        barrier.wait_for(2, Some(Instant::now() + Duration::from_secs(5))).unwrap();

        let node = read_view.load().get_concept(&id).unwrap();
        assert_eq!(node.content.as_ref(), b"original");
        assert_eq!(node.strength, 0.9);
        assert_eq!(node.confidence, 0.6);

        reconciler.stop();
    }

    #[test]
    fn test_stop_drains_queue() {
        let dir = TempDir::new().unwrap();
        let config = ReconcilerConfig { i_base_ms: 5, i_max_ms: 10, ..Default::default() };
        let (mut reconciler, write_log, read_view, _barrier) = test_setup(&dir, config);
        reconciler.start();

        for i in 0..500u64 {
            write_log.append_concept(i + 1, ConceptId::from_u64(i), vec![i as u8], None, 1.0, 0.9, 100);
        }
        reconciler.stop();

        assert_eq!(read_view.load().concept_count(), 500);
    }
}
