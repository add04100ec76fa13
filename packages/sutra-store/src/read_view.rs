/// Immutable read view for zero-contention graph traversal
///
/// Design:
/// - Immutable snapshot (readers never block)
/// - Atomic pointer swap (arc-swap for lock-free updates)
/// - Graph-optimized layout (edges co-located with concepts)
use crate::types::{current_timestamp_us, AssociationType, ConceptId, Edge};
use arc_swap::ArcSwap;
use smallvec::SmallVec;
use std::sync::Arc;

/// In-memory concept with co-located edges
#[derive(Debug, Clone)]
pub struct ConceptNode {
    pub id: ConceptId,
    pub content: Arc<[u8]>,
    pub vector: Option<Arc<[f32]>>,
    pub strength: f32,
    pub confidence: f32,
    /// Creation time, seconds since epoch
    pub created: u64,
    /// Last access, microseconds since epoch
    pub last_accessed: u64,
    pub access_count: u32,

    /// Out-edges, co-located for cache-friendly traversal.
    /// Deduplicated by target: readers see the highest-weight edge.
    pub edges: SmallVec<[Edge; 4]>,

    /// Sources of edges pointing at this concept, for backward traversal
    pub inbound: SmallVec<[ConceptId; 4]>,
}

impl ConceptNode {
    pub fn new(
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        created: u64,
    ) -> Self {
        Self {
            id,
            content: Arc::from(content),
            vector: vector.map(Arc::from),
            strength,
            confidence,
            created,
            last_accessed: current_timestamp_us(),
            access_count: 0,
            edges: SmallVec::new(),
            inbound: SmallVec::new(),
        }
    }

    /// Add an out-edge. Multiple edges to the same target collapse to the
    /// highest-weight one; at equal weight the newer edge wins, which lets
    /// WAL replay restore types onto segment-loaded edges.
    pub fn add_edge(&mut self, edge: Edge) {
        if let Some(existing) = self.edges.iter_mut().find(|e| e.target == edge.target) {
            if edge.weight >= existing.weight {
                *existing = edge;
            }
        } else {
            self.edges.push(edge);
        }
    }

    pub fn add_inbound(&mut self, source: ConceptId) {
        if !self.inbound.contains(&source) {
            self.inbound.push(source);
        }
    }

    pub fn remove_edges_to(&mut self, target: &ConceptId) {
        self.edges.retain(|e| e.target != *target);
    }

    /// Merge metadata from a re-learned concept with the same id: content is
    /// kept, strengths and confidences take the max, access counts sum.
    pub fn merge_metadata(&mut self, strength: f32, confidence: f32, access_count: u32) {
        self.strength = self.strength.max(strength);
        self.confidence = self.confidence.max(confidence);
        self.access_count = self.access_count.saturating_add(access_count);
    }

    /// Out-neighbors sorted by edge weight descending
    pub fn neighbors_by_weight(&self) -> Vec<(ConceptId, AssociationType, f32)> {
        let mut pairs: Vec<_> = self
            .edges
            .iter()
            .map(|e| (e.target, e.assoc_type, e.weight))
            .collect();
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));
        pairs
    }

    pub fn edge_to(&self, target: &ConceptId) -> Option<&Edge> {
        self.edges.iter().find(|e| e.target == *target)
    }
}

/// Immutable graph snapshot. `im::HashMap` gives structural sharing so a
/// successor snapshot shares unchanged subtrees with its predecessor.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// All concepts indexed by ID (immutable map)
    pub concepts: im::HashMap<ConceptId, ConceptNode>,

    /// Snapshot metadata
    pub sequence: u64,
    pub timestamp: u64,
    pub concept_count: usize,
    pub edge_count: usize,
}

impl GraphSnapshot {
    pub fn new(sequence: u64) -> Self {
        Self {
            concepts: im::HashMap::new(),
            sequence,
            timestamp: current_timestamp_us(),
            concept_count: 0,
            edge_count: 0,
        }
    }

    /// Successor snapshot sharing this one's structure
    pub fn successor(&self) -> Self {
        Self {
            concepts: self.concepts.clone(),
            sequence: self.sequence + 1,
            timestamp: current_timestamp_us(),
            concept_count: self.concept_count,
            edge_count: self.edge_count,
        }
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.concepts.get(id).cloned()
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.concepts.contains_key(id)
    }

    /// Out-neighbors with type and weight, strongest first
    pub fn get_neighbors(&self, id: &ConceptId) -> Vec<(ConceptId, AssociationType, f32)> {
        self.concepts
            .get(id)
            .map(|node| node.neighbors_by_weight())
            .unwrap_or_default()
    }

    pub fn get_vector(&self, id: &ConceptId) -> Option<Arc<[f32]>> {
        self.concepts.get(id).and_then(|node| node.vector.clone())
    }

    /// Update stats (call after modifications)
    pub fn update_stats(&mut self) {
        self.concept_count = self.concepts.len();
        self.edge_count = self.concepts.values().map(|node| node.edges.len()).sum();
    }

    pub fn concept_count(&self) -> usize {
        self.concept_count
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }
}

/// Read view with atomic snapshot swapping
pub struct ReadView {
    /// Current snapshot (atomically swappable)
    snapshot: ArcSwap<GraphSnapshot>,
}

impl ReadView {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(GraphSnapshot::new(0)),
        }
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Load current snapshot (lock-free)
    pub fn load(&self) -> Arc<GraphSnapshot> {
        self.snapshot.load_full()
    }

    /// Install a new snapshot (atomic swap)
    pub fn store(&self, new_snapshot: GraphSnapshot) {
        self.snapshot.store(Arc::new(new_snapshot));
    }

    pub fn snapshot_info(&self) -> (u64, u64, usize, usize) {
        let snap = self.load();
        (snap.sequence, snap.timestamp, snap.concept_count, snap.edge_count)
    }
}

impl Default for ReadView {
    fn default() -> Self {
        Self::new()
    }
}
