/// Multi-path graph search with confidence propagation
///
/// Design:
/// - Three strategies: BFS (shortest in hops), best-first (confidence plus
///   proximity heuristic), bidirectional (half-depth frontiers)
/// - Rayon-based fan-out over first-hop neighbors
/// - Thread-safe traversal over immutable snapshot access
/// - Greedy diversification so returned paths do not retell the same route
///
/// Path confidence is the harmonic mean of edge weights with a mild depth
/// penalty: C(P) = hm(w) * beta^(hops-1). A single-hop path scores exactly
/// its edge weight; any zero-weight edge kills the path.
use crate::read_view::{ConceptNode, GraphSnapshot};
use crate::types::{AssociationType, ConceptId, GraphPath};
use rayon::prelude::*;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Search strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PathStrategy {
    /// Shortest in hops; returns the first k found
    Bfs,
    /// Priority queue keyed by confidence times proximity heuristic
    BestFirst,
    /// Simultaneous search from both ends, meeting in the middle
    Bidirectional,
}

/// Pathfinding parameters
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PathConfig {
    pub strategy: PathStrategy,
    pub max_depth: usize,
    pub max_paths: usize,
    /// Per-hop depth penalty
    pub beta: f32,
    /// Partial paths below this confidence are pruned
    pub conf_floor: f32,
    /// Max pairwise edge-Jaccard overlap among returned paths
    pub overlap_tau: f32,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            strategy: PathStrategy::Bfs,
            max_depth: 6,
            max_paths: 10,
            beta: 0.99,
            conf_floor: 0.1,
            overlap_tau: 0.7,
        }
    }
}

/// Read access to graph structure during traversal. Implemented by a single
/// shard's snapshot and by the cross-shard view, so a hop that crosses a
/// shard boundary is just one extra lookup.
pub trait GraphAccess: Sync {
    fn node(&self, id: &ConceptId) -> Option<ConceptNode>;

    fn contains(&self, id: &ConceptId) -> bool {
        self.node(id).is_some()
    }

    fn out_edges(&self, id: &ConceptId) -> Vec<crate::types::Edge> {
        self.node(id).map(|n| n.edges.to_vec()).unwrap_or_default()
    }

    fn inbound(&self, id: &ConceptId) -> Vec<ConceptId> {
        self.node(id).map(|n| n.inbound.to_vec()).unwrap_or_default()
    }

    fn edge_weight(&self, source: &ConceptId, target: &ConceptId) -> Option<f32> {
        self.node(source)
            .and_then(|n| n.edge_to(target).map(|e| e.weight))
    }
}

impl GraphAccess for GraphSnapshot {
    fn node(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.get_concept(id)
    }
}

impl GraphAccess for Arc<GraphSnapshot> {
    fn node(&self, id: &ConceptId) -> Option<ConceptNode> {
        self.get_concept(id)
    }
}

/// In-flight path during search
#[derive(Debug, Clone)]
struct PathState {
    nodes: Vec<ConceptId>,
    weights: Vec<f32>,
    types: Vec<AssociationType>,
}

impl PathState {
    fn seed(start: ConceptId) -> Self {
        Self {
            nodes: vec![start],
            weights: Vec::new(),
            types: Vec::new(),
        }
    }

    fn extend(&self, edge: &crate::types::Edge) -> Self {
        let mut next = self.clone();
        next.nodes.push(edge.target);
        next.weights.push(edge.weight);
        next.types.push(edge.assoc_type);
        next
    }

    fn head(&self) -> ConceptId {
        *self.nodes.last().expect("path never empty")
    }

    fn visits(&self, id: &ConceptId) -> bool {
        self.nodes.contains(id)
    }

    fn hops(&self) -> usize {
        self.weights.len()
    }

    fn confidence(&self, beta: f32) -> f32 {
        path_confidence(&self.weights, beta)
    }

    /// Visited key for best-first: the node plus the last three hops, so
    /// different approaches to the same node stay distinguishable.
    fn visited_key(&self) -> (ConceptId, [ConceptId; 3]) {
        let mut tail = [ConceptId([0; 16]); 3];
        let n = self.nodes.len();
        for (slot, idx) in (n.saturating_sub(4)..n.saturating_sub(1)).rev().enumerate() {
            if slot < 3 {
                tail[slot] = self.nodes[idx];
            }
        }
        (self.head(), tail)
    }

    fn into_graph_path(self, beta: f32) -> GraphPath {
        let confidence = self.confidence(beta);
        let edges = self
            .nodes
            .windows(2)
            .zip(self.types.iter())
            .map(|(pair, ty)| (pair[0], pair[1], *ty))
            .collect();
        GraphPath {
            concepts: self.nodes,
            edges,
            confidence,
        }
    }
}

/// Harmonic mean of edge weights with depth penalty
pub fn path_confidence(weights: &[f32], beta: f32) -> f32 {
    let hops = weights.len();
    if hops == 0 {
        return 1.0;
    }
    if weights.iter().any(|w| *w <= 0.0) {
        return 0.0;
    }
    let inv_sum: f32 = weights.iter().map(|w| 1.0 / w).sum();
    let harmonic = hops as f32 / inv_sum;
    harmonic * beta.powi(hops as i32 - 1)
}

/// Max-heap entry ordered by search score
struct Scored {
    score: f32,
    state: PathState,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for Scored {}
impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scored {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.score.total_cmp(&other.score)
    }
}

/// Multi-path search coordinator
pub struct PathFinder {
    config: PathConfig,
}

impl PathFinder {
    pub fn new(config: PathConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PathConfig {
        &self.config
    }

    /// Find up to `max_paths` paths from `start` to any member of `targets`,
    /// sorted by confidence descending and diversified by edge overlap.
    /// Missing endpoints are the caller's concern; an unreachable target
    /// yields an empty result.
    pub fn find_paths<G: GraphAccess>(
        &self,
        graph: &G,
        start: ConceptId,
        targets: &[ConceptId],
    ) -> Vec<GraphPath> {
        if targets.is_empty() {
            return Vec::new();
        }

        let target_set: HashSet<ConceptId> = targets.iter().copied().collect();

        // Trivial self-path
        if target_set.contains(&start) {
            return vec![GraphPath {
                concepts: vec![start],
                edges: Vec::new(),
                confidence: 1.0,
            }];
        }

        let candidates = match self.config.strategy {
            PathStrategy::Bfs => self.fan_out(graph, start, &target_set, Self::bfs_from),
            PathStrategy::BestFirst => self.fan_out(graph, start, &target_set, Self::best_first_from),
            PathStrategy::Bidirectional => {
                let mut all = Vec::new();
                for target in targets {
                    all.extend(self.bidirectional(graph, start, *target));
                }
                all
            }
        };

        self.select_diverse(candidates)
    }

    /// Launch one search per first-hop neighbor in parallel and merge.
    /// Each exploration is independent, so this parallelizes naturally.
    fn fan_out<G, F>(
        &self,
        graph: &G,
        start: ConceptId,
        targets: &HashSet<ConceptId>,
        search: F,
    ) -> Vec<PathState>
    where
        G: GraphAccess,
        F: Fn(&Self, &G, PathState, &HashSet<ConceptId>) -> Vec<PathState> + Sync,
    {
        let first_hops = graph.out_edges(&start);
        if first_hops.is_empty() {
            return Vec::new();
        }

        first_hops
            .par_iter()
            .filter(|edge| edge.weight > 0.0)
            .flat_map(|edge| {
                let seed = PathState::seed(start).extend(edge);
                if seed.confidence(self.config.beta) < self.config.conf_floor {
                    return Vec::new();
                }
                if targets.contains(&edge.target) {
                    return vec![seed];
                }
                search(self, graph, seed, targets)
            })
            .collect()
    }

    /// Breadth-first path enumeration: shortest in hops, first k found
    fn bfs_from<G: GraphAccess>(
        &self,
        graph: &G,
        seed: PathState,
        targets: &HashSet<ConceptId>,
    ) -> Vec<PathState> {
        let mut found = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(seed);

        while let Some(state) = queue.pop_front() {
            if state.hops() >= self.config.max_depth {
                continue;
            }

            for edge in graph.out_edges(&state.head()) {
                if edge.weight <= 0.0 || state.visits(&edge.target) {
                    continue;
                }
                let next = state.extend(&edge);
                if next.confidence(self.config.beta) < self.config.conf_floor {
                    continue;
                }
                if targets.contains(&edge.target) {
                    found.push(next);
                    if found.len() >= self.config.max_paths {
                        return found;
                    }
                } else {
                    queue.push_back(next);
                }
            }
        }

        found
    }

    /// Best-first search keyed by partial confidence times proximity
    fn best_first_from<G: GraphAccess>(
        &self,
        graph: &G,
        seed: PathState,
        targets: &HashSet<ConceptId>,
    ) -> Vec<PathState> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut heap = BinaryHeap::new();

        let score = seed.confidence(self.config.beta) * (1.0 + self.proximity(graph, &seed.head(), targets));
        heap.push(Scored { score, state: seed });

        while let Some(Scored { state, .. }) = heap.pop() {
            if !visited.insert(state.visited_key()) {
                continue;
            }
            if state.hops() >= self.config.max_depth {
                continue;
            }

            for edge in graph.out_edges(&state.head()) {
                if edge.weight <= 0.0 || state.visits(&edge.target) {
                    continue;
                }
                let next = state.extend(&edge);
                let confidence = next.confidence(self.config.beta);
                if confidence < self.config.conf_floor {
                    continue;
                }
                if targets.contains(&edge.target) {
                    found.push(next);
                    if found.len() >= self.config.max_paths {
                        return found;
                    }
                } else {
                    let score = confidence * (1.0 + self.proximity(graph, &edge.target, targets));
                    heap.push(Scored { score, state: next });
                }
            }
        }

        found
    }

    /// Proximity heuristic: 1 at a target, 0.5 one hop away, partial credit
    /// for shared neighborhood, otherwise 0.
    fn proximity<G: GraphAccess>(
        &self,
        graph: &G,
        v: &ConceptId,
        targets: &HashSet<ConceptId>,
    ) -> f32 {
        if targets.contains(v) {
            return 1.0;
        }

        let neighbors: HashSet<ConceptId> =
            graph.out_edges(v).iter().map(|e| e.target).collect();
        if targets.iter().any(|t| neighbors.contains(t)) {
            return 0.5;
        }

        let mut best = 0.0f32;
        for t in targets {
            let common = graph
                .out_edges(t)
                .iter()
                .filter(|e| neighbors.contains(&e.target))
                .count();
            if common > 0 {
                best = best.max(0.2 * (common as f32 / 3.0).min(1.0));
            }
        }
        best
    }

    /// Bidirectional BFS with half the depth budget on each side
    fn bidirectional<G: GraphAccess>(
        &self,
        graph: &G,
        start: ConceptId,
        target: ConceptId,
    ) -> Vec<PathState> {
        let half = self.config.max_depth.div_ceil(2);

        // Forward frontier: best-known path from start to each node
        let mut forward: HashMap<ConceptId, PathState> = HashMap::new();
        forward.insert(start, PathState::seed(start));
        let mut frontier = vec![start];
        for _ in 0..half {
            let mut next_frontier = Vec::new();
            for node in frontier.drain(..) {
                let state = forward.get(&node).cloned().expect("frontier node tracked");
                for edge in graph.out_edges(&node) {
                    if edge.weight <= 0.0 || forward.contains_key(&edge.target) {
                        continue;
                    }
                    let next = state.extend(&edge);
                    if next.confidence(self.config.beta) < self.config.conf_floor {
                        continue;
                    }
                    next_frontier.push(edge.target);
                    forward.insert(edge.target, next);
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        // Backward frontier: node chains reaching the target over in-edges
        let mut backward: HashMap<ConceptId, Vec<ConceptId>> = HashMap::new();
        backward.insert(target, vec![target]);
        let mut frontier = vec![target];
        for _ in 0..half {
            let mut next_frontier = Vec::new();
            for node in frontier.drain(..) {
                let chain = backward.get(&node).cloned().expect("frontier node tracked");
                for source in graph.inbound(&node) {
                    if backward.contains_key(&source) {
                        continue;
                    }
                    let mut next_chain = vec![source];
                    next_chain.extend_from_slice(&chain);
                    next_frontier.push(source);
                    backward.insert(source, next_chain);
                }
            }
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        // Join at frontier intersections
        let mut joined = Vec::new();
        for (meet, fwd_state) in &forward {
            let Some(chain) = backward.get(meet) else {
                continue;
            };
            let Some(state) = self.join_paths(graph, fwd_state, chain) else {
                continue;
            };
            if state.hops() <= self.config.max_depth
                && state.confidence(self.config.beta) >= self.config.conf_floor
            {
                joined.push(state);
            }
        }
        joined
    }

    /// Splice a forward path onto a backward chain, resolving the weight and
    /// type of every backward hop from its source node. Rejects rejoins that
    /// revisit a concept.
    fn join_paths<G: GraphAccess>(
        &self,
        graph: &G,
        forward: &PathState,
        backward_chain: &[ConceptId],
    ) -> Option<PathState> {
        let mut state = forward.clone();
        // backward_chain starts at the meet node, already at the path head
        for pair in backward_chain.windows(2) {
            if state.visits(&pair[1]) {
                return None;
            }
            let node = graph.node(&pair[0])?;
            let edge = node.edge_to(&pair[1])?;
            state = state.extend(edge);
        }
        Some(state)
    }

    /// Greedy diversification: pick paths in descending confidence, skipping
    /// any whose edge-Jaccard overlap with an already selected path exceeds
    /// the threshold.
    fn select_diverse(&self, mut candidates: Vec<PathState>) -> Vec<GraphPath> {
        candidates.sort_by(|a, b| {
            b.confidence(self.config.beta)
                .total_cmp(&a.confidence(self.config.beta))
        });
        candidates.dedup_by(|a, b| a.nodes == b.nodes);

        let mut selected: Vec<PathState> = Vec::new();
        for candidate in candidates {
            if selected.len() >= self.config.max_paths {
                break;
            }
            let overlaps = selected
                .iter()
                .any(|s| edge_jaccard(s, &candidate) > self.config.overlap_tau);
            if !overlaps {
                selected.push(candidate);
            }
        }

        selected
            .into_iter()
            .map(|s| s.into_graph_path(self.config.beta))
            .collect()
    }
}

fn edge_set(state: &PathState) -> HashSet<(ConceptId, ConceptId)> {
    state
        .nodes
        .windows(2)
        .map(|pair| (pair[0], pair[1]))
        .collect()
}

fn edge_jaccard(a: &PathState, b: &PathState) -> f32 {
    let ea = edge_set(a);
    let eb = edge_set(b);
    if ea.is_empty() && eb.is_empty() {
        return 1.0;
    }
    let intersection = ea.intersection(&eb).count() as f32;
    let union = ea.union(&eb).count() as f32;
    intersection / union
}
