/// HNSW container - build-once, persist, incremental updates
///
/// Backed by a USearch index with mmap-based persistence: reopening a store
/// loads the proximity graph in place instead of rebuilding it. A bincode
/// sidecar (`storage.hnsw.meta`) maps internal integer ids to concept ids
/// and pins the vector dimension.
///
/// Concurrency: one writer OR many readers (RwLock). Insertions happen only
/// from the reconciler task.
use crate::error::{Result, StoreError};
use crate::types::ConceptId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};
use usearch::Index;

#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Vector dimension
    pub dimension: usize,
    /// Max neighbors per node (M)
    pub max_neighbors: usize,
    /// Insertion search width (ef_construction)
    pub ef_construction: usize,
    /// Query search width (ef_search)
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            max_neighbors: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// Everything behind the single writer/many readers lock
struct IndexState {
    index: Option<Index>,
    /// Internal HNSW id -> concept id
    id_mapping: HashMap<usize, ConceptId>,
    /// Concept id -> internal HNSW id
    reverse_mapping: HashMap<ConceptId, usize>,
    next_id: usize,
    dirty: bool,
}

/// HNSW container with persistence support
pub struct HnswContainer {
    /// Base path; index lands at `<base>.usearch`, id map at `<base>.hnsw.meta`
    base_path: PathBuf,
    state: RwLock<IndexState>,
    config: HnswConfig,
}

/// Sidecar metadata for persistence
#[derive(serde::Serialize, serde::Deserialize)]
struct HnswMetadata {
    id_mapping: HashMap<usize, ConceptId>,
    next_id: usize,
    dimension: u32,
    version: u32,
}

impl HnswContainer {
    pub fn new<P: AsRef<Path>>(base_path: P, config: HnswConfig) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            state: RwLock::new(IndexState {
                index: None,
                id_mapping: HashMap::new(),
                reverse_mapping: HashMap::new(),
                next_id: 0,
                dirty: false,
            }),
            config,
        }
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.with_extension("usearch")
    }

    fn meta_path(&self) -> PathBuf {
        self.base_path.with_extension("hnsw.meta")
    }

    fn make_index(&self) -> Result<Index> {
        Index::new(&IndexOptions {
            dimensions: self.config.dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: self.config.max_neighbors,
            expansion_add: self.config.ef_construction,
            expansion_search: self.config.ef_search,
            multi: false,
        })
        .map_err(|e| StoreError::Corrupt(format!("ANN index create: {}", e)))
    }

    /// Load the persisted index from disk, or build a fresh one from the
    /// given vectors. A missing or unreadable sidecar falls back to a full
    /// rebuild; a dimension mismatch refuses to open.
    pub fn load_or_build(&self, vectors: &HashMap<ConceptId, Vec<f32>>) -> Result<()> {
        let index_path = self.index_path();
        let meta_path = self.meta_path();
        let start = Instant::now();

        if index_path.exists() && meta_path.exists() {
            match self.try_load(&index_path, &meta_path, vectors) {
                Ok(()) => {
                    log::info!(
                        "Loaded HNSW index in {:.2}ms",
                        start.elapsed().as_secs_f64() * 1000.0
                    );
                    return Ok(());
                }
                Err(StoreError::DimensionMismatch { expected, actual }) => {
                    // Wrong dimension is a config error, not a rebuild case
                    return Err(StoreError::DimensionMismatch { expected, actual });
                }
                Err(e) => {
                    log::warn!("HNSW load failed ({}), rebuilding from snapshot", e);
                }
            }
        }

        self.build_from_vectors(vectors)?;
        log::info!(
            "Built HNSW index with {} vectors in {:.2}s",
            vectors.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn try_load(
        &self,
        index_path: &Path,
        meta_path: &Path,
        vectors: &HashMap<ConceptId, Vec<f32>>,
    ) -> Result<()> {
        let data = std::fs::read(meta_path)?;
        let metadata: HnswMetadata = bincode::deserialize(&data)
            .map_err(|e| StoreError::Corrupt(format!("ANN sidecar: {}", e)))?;

        if metadata.dimension as usize != self.config.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.dimension,
                actual: metadata.dimension as usize,
            });
        }

        let index = self.make_index()?;
        index
            .load(index_path.to_str().unwrap_or_default())
            .map_err(|e| StoreError::Corrupt(format!("ANN index load: {}", e)))?;

        let mut state = self.state.write();
        state.reverse_mapping = metadata
            .id_mapping
            .iter()
            .map(|(hnsw_id, concept_id)| (*concept_id, *hnsw_id))
            .collect();
        state.id_mapping = metadata.id_mapping;
        state.next_id = metadata.next_id;
        state.dirty = false;

        // Catch up on vectors written after the last save
        let missing: Vec<(ConceptId, &Vec<f32>)> = vectors
            .iter()
            .filter(|(id, _)| !state.reverse_mapping.contains_key(id))
            .map(|(id, vec)| (*id, vec))
            .collect();

        if !missing.is_empty() {
            log::info!("Adding {} new vectors incrementally", missing.len());
            reserve_for(&index, missing.len())?;
            for (concept_id, vector) in missing {
                insert_locked(&mut state, &index, concept_id, vector)?;
            }
            state.dirty = true;
        }

        state.index = Some(index);
        Ok(())
    }

    fn build_from_vectors(&self, vectors: &HashMap<ConceptId, Vec<f32>>) -> Result<()> {
        let index = self.make_index()?;

        let mut state = self.state.write();
        state.id_mapping.clear();
        state.reverse_mapping.clear();
        state.next_id = 0;

        if !vectors.is_empty() {
            reserve_for(&index, vectors.len())?;
            for (concept_id, vector) in vectors {
                insert_locked(&mut state, &index, *concept_id, vector)?;
            }
            state.dirty = true;
        }

        state.index = Some(index);
        Ok(())
    }

    /// Insert or update a single vector. Updates remove the old entry first.
    pub fn insert(&self, concept_id: ConceptId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }

        let mut state = self.state.write();
        // Take the index out so the maps can be mutated alongside it
        let index = state
            .index
            .take()
            .ok_or_else(|| StoreError::Corrupt("ANN index not initialized".into()))?;

        let result = (|| {
            if let Some(&old_id) = state.reverse_mapping.get(&concept_id) {
                index
                    .remove(old_id as u64)
                    .map_err(|e| StoreError::Corrupt(format!("ANN remove: {}", e)))?;
                state.id_mapping.remove(&old_id);
                state.reverse_mapping.remove(&concept_id);
            }
            reserve_for(&index, 1)?;
            insert_locked(&mut state, &index, concept_id, vector)
        })();

        state.index = Some(index);
        result?;
        state.dirty = true;
        Ok(())
    }

    /// Drop a concept's vector from the index
    pub fn remove(&self, concept_id: &ConceptId) -> Result<()> {
        let mut state = self.state.write();
        let Some(&hnsw_id) = state.reverse_mapping.get(concept_id) else {
            return Ok(());
        };
        if let Some(index) = state.index.as_ref() {
            index
                .remove(hnsw_id as u64)
                .map_err(|e| StoreError::Corrupt(format!("ANN remove: {}", e)))?;
        }
        state.id_mapping.remove(&hnsw_id);
        state.reverse_mapping.remove(concept_id);
        state.dirty = true;
        Ok(())
    }

    /// Search k nearest neighbors, returning `(concept_id, cosine distance)`
    /// ordered by increasing distance. `ef` widens the candidate fetch for
    /// this call: USearch expands its beam to at least the requested count,
    /// so over-fetching and truncating raises the effective search width.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Vec<(ConceptId, f32)> {
        let state = self.state.read();
        let index = match state.index.as_ref() {
            Some(idx) => idx,
            None => return Vec::new(),
        };

        let fetch = ef.map(|ef| ef.max(k)).unwrap_or(k);
        let matches = match index.search(query, fetch) {
            Ok(m) => m,
            Err(e) => {
                log::error!("ANN search failed: {}", e);
                return Vec::new();
            }
        };

        let mut results: Vec<(ConceptId, f32)> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(hnsw_id, distance)| {
                state
                    .id_mapping
                    .get(&(*hnsw_id as usize))
                    .map(|concept_id| (*concept_id, *distance))
            })
            .collect();

        results.sort_by(|a, b| a.1.total_cmp(&b.1));
        results.truncate(k);
        results
    }

    /// Save index + sidecar to disk. No-op when clean.
    pub fn save(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.dirty {
            log::debug!("HNSW index is clean, skipping save");
            return Ok(());
        }

        let index = state
            .index
            .as_ref()
            .ok_or_else(|| StoreError::Corrupt("ANN index not initialized".into()))?;

        if let Some(parent) = self.index_path().parent() {
            std::fs::create_dir_all(parent)?;
        }

        index
            .save(self.index_path().to_str().unwrap_or_default())
            .map_err(|e| StoreError::Corrupt(format!("ANN index save: {}", e)))?;

        let metadata = HnswMetadata {
            id_mapping: state.id_mapping.clone(),
            next_id: state.next_id,
            dimension: self.config.dimension as u32,
            version: 1,
        };
        let encoded = bincode::serialize(&metadata)
            .map_err(|e| StoreError::Corrupt(format!("ANN sidecar encode: {}", e)))?;
        std::fs::write(self.meta_path(), encoded)?;

        state.dirty = false;
        log::info!("Saved HNSW index with {} vectors", state.id_mapping.len());
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn stats(&self) -> HnswStats {
        let state = self.state.read();
        HnswStats {
            num_vectors: state.index.as_ref().map(|idx| idx.size()).unwrap_or(0),
            dimension: self.config.dimension,
            max_neighbors: self.config.max_neighbors,
            dirty: state.dirty,
            initialized: state.index.is_some(),
        }
    }
}

/// Grow capacity by doubling when an insert would exceed it
fn reserve_for(index: &Index, additional: usize) -> Result<()> {
    let needed = index.size() + additional;
    if needed > index.capacity() {
        let new_capacity = (index.capacity() * 2).max(needed).max(64);
        index
            .reserve(new_capacity)
            .map_err(|e| StoreError::Capacity(format!("ANN reserve: {}", e)))?;
    }
    Ok(())
}

fn insert_locked(
    state: &mut IndexState,
    index: &Index,
    concept_id: ConceptId,
    vector: &[f32],
) -> Result<()> {
    let hnsw_id = state.next_id;
    state.next_id += 1;

    index
        .add(hnsw_id as u64, vector)
        .map_err(|e| StoreError::Capacity(format!("ANN add: {}", e)))?;

    state.id_mapping.insert(hnsw_id, concept_id);
    state.reverse_mapping.insert(concept_id, hnsw_id);
    Ok(())
}

/// ANN index statistics
#[derive(Debug, Clone)]
pub struct HnswStats {
    pub num_vectors: usize,
    pub dimension: usize,
    pub max_neighbors: usize,
    pub dirty: bool,
    pub initialized: bool,
}
