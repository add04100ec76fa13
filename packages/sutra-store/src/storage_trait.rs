/// Storage trait for external producers
///
/// Both ConcurrentMemory and ShardedStore implement this trait, so the
/// collaborators that feed the store (embedding providers, association
/// extractors) can work with either backend.
use crate::concurrent_memory::{ConcurrentMemory, WriteAck};
use crate::error::Result;
use crate::sharded_store::ShardedStore;
use crate::types::{AssociationType, ConceptId};

/// Common ingest operations
pub trait KnowledgeStore {
    /// Store a concept with optional embedding
    fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
    ) -> Result<WriteAck>;

    /// Create an association between concepts
    fn create_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
    ) -> Result<WriteAck>;
}

impl KnowledgeStore for ConcurrentMemory {
    fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
    ) -> Result<WriteAck> {
        ConcurrentMemory::learn_concept(self, id, content, vector, strength, confidence)
    }

    fn create_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
    ) -> Result<WriteAck> {
        ConcurrentMemory::create_association(self, source, target, assoc_type, weight)
    }
}

impl KnowledgeStore for ShardedStore {
    fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
    ) -> Result<WriteAck> {
        ShardedStore::learn_concept(self, id, content, vector, strength, confidence)
    }

    fn create_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
    ) -> Result<WriteAck> {
        ShardedStore::create_association(self, source, target, assoc_type, weight)
    }
}

impl<T: KnowledgeStore> KnowledgeStore for std::sync::Arc<T> {
    fn learn_concept(
        &self,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
    ) -> Result<WriteAck> {
        (**self).learn_concept(id, content, vector, strength, confidence)
    }

    fn create_association(
        &self,
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
    ) -> Result<WriteAck> {
        (**self).create_association(source, target, assoc_type, weight)
    }
}
