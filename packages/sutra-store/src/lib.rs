/// Sutra Store - Concept Storage Engine
///
/// A persistent, embedded, single-process key-value + graph + vector store
/// for continuously-learning knowledge graphs. Not a database.
///
/// Key Features:
/// - Immutable read snapshots with an append-only write plane
/// - Memory-mapped binary segments plus a write-ahead log
/// - HNSW vector search with true disk persistence
/// - Hash-sharded scaling with 2PC for cross-shard edges
/// - Bounded-depth multi-path reasoning with consensus aggregation

mod consensus;
mod concurrent_memory;
mod error;
mod hnsw_container;
mod manifest;
mod pathfinder;
mod read_view;
mod reconciler;
mod segment;
mod sharded_store;
mod storage_trait;
mod transaction;
mod types;
mod wal;
mod write_log;

pub use consensus::{aggregate_paths, normalize_answer, AnswerPath, Consensus};
pub use concurrent_memory::{
    CapacityLimits, ConcurrentConfig, ConcurrentMemory, ConcurrentStats, SnapshotInfo, WriteAck,
};
pub use error::{Result, StoreError, TxnAbortReason};
pub use hnsw_container::{HnswConfig, HnswContainer, HnswStats};
pub use manifest::Manifest;
pub use pathfinder::{GraphAccess, PathConfig, PathFinder, PathStrategy};
pub use read_view::{ConceptNode, GraphSnapshot, ReadView};
pub use reconciler::{ReconcileBarrier, Reconciler, ReconcilerConfig, ReconcilerStats};
pub use segment::{LoadedConcept, LoadedEdge, LoadedSegment, SegmentHeader};
pub use sharded_store::{AggregatedStats, ShardedStore, StoreConfig};
pub use storage_trait::KnowledgeStore;
pub use transaction::{
    Participant, PreparedWrite, Transaction, TransactionCoordinator, TxnCoordinatorStats,
    TxnError, TxnOperation, TxnState,
};
pub use types::{AssociationRecord, AssociationType, ConceptId, Edge, GraphPath};
pub use wal::{LogEntry, Operation, WriteAheadLog};
pub use write_log::{Pending, ReconcileSignal, WriteEntry, WriteLog, WriteLogStats};

/// Version of the storage format
pub const STORAGE_VERSION: u32 = 2;

/// Magic bytes for segment files
pub const MAGIC_BYTES: &[u8; 8] = b"SUTRADAT";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(STORAGE_VERSION, 2);
        assert_eq!(MAGIC_BYTES, b"SUTRADAT");
    }
}
