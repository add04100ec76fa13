/// Core types for the concept storage engine
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concept ID: 128-bit opaque identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct ConceptId(pub [u8; 16]);

impl ConceptId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Zero-extend a 64-bit id into the 16-byte identifier space.
    /// Callers that mint short ids must widen them at this boundary.
    pub fn from_u64(id: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&id.to_le_bytes());
        Self(bytes)
    }

    pub fn from_string(s: &str) -> Self {
        use std::convert::TryInto;

        // Handle odd-length hex strings by padding with leading zero
        let hex_str = if s.len() % 2 == 1 {
            format!("0{}", s)
        } else {
            s.to_string()
        };

        let bytes = hex::decode(&hex_str).unwrap_or_else(|e| {
            log::warn!("Failed to decode hex '{}', using MD5 hash instead: {}", s, e);
            // Fallback: derive a stable 16-byte id from the string
            let hash = md5::compute(s.as_bytes());
            hash.to_vec()
        });

        if bytes.len() <= 16 {
            // Zero-extend short ids
            let mut padded = [0u8; 16];
            padded[..bytes.len()].copy_from_slice(&bytes);
            Self(padded)
        } else {
            // Take first 16 bytes if too long
            Self(bytes[..16].try_into().expect("slice length checked"))
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Association type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AssociationType {
    Semantic = 0,
    Causal = 1,
    Temporal = 2,
    Hierarchical = 3,
    Compositional = 4,
}

impl AssociationType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Semantic),
            1 => Some(Self::Causal),
            2 => Some(Self::Temporal),
            3 => Some(Self::Hierarchical),
            4 => Some(Self::Compositional),
            _ => None,
        }
    }
}

/// Directed edge as stored inline with its source concept
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub target: ConceptId,
    pub assoc_type: AssociationType,
    pub weight: f32,
}

/// Full association record as carried by the WAL and 2PC transport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub source_id: ConceptId,
    pub target_id: ConceptId,
    pub assoc_type: AssociationType,
    pub weight: f32,
    pub created: u64,
}

impl AssociationRecord {
    pub fn new(
        source: ConceptId,
        target: ConceptId,
        assoc_type: AssociationType,
        weight: f32,
    ) -> Self {
        Self {
            source_id: source,
            target_id: target,
            assoc_type,
            weight,
            created: current_timestamp_us(),
        }
    }

    pub fn edge(&self) -> Edge {
        Edge {
            target: self.target_id,
            assoc_type: self.assoc_type,
            weight: self.weight,
        }
    }

    /// Companion record with reversed direction, same type and weight.
    /// Stored on the target's shard so neighbor queries stay local.
    pub fn companion(&self) -> Self {
        Self {
            source_id: self.target_id,
            target_id: self.source_id,
            assoc_type: self.assoc_type,
            weight: self.weight,
            created: self.created,
        }
    }
}

/// Path through the knowledge graph
#[derive(Debug, Clone)]
pub struct GraphPath {
    pub concepts: Vec<ConceptId>,
    pub edges: Vec<(ConceptId, ConceptId, AssociationType)>,
    pub confidence: f32,
}

/// Get current timestamp in microseconds
pub(crate) fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Get current timestamp in seconds
pub(crate) fn current_timestamp_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
