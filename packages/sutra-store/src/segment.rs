/// Segment storage with memory-mapped reads
///
/// File Format (storage.dat):
/// ┌─────────────────┬───────────────────┬────────────────┬────────────────┐
/// │ Header          │ Concept records   │ Edge records   │ Vector records │
/// │ (64 bytes)      │ (36B + content)   │ (36B each)     │ (20B + data)   │
/// └─────────────────┴───────────────────┴────────────────┴────────────────┘
///
/// Records are streamed sequentially with no in-file index; all lookup
/// structure is rebuilt in RAM at load time.
use crate::error::{Result, StoreError};
use crate::read_view::GraphSnapshot;
use crate::types::{current_timestamp_us, ConceptId};
use memmap2::MmapOptions;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Magic bytes identifying segment files
pub const MAGIC_BYTES: [u8; 8] = *b"SUTRADAT";
/// Current format version
pub const VERSION: u32 = 2;
/// Oldest version this reader still accepts
const MIN_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;
/// Byte range covered by the header checksum
const CRC_RANGE: usize = 36;

const CONCEPT_HEAD_SIZE: usize = 36;
const EDGE_RECORD_SIZE: usize = 36;
const VECTOR_HEAD_SIZE: usize = 20;

/// Segment file header (64 bytes, little-endian)
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub version: u32,
    pub concept_count: u32,
    pub edge_count: u32,
    pub vector_count: u32,
    pub created_us: u64,
    pub feature_flags: u32,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC_BYTES);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.concept_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.edge_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.vector_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.created_us.to_le_bytes());
        buf[32..36].copy_from_slice(&self.feature_flags.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..CRC_RANGE]);
        buf[36..40].copy_from_slice(&crc.to_le_bytes());
        // bytes [40..64] reserved, zero
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::Corrupt("segment file too small".into()));
        }
        if buf[0..8] != MAGIC_BYTES {
            return Err(StoreError::Corrupt("invalid magic bytes".into()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if !(MIN_VERSION..=VERSION).contains(&version) {
            return Err(StoreError::Corrupt(format!("unsupported version: {}", version)));
        }
        let stored_crc = u32::from_le_bytes(buf[36..40].try_into().unwrap());
        let actual_crc = crc32fast::hash(&buf[0..CRC_RANGE]);
        if stored_crc != actual_crc {
            return Err(StoreError::Corrupt(format!(
                "header checksum mismatch: stored {:08x}, computed {:08x}",
                stored_crc, actual_crc
            )));
        }
        Ok(Self {
            version,
            concept_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            edge_count: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            vector_count: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            created_us: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            feature_flags: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }
}

/// One concept as parsed from a segment
#[derive(Debug, Clone)]
pub struct LoadedConcept {
    pub id: ConceptId,
    pub content: Vec<u8>,
    pub strength: f32,
    pub confidence: f32,
    pub access_count: u32,
    pub created: u64,
}

/// One edge as parsed from a segment. The association type is not encoded
/// in the file; pure-segment loads default it to semantic and entries still
/// covered by the WAL restore the real type during replay.
#[derive(Debug, Clone, Copy)]
pub struct LoadedEdge {
    pub source: ConceptId,
    pub target: ConceptId,
    pub weight: f32,
}

/// Parsed segment contents
#[derive(Debug, Default)]
pub struct LoadedSegment {
    pub concepts: Vec<LoadedConcept>,
    pub edges: Vec<LoadedEdge>,
    pub vectors: Vec<(ConceptId, Vec<f32>)>,
}

/// Write a segment from the given snapshot, atomically replacing any
/// previous file at `path`.
pub fn write_segment(path: &Path, snapshot: &GraphSnapshot) -> Result<()> {
    let tmp_path = path.with_extension("dat.tmp");

    let mut edge_count = 0u32;
    let mut vector_count = 0u32;
    for node in snapshot.concepts.values() {
        edge_count += node.edges.len() as u32;
        if node.vector.is_some() {
            vector_count += 1;
        }
    }

    let header = SegmentHeader {
        version: VERSION,
        concept_count: snapshot.concepts.len() as u32,
        edge_count,
        vector_count,
        created_us: current_timestamp_us(),
        feature_flags: 0,
    };

    {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&header.encode())?;

        // Concept records
        for node in snapshot.concepts.values() {
            writer.write_all(&node.id.0)?;
            writer.write_all(&(node.content.len() as u32).to_le_bytes())?;
            writer.write_all(&node.strength.to_le_bytes())?;
            writer.write_all(&node.confidence.to_le_bytes())?;
            writer.write_all(&node.access_count.to_le_bytes())?;
            writer.write_all(&(node.created as u32).to_le_bytes())?;
            writer.write_all(&node.content)?;
        }

        // Edge records (fixed 36 bytes)
        for node in snapshot.concepts.values() {
            for edge in &node.edges {
                writer.write_all(&node.id.0)?;
                writer.write_all(&edge.target.0)?;
                writer.write_all(&edge.weight.to_le_bytes())?;
            }
        }

        // Vector records
        for node in snapshot.concepts.values() {
            if let Some(vector) = &node.vector {
                writer.write_all(&node.id.0)?;
                writer.write_all(&(vector.len() as u32).to_le_bytes())?;
                writer.write_all(bytemuck::cast_slice(vector.as_ref()))?;
            }
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load and validate a segment file. Any header or record failure returns
/// `Corrupt`; the caller may fall back to WAL-only recovery.
pub fn load_segment(path: &Path) -> Result<LoadedSegment> {
    let file = File::open(path)?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };

    let header = SegmentHeader::decode(&mmap)?;
    let mut offset = HEADER_SIZE;

    let mut loaded = LoadedSegment::default();
    loaded.concepts.reserve(header.concept_count as usize);

    for i in 0..header.concept_count {
        let head = take(&mmap, &mut offset, CONCEPT_HEAD_SIZE)
            .ok_or_else(|| StoreError::Corrupt(format!("truncated concept record {}", i)))?;

        let id = ConceptId(head[0..16].try_into().unwrap());
        let content_len = u32::from_le_bytes(head[16..20].try_into().unwrap()) as usize;
        let strength = f32::from_le_bytes(head[20..24].try_into().unwrap());
        let confidence = f32::from_le_bytes(head[24..28].try_into().unwrap());
        let access_count = u32::from_le_bytes(head[28..32].try_into().unwrap());
        let created = u32::from_le_bytes(head[32..36].try_into().unwrap()) as u64;

        let content = take(&mmap, &mut offset, content_len)
            .ok_or_else(|| StoreError::Corrupt(format!("truncated concept content {}", i)))?;

        loaded.concepts.push(LoadedConcept {
            id,
            content: content.to_vec(),
            strength,
            confidence,
            access_count,
            created,
        });
    }

    for i in 0..header.edge_count {
        let rec = take(&mmap, &mut offset, EDGE_RECORD_SIZE)
            .ok_or_else(|| StoreError::Corrupt(format!("truncated edge record {}", i)))?;

        loaded.edges.push(LoadedEdge {
            source: ConceptId(rec[0..16].try_into().unwrap()),
            target: ConceptId(rec[16..32].try_into().unwrap()),
            weight: f32::from_le_bytes(rec[32..36].try_into().unwrap()),
        });
    }

    for i in 0..header.vector_count {
        let head = take(&mmap, &mut offset, VECTOR_HEAD_SIZE)
            .ok_or_else(|| StoreError::Corrupt(format!("truncated vector record {}", i)))?;

        let id = ConceptId(head[0..16].try_into().unwrap());
        let dim = u32::from_le_bytes(head[16..20].try_into().unwrap()) as usize;

        let data = take(&mmap, &mut offset, dim * 4)
            .ok_or_else(|| StoreError::Corrupt(format!("truncated vector data {}", i)))?;

        // Components may be unaligned in the map, so decode per element
        let mut vector = Vec::with_capacity(dim);
        for chunk in data.chunks_exact(4) {
            vector.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        loaded.vectors.push((id, vector));
    }

    log::info!(
        "Loaded segment v{}: {} concepts, {} edges, {} vectors",
        header.version,
        loaded.concepts.len(),
        loaded.edges.len(),
        loaded.vectors.len()
    );

    Ok(loaded)
}

fn take<'a>(mmap: &'a [u8], offset: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = offset.checked_add(len)?;
    if end > mmap.len() {
        return None;
    }
    let slice = &mmap[*offset..end];
    *offset = end;
    Some(slice)
}
