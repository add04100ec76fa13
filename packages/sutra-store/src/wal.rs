/// Write-Ahead Log (WAL) for durability and crash recovery
///
/// The WAL logs every mutation before it reaches the in-memory write log.
/// On crash, committed entries are replayed to restore state.
///
/// Entry format: `u32 payload_len | u8 committed | payload`, where payload is
/// a MessagePack-encoded `LogEntry`. Appends are two-phase: the entry is
/// written with committed=0 and flushed, then the committed byte is
/// overwritten to 1 and flushed again. Entries whose committed byte is still
/// 0 at replay are discarded, which also gives 2PC participants presumed
/// abort: a PREPARE is appended uncommitted and only flipped on a commit
/// decision.
use crate::error::{Result, StoreError};
use crate::types::{current_timestamp_us, AssociationRecord, ConceptId};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the WAL file header
const WAL_MAGIC: [u8; 8] = *b"SUTRAWAL";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_SIZE: u64 = 16;

/// Offset of the committed byte within an entry, past the length prefix
const COMMIT_BYTE_OFFSET: u64 = 4;

/// WAL operation type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Operation {
    /// Write a concept. Content and vector are carried in full so the WAL
    /// alone can reconstruct state.
    WriteConcept {
        concept_id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        created: u64,
    },
    /// Write an association
    WriteAssociation { record: AssociationRecord },
    /// Set or replace a concept's vector
    WriteVector {
        concept_id: ConceptId,
        vector: Vec<f32>,
    },
    /// Delete a concept
    DeleteConcept { concept_id: ConceptId },
    /// 2PC participant prepare; appended uncommitted, flipped on commit
    TxnPrepare {
        txn_id: u64,
        record: AssociationRecord,
    },
    /// 2PC terminal records
    TxnCommit { txn_id: u64 },
    TxnAbort { txn_id: u64 },
    /// Reconciler checkpoint marker
    Checkpoint { snapshot_seq: u64 },
}

/// WAL entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number (monotonic, assigned by the owning store)
    pub sequence: u64,
    /// Timestamp (microseconds since epoch)
    pub timestamp_us: u64,
    /// Operation
    pub operation: Operation,
}

impl LogEntry {
    pub fn new(sequence: u64, operation: Operation) -> Self {
        Self {
            sequence,
            timestamp_us: current_timestamp_us(),
            operation,
        }
    }
}

/// Write-Ahead Log
pub struct WriteAheadLog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// End-of-log position, where the next entry lands
    write_pos: u64,
    /// Whether to fsync after each phase
    fsync: bool,
    /// Highest sequence observed in the file at open time
    last_sequence: u64,
}

impl WriteAheadLog {
    /// Create a fresh WAL, truncating anything at `path`
    pub fn create<P: AsRef<Path>>(path: P, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&file_header())?;
        writer.flush()?;
        if fsync {
            writer.get_ref().sync_all()?;
        }

        Ok(Self {
            path,
            writer,
            write_pos: WAL_HEADER_SIZE,
            fsync,
            last_sequence: 0,
        })
    }

    /// Open an existing WAL, trimming any torn tail left by a crash
    pub fn open<P: AsRef<Path>>(path: P, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let scan = scan_entries(&path)?;
        let last_sequence = scan
            .entries
            .iter()
            .map(|(entry, _)| entry.sequence)
            .max()
            .unwrap_or(0);

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        // Drop the torn tail so new entries append after the last whole one
        file.set_len(scan.valid_len)?;

        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(scan.valid_len))?;

        Ok(Self {
            path,
            writer,
            write_pos: scan.valid_len,
            fsync,
            last_sequence,
        })
    }

    /// Append an operation and durably mark it committed (two-phase)
    pub fn append(&mut self, sequence: u64, operation: Operation) -> Result<()> {
        let offset = self.append_uncommitted(sequence, operation)?;
        self.mark_committed(offset)
    }

    /// Append an operation with committed=0. Used directly by 2PC prepares;
    /// everything else goes through `append`.
    pub fn append_uncommitted(&mut self, sequence: u64, operation: Operation) -> Result<u64> {
        let entry = LogEntry::new(sequence, operation);
        let payload = rmp_serde::to_vec(&entry)?;

        let offset = self.write_pos;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&[0u8])?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        if self.fsync {
            self.writer.get_ref().sync_all()?;
        }

        self.write_pos += 4 + 1 + payload.len() as u64;
        self.last_sequence = self.last_sequence.max(sequence);
        Ok(offset)
    }

    /// Flip the committed byte of the entry at `offset`
    pub fn mark_committed(&mut self, offset: u64) -> Result<()> {
        self.writer.seek(SeekFrom::Start(offset + COMMIT_BYTE_OFFSET))?;
        self.writer.write_all(&[1u8])?;
        self.writer.seek(SeekFrom::Start(self.write_pos))?;
        self.writer.flush()?;
        if self.fsync {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Sync buffered writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay the log, returning committed entries in append order.
    /// Uncommitted entries and torn tails are discarded.
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>> {
        let scan = scan_entries(path)?;
        Ok(scan
            .entries
            .into_iter()
            .filter_map(|(entry, committed)| committed.then_some(entry))
            .collect())
    }

    /// Truncate the log and install a fresh header
    pub fn truncate(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&self.path)?;

        self.writer = BufWriter::new(file);
        self.writer.write_all(&file_header())?;
        self.writer.flush()?;
        if self.fsync {
            self.writer.get_ref().sync_all()?;
        }
        self.write_pos = WAL_HEADER_SIZE;
        Ok(())
    }

    /// Highest sequence present in the file when it was opened
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn file_header() -> [u8; WAL_HEADER_SIZE as usize] {
    let mut buf = [0u8; WAL_HEADER_SIZE as usize];
    buf[0..8].copy_from_slice(&WAL_MAGIC);
    buf[8..12].copy_from_slice(&WAL_VERSION.to_le_bytes());
    buf
}

struct ScanResult {
    entries: Vec<(LogEntry, bool)>,
    /// File length up to and including the last whole entry
    valid_len: u64,
}

/// Sequentially scan a WAL file. A short read at the tail ends the scan (a
/// torn entry from a crash); a complete entry that fails to decode is real
/// corruption and surfaces as `Corrupt`.
fn scan_entries<P: AsRef<Path>>(path: P) -> Result<ScanResult> {
    let mut file = File::open(path.as_ref())?;

    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    file.read_exact(&mut header)
        .map_err(|_| StoreError::Corrupt("WAL header truncated".into()))?;
    if header[0..8] != WAL_MAGIC {
        return Err(StoreError::Corrupt("invalid WAL magic".into()));
    }
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if version != WAL_VERSION {
        return Err(StoreError::Corrupt(format!("unsupported WAL version: {}", version)));
    }

    let mut entries = Vec::new();
    let mut valid_len = WAL_HEADER_SIZE;

    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut committed_buf = [0u8; 1];
        if file.read_exact(&mut committed_buf).is_err() {
            log::warn!("WAL: discarding torn tail entry (missing committed byte)");
            break;
        }

        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            log::warn!("WAL: discarding torn tail entry ({} bytes short)", len);
            break;
        }

        let entry: LogEntry = rmp_serde::from_slice(&payload)?;
        entries.push((entry, committed_buf[0] == 1));
        valid_len += 4 + 1 + len as u64;
    }

    Ok(ScanResult { entries, valid_len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssociationType;
    use tempfile::TempDir;

    fn concept_op(id: u64) -> Operation {
        Operation::WriteConcept {
            concept_id: ConceptId::from_u64(id),
            content: format!("concept {}", id).into_bytes(),
            vector: None,
            strength: 1.0,
            confidence: 0.9,
            created: 1000,
        }
    }

    #[test]
    fn test_create_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let wal = WriteAheadLog::create(&path, false).unwrap();
        assert_eq!(wal.last_sequence(), 0);
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), WAL_HEADER_SIZE);
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = WriteAheadLog::create(&path, false).unwrap();
        wal.append(1, concept_op(1)).unwrap();
        wal.append(2, concept_op(2)).unwrap();
        wal.append(
            3,
            Operation::WriteAssociation {
                record: AssociationRecord::new(
                    ConceptId::from_u64(1),
                    ConceptId::from_u64(2),
                    AssociationType::Causal,
                    0.8,
                ),
            },
        )
        .unwrap();
        drop(wal);

        let entries = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[2].sequence, 3);
        assert!(matches!(entries[2].operation, Operation::WriteAssociation { .. }));
    }

    #[test]
    fn test_uncommitted_discarded_on_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = WriteAheadLog::create(&path, false).unwrap();
        wal.append(1, concept_op(1)).unwrap();
        // Prepared but never decided: stays uncommitted
        let record = AssociationRecord::new(
            ConceptId::from_u64(1),
            ConceptId::from_u64(2),
            AssociationType::Semantic,
            0.5,
        );
        wal.append_uncommitted(2, Operation::TxnPrepare { txn_id: 9, record }).unwrap();
        wal.append(3, concept_op(3)).unwrap();
        drop(wal);

        let entries = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 3);
    }

    #[test]
    fn test_prepare_then_commit_survives_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = WriteAheadLog::create(&path, false).unwrap();
        let record = AssociationRecord::new(
            ConceptId::from_u64(1),
            ConceptId::from_u64(2),
            AssociationType::Semantic,
            0.5,
        );
        let offset = wal
            .append_uncommitted(1, Operation::TxnPrepare { txn_id: 9, record })
            .unwrap();
        wal.mark_committed(offset).unwrap();
        wal.append(2, Operation::TxnCommit { txn_id: 9 }).unwrap();
        drop(wal);

        let entries = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].operation, Operation::TxnPrepare { txn_id: 9, .. }));
    }

    #[test]
    fn test_torn_tail_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = WriteAheadLog::create(&path, false).unwrap();
        wal.append(1, concept_op(1)).unwrap();
        wal.append(2, concept_op(2)).unwrap();
        drop(wal);

        // Chop bytes off the tail to simulate a crash mid-append
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();

        let entries = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 1);

        // Reopening trims the tail and new appends land cleanly
        let mut wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.last_sequence(), 1);
        wal.append(3, concept_op(3)).unwrap();
        drop(wal);

        let entries = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 3);
    }

    #[test]
    fn test_truncate_installs_fresh_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = WriteAheadLog::create(&path, false).unwrap();
        for i in 0..10 {
            wal.append(i, concept_op(i)).unwrap();
        }
        wal.truncate().unwrap();
        drop(wal);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), WAL_HEADER_SIZE);
        assert!(WriteAheadLog::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn test_open_resumes_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = WriteAheadLog::create(&path, false).unwrap();
        wal.append(41, concept_op(41)).unwrap();
        wal.append(42, concept_op(42)).unwrap();
        drop(wal);

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.last_sequence(), 42);
    }

    #[test]
    fn test_concept_payload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = WriteAheadLog::create(&path, false).unwrap();
        wal.append(
            1,
            Operation::WriteConcept {
                concept_id: ConceptId::from_u64(7),
                content: b"alpha".to_vec(),
                vector: Some(vec![1.0, 0.0, 0.0, 0.0]),
                strength: 0.8,
                confidence: 0.6,
                created: 12345,
            },
        )
        .unwrap();
        drop(wal);

        let entries = WriteAheadLog::replay(&path).unwrap();
        match &entries[0].operation {
            Operation::WriteConcept { content, vector, strength, .. } => {
                assert_eq!(content, b"alpha");
                assert_eq!(vector.as_deref(), Some(&[1.0, 0.0, 0.0, 0.0][..]));
                assert_eq!(*strength, 0.8);
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }
}
