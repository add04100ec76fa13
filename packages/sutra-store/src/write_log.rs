/// Lock-free write log for continuous learning
///
/// Append-only structure optimized for burst writes.
/// Writers never block, readers never see partial writes.
///
/// Design:
/// - Crossbeam channel for lock-free producer-consumer
/// - Soft high-watermark: above it writers yield once and nudge the
///   reconciler to run immediately, and the ack carries a `hot` flag
/// - Batch drain for reconciliation
use crate::types::{AssociationRecord, ConceptId};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default soft high-watermark before cooperative back-pressure
pub const DEFAULT_WATERMARK: usize = 10_000;

/// Write log entry types
#[derive(Debug, Clone)]
pub enum WriteEntry {
    /// Add a new concept with content and optional vector
    AddConcept {
        id: ConceptId,
        content: Box<[u8]>,
        vector: Option<Box<[f32]>>,
        strength: f32,
        confidence: f32,
        created: u64,
    },

    /// Add an association between concepts
    AddAssociation { record: AssociationRecord },

    /// Set or replace a concept's vector
    SetVector { id: ConceptId, vector: Box<[f32]> },

    /// Update concept strength (from temporal decay)
    UpdateStrength { id: ConceptId, strength: f32 },

    /// Record access (for heat tracking)
    RecordAccess { id: ConceptId, timestamp: u64 },

    /// Delete a concept and all adjacent edges
    DeleteConcept { id: ConceptId },
}

/// A sequenced pending operation
#[derive(Debug, Clone)]
pub struct Pending {
    pub sequence: u64,
    pub entry: WriteEntry,
}

/// Wake-up channel between writers and the reconciler. Writers notify it
/// when the queue runs hot; the reconciler sleeps on it so a nudge cuts the
/// current interval short.
pub struct ReconcileSignal {
    nudged: Mutex<bool>,
    cvar: Condvar,
}

impl ReconcileSignal {
    pub fn new() -> Self {
        Self {
            nudged: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut nudged = self.nudged.lock();
        *nudged = true;
        self.cvar.notify_one();
    }

    /// Sleep for `interval` or until nudged, whichever comes first
    pub fn wait(&self, interval: Duration) {
        let mut nudged = self.nudged.lock();
        if !*nudged {
            self.cvar.wait_for(&mut nudged, interval);
        }
        *nudged = false;
    }
}

impl Default for ReconcileSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free write log
pub struct WriteLog {
    /// Write channel (producers)
    sender: Sender<Pending>,

    /// Read channel (reconciler)
    receiver: Receiver<Pending>,

    /// Soft high-watermark
    watermark: usize,

    /// Reconciler wake-up
    signal: Arc<ReconcileSignal>,

    /// Total written
    written: Arc<AtomicU64>,
}

impl WriteLog {
    pub fn new(watermark: usize, signal: Arc<ReconcileSignal>) -> Self {
        let (sender, receiver) = unbounded();

        Self {
            sender,
            receiver,
            watermark,
            signal,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append an entry. Wait-free; returns whether the queue is running hot.
    /// Above the watermark the caller pays a single yield and the reconciler
    /// is nudged to drain immediately.
    pub fn append(&self, sequence: u64, entry: WriteEntry) -> bool {
        // Unbounded channel: send only fails when the reconciler side is
        // gone, which cannot happen while the log is alive
        let _ = self.sender.send(Pending { sequence, entry });
        self.written.fetch_add(1, Ordering::Relaxed);

        let hot = self.receiver.len() > self.watermark;
        if hot {
            self.signal.notify();
            std::thread::yield_now();
        }
        hot
    }

    /// Append a concept (convenience)
    pub fn append_concept(
        &self,
        sequence: u64,
        id: ConceptId,
        content: Vec<u8>,
        vector: Option<Vec<f32>>,
        strength: f32,
        confidence: f32,
        created: u64,
    ) -> bool {
        self.append(
            sequence,
            WriteEntry::AddConcept {
                id,
                content: content.into_boxed_slice(),
                vector: vector.map(|v| v.into_boxed_slice()),
                strength,
                confidence,
                created,
            },
        )
    }

    /// Append an association (convenience)
    pub fn append_association(&self, sequence: u64, record: AssociationRecord) -> bool {
        self.append(sequence, WriteEntry::AddAssociation { record })
    }

    /// Drain up to N entries in FIFO order (for the reconciler)
    pub fn drain_batch(&self, max_entries: usize) -> Vec<Pending> {
        let mut batch = Vec::with_capacity(max_entries.min(self.receiver.len()));

        for _ in 0..max_entries {
            match self.receiver.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        batch
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn stats(&self) -> WriteLogStats {
        let pending = self.receiver.len();
        WriteLogStats {
            written: self.written.load(Ordering::Relaxed),
            pending,
            watermark: self.watermark,
            hot: pending > self.watermark,
        }
    }
}

/// Write log statistics
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct WriteLogStats {
    pub written: u64,
    pub pending: usize,
    pub watermark: usize,
    pub hot: bool,
}
