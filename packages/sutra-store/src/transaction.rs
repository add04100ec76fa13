/// Two-Phase Commit (2PC) Transaction Coordinator
///
/// Ensures atomicity for cross-shard edge writes: the forward edge and its
/// reverse-direction companion land on both shards or on neither.
///
/// Protocol:
/// 1. PREPARE: each participant validates its endpoint, locks the affected
///    node, appends an uncommitted PREPARE record to its WAL, votes
/// 2. DECIDE: all YES -> commit, otherwise abort
/// 3. COMMIT/ABORT: participants apply or discard, flip the WAL record,
///    release locks
///
/// Any transaction older than the timeout is force-aborted by a periodic
/// sweep; a participant stuck in Prepared past twice the timeout aborts
/// unilaterally (presumed abort).
use crate::types::{AssociationRecord, ConceptId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Transaction ID generator (monotonic)
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

pub fn generate_txn_id() -> u64 {
    NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst)
}

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Transaction started, preparing resources
    Preparing,
    /// All participants prepared successfully
    Prepared,
    /// Transaction committed
    Committed,
    /// Transaction aborted
    Aborted,
}

/// Transaction participant (shard)
#[derive(Debug, Clone)]
pub struct Participant {
    pub shard_id: u32,
    pub state: TxnState,
    pub prepared_at: Option<Instant>,
}

/// Transaction record
#[derive(Debug, Clone)]
pub struct Transaction {
    pub txn_id: u64,
    pub operation: TxnOperation,
    pub participants: Vec<Participant>,
    pub started_at: Instant,
    pub state: TxnState,
}

/// Transaction operation types
#[derive(Debug, Clone)]
pub enum TxnOperation {
    /// Cross-shard association creation
    CreateAssociation {
        record: AssociationRecord,
        source_shard: u32,
        target_shard: u32,
    },
}

/// A participant-side prepared write: the association to apply on commit,
/// the locked node, and where the uncommitted PREPARE landed in the WAL.
#[derive(Debug, Clone)]
pub struct PreparedWrite {
    pub txn_id: u64,
    pub record: AssociationRecord,
    pub locked: ConceptId,
    pub wal_offset: u64,
    pub prepared_at: Instant,
}

/// Transaction coordinator (manages the 2PC protocol)
pub struct TransactionCoordinator {
    /// Active transactions (txn_id -> Transaction)
    active: RwLock<HashMap<u64, Transaction>>,
    /// Transaction timeout
    timeout: Duration,
}

/// Transaction coordinator errors (internal to the 2PC machinery; the public
/// API surfaces them as `StoreError::TxnAborted`)
#[derive(Debug, Clone)]
pub enum TxnError {
    NotFound(u64),
    InvalidParticipant(u32),
    Timeout(u64),
    InvalidState {
        txn_id: u64,
        expected: TxnState,
        actual: TxnState,
    },
}

impl std::fmt::Display for TxnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxnError::NotFound(id) => write!(f, "Transaction {} not found", id),
            TxnError::InvalidParticipant(shard) => write!(f, "Invalid participant shard: {}", shard),
            TxnError::Timeout(id) => write!(f, "Transaction {} timed out", id),
            TxnError::InvalidState { txn_id, expected, actual } => write!(
                f,
                "Transaction {} invalid state: expected {:?}, got {:?}",
                txn_id, expected, actual
            ),
        }
    }
}

impl std::error::Error for TxnError {}

impl TransactionCoordinator {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a new transaction
    pub fn begin(&self, operation: TxnOperation) -> u64 {
        let txn_id = generate_txn_id();

        let participants = match &operation {
            TxnOperation::CreateAssociation {
                source_shard,
                target_shard,
                ..
            } => {
                let mut parts = vec![Participant {
                    shard_id: *source_shard,
                    state: TxnState::Preparing,
                    prepared_at: None,
                }];

                if source_shard != target_shard {
                    parts.push(Participant {
                        shard_id: *target_shard,
                        state: TxnState::Preparing,
                        prepared_at: None,
                    });
                }

                parts
            }
        };

        let txn = Transaction {
            txn_id,
            operation,
            participants,
            started_at: Instant::now(),
            state: TxnState::Preparing,
        };

        self.active.write().insert(txn_id, txn);
        log::debug!("2PC: started transaction {}", txn_id);

        txn_id
    }

    /// Mark a participant as prepared (its YES vote)
    pub fn mark_prepared(&self, txn_id: u64, shard_id: u32) -> Result<(), TxnError> {
        let mut active = self.active.write();
        let txn = active.get_mut(&txn_id).ok_or(TxnError::NotFound(txn_id))?;

        if txn.started_at.elapsed() > self.timeout {
            log::warn!("2PC: transaction {} timed out during prepare", txn_id);
            txn.state = TxnState::Aborted;
            return Err(TxnError::Timeout(txn_id));
        }

        let participant = txn
            .participants
            .iter_mut()
            .find(|p| p.shard_id == shard_id)
            .ok_or(TxnError::InvalidParticipant(shard_id))?;

        participant.state = TxnState::Prepared;
        participant.prepared_at = Some(Instant::now());

        if txn.participants.iter().all(|p| p.state == TxnState::Prepared) {
            txn.state = TxnState::Prepared;
            log::debug!("2PC: all participants prepared for txn {}", txn_id);
        }

        Ok(())
    }

    /// Whether the decision can be COMMIT (all participants prepared)
    pub fn is_ready_to_commit(&self, txn_id: u64) -> Result<bool, TxnError> {
        let active = self.active.read();
        let txn = active.get(&txn_id).ok_or(TxnError::NotFound(txn_id))?;

        if txn.started_at.elapsed() > self.timeout {
            return Err(TxnError::Timeout(txn_id));
        }

        Ok(txn.state == TxnState::Prepared)
    }

    /// Record the COMMIT decision (Phase 2)
    pub fn commit(&self, txn_id: u64) -> Result<(), TxnError> {
        let mut active = self.active.write();
        let txn = active.get_mut(&txn_id).ok_or(TxnError::NotFound(txn_id))?;

        if txn.state != TxnState::Prepared {
            return Err(TxnError::InvalidState {
                txn_id,
                expected: TxnState::Prepared,
                actual: txn.state,
            });
        }

        txn.state = TxnState::Committed;
        for participant in &mut txn.participants {
            participant.state = TxnState::Committed;
        }

        log::info!("2PC: transaction {} committed", txn_id);
        Ok(())
    }

    /// Record the ABORT decision
    pub fn abort(&self, txn_id: u64) -> Result<(), TxnError> {
        let mut active = self.active.write();
        let txn = active.get_mut(&txn_id).ok_or(TxnError::NotFound(txn_id))?;

        txn.state = TxnState::Aborted;
        for participant in &mut txn.participants {
            participant.state = TxnState::Aborted;
        }

        log::warn!("2PC: transaction {} aborted", txn_id);
        Ok(())
    }

    /// Drop a finished transaction from the active set
    pub fn complete(&self, txn_id: u64) {
        let mut active = self.active.write();
        if let Some(txn) = active.remove(&txn_id) {
            log::debug!(
                "2PC: cleaned up transaction {} (state: {:?}, duration: {:?})",
                txn_id,
                txn.state,
                txn.started_at.elapsed()
            );
        }
    }

    pub fn get_transaction(&self, txn_id: u64) -> Option<Transaction> {
        self.active.read().get(&txn_id).cloned()
    }

    /// Force-abort transactions older than the timeout. Called by the
    /// periodic sweep; returns how many were aborted.
    pub fn cleanup_timedout(&self) -> usize {
        let mut active = self.active.write();
        let now = Instant::now();

        let timed_out: Vec<u64> = active
            .iter()
            .filter(|(_, txn)| now.duration_since(txn.started_at) > self.timeout)
            .map(|(id, _)| *id)
            .collect();

        for txn_id in &timed_out {
            if let Some(txn) = active.get_mut(txn_id) {
                txn.state = TxnState::Aborted;
                log::warn!("2PC: transaction {} timed out and aborted", txn_id);
            }
        }

        let count = timed_out.len();
        for txn_id in timed_out {
            active.remove(&txn_id);
        }

        count
    }

    pub fn stats(&self) -> TxnCoordinatorStats {
        let active = self.active.read();

        let mut preparing = 0;
        let mut prepared = 0;
        let mut committed = 0;
        let mut aborted = 0;

        for txn in active.values() {
            match txn.state {
                TxnState::Preparing => preparing += 1,
                TxnState::Prepared => prepared += 1,
                TxnState::Committed => committed += 1,
                TxnState::Aborted => aborted += 1,
            }
        }

        TxnCoordinatorStats {
            active_count: active.len(),
            preparing,
            prepared,
            committed,
            aborted,
        }
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Transaction coordinator statistics
#[derive(Debug, Clone)]
pub struct TxnCoordinatorStats {
    pub active_count: usize,
    pub preparing: usize,
    pub prepared: usize,
    pub committed: usize,
    pub aborted: usize,
}
