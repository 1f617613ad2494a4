// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - TRANSACTION MEMPOOL
//
// Pending transactions awaiting inclusion in a block.
// - Priority = (fee desc, encoded size asc, arrival seq asc)
// - Fee-floor admission, duplicate rejection, bounded capacity with
//   evict-lowest-on-higher-priority-arrival
// - Two backends behind one contract: memory (lost on restart) and
//   durable (sled journal, reloaded on startup). Chosen at construction,
//   never swapped during a run.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_core::Transaction;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::now_secs;

#[derive(Debug, Clone, PartialEq)]
pub enum AdmitError {
    /// Fee below the admission floor. Retryable with a higher fee.
    FeeTooLow { fee: u128, min_fee: u128 },
    /// tx_hash already pending. The caller treats it as success if their
    /// prior call succeeded.
    Duplicate,
    /// Pool at capacity and the incoming tx does not beat the lowest
    /// pending priority. Retryable with backoff.
    MempoolFull,
    /// Input shape wrong (oversized, malformed). Not retryable.
    Validation(String),
    /// Durable backend failure. Retryable with backoff.
    Unavailable(String),
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AdmitError::FeeTooLow { fee, min_fee } => {
                write!(f, "FeeTooLow: fee {} < minimum {}", fee, min_fee)
            }
            AdmitError::Duplicate => write!(f, "Duplicate"),
            AdmitError::MempoolFull => write!(f, "MempoolFull"),
            AdmitError::Validation(msg) => write!(f, "Validation: {}", msg),
            AdmitError::Unavailable(msg) => write!(f, "MempoolUnavailable: {}", msg),
        }
    }
}

/// A transaction pending in the pool, with everything needed to restore
/// its exact priority after a durable-backend reload or a failed tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx: Transaction,
    pub tx_hash: String,
    pub encoded_len: usize,
    pub seq: u64,
    pub received_at: u64,
}

/// Ordering key. `Ord` is arranged so that GREATER = higher priority:
/// higher fee first, then smaller encoded size, then earlier arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PriorityKey {
    fee: u128,
    encoded_len: usize,
    seq: u64,
}

impl PriorityKey {
    fn of(entry: &PendingTx) -> Self {
        PriorityKey {
            fee: entry.tx.fee,
            encoded_len: entry.encoded_len,
            seq: entry.seq,
        }
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fee
            .cmp(&other.fee)
            .then_with(|| other.encoded_len.cmp(&self.encoded_len))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Persistence contract behind the pool. The in-memory maps are always
/// authoritative during a run; the backend only has to survive restarts.
pub trait MempoolBackend: Send {
    fn name(&self) -> &'static str;
    fn persist_admit(&self, entry: &PendingTx) -> Result<(), String>;
    fn persist_remove(&self, tx_hash: &str) -> Result<(), String>;
    fn load(&self) -> Result<Vec<PendingTx>, String>;
    fn flush(&self) -> Result<(), String>;
}

/// In-memory backend: nothing persisted, pool empties on restart.
pub struct MemoryBackend;

impl MempoolBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }
    fn persist_admit(&self, _entry: &PendingTx) -> Result<(), String> {
        Ok(())
    }
    fn persist_remove(&self, _tx_hash: &str) -> Result<(), String> {
        Ok(())
    }
    fn load(&self) -> Result<Vec<PendingTx>, String> {
        Ok(Vec::new())
    }
    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Durable backend: every admit/remove journaled to a sled tree so the
/// pending set survives a restart.
pub struct DurableBackend {
    tree: sled::Tree,
}

impl DurableBackend {
    pub fn open(db: &sled::Db) -> Result<Self, String> {
        let tree = db
            .open_tree("mempool")
            .map_err(|e| format!("Failed to open mempool tree: {}", e))?;
        Ok(DurableBackend { tree })
    }
}

impl MempoolBackend for DurableBackend {
    fn name(&self) -> &'static str {
        "durable"
    }

    fn persist_admit(&self, entry: &PendingTx) -> Result<(), String> {
        let value = serde_json::to_vec(entry)
            .map_err(|e| format!("Failed to serialize pending tx: {}", e))?;
        self.tree
            .insert(entry.tx_hash.as_bytes(), value)
            .map_err(|e| format!("Mempool journal write failed: {}", e))?;
        Ok(())
    }

    fn persist_remove(&self, tx_hash: &str) -> Result<(), String> {
        self.tree
            .remove(tx_hash.as_bytes())
            .map_err(|e| format!("Mempool journal remove failed: {}", e))?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<PendingTx>, String> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item.map_err(|e| format!("Mempool journal scan failed: {}", e))?;
            let entry: PendingTx = serde_json::from_slice(&value)
                .map_err(|e| format!("Corrupt mempool journal row: {}", e))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<(), String> {
        self.tree
            .flush()
            .map_err(|e| format!("Mempool journal flush failed: {}", e))?;
        Ok(())
    }
}

pub struct Mempool {
    chain_id: u64,
    min_fee: u128,
    max_size: usize,
    /// A tx that cannot fit even into an empty block is refused outright
    max_tx_bytes: usize,
    entries: HashMap<String, PendingTx>,
    /// Priority index: last entry = highest priority
    index: BTreeMap<PriorityKey, String>,
    next_seq: u64,
    backend: Box<dyn MempoolBackend>,

    // Statistics
    pub total_added: u64,
    pub total_drained: u64,
    pub total_evicted: u64,
    pub total_rejected: u64,
}

impl Mempool {
    pub fn new(
        chain_id: u64,
        min_fee: u128,
        max_size: usize,
        max_tx_bytes: usize,
        backend: Box<dyn MempoolBackend>,
    ) -> Result<Self, String> {
        let mut pool = Mempool {
            chain_id,
            min_fee,
            max_size,
            max_tx_bytes,
            entries: HashMap::new(),
            index: BTreeMap::new(),
            next_seq: 1,
            backend,
            total_added: 0,
            total_drained: 0,
            total_evicted: 0,
            total_rejected: 0,
        };

        // Durable backend: restore the pending set with original priorities
        let restored = pool.backend.load()?;
        if !restored.is_empty() {
            println!(
                "📦 Mempool: restored {} pending transactions from {} backend",
                restored.len(),
                pool.backend.name()
            );
        }
        for entry in restored {
            pool.next_seq = pool.next_seq.max(entry.seq + 1);
            pool.index.insert(PriorityKey::of(&entry), entry.tx_hash.clone());
            pool.entries.insert(entry.tx_hash.clone(), entry);
        }
        Ok(pool)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.entries.contains_key(tx_hash)
    }

    /// Admit a transaction. Returns its hash on acceptance.
    pub fn admit(&mut self, tx: Transaction) -> Result<String, AdmitError> {
        let encoded_len = tx.encoded_len(self.chain_id);
        if encoded_len > self.max_tx_bytes {
            self.total_rejected += 1;
            return Err(AdmitError::Validation(format!(
                "transaction of {} bytes exceeds block size cap {}",
                encoded_len, self.max_tx_bytes
            )));
        }
        if tx.fee < self.min_fee {
            self.total_rejected += 1;
            return Err(AdmitError::FeeTooLow {
                fee: tx.fee,
                min_fee: self.min_fee,
            });
        }

        let tx_hash = tx.tx_hash(self.chain_id);
        if self.entries.contains_key(&tx_hash) {
            self.total_rejected += 1;
            return Err(AdmitError::Duplicate);
        }

        let entry = PendingTx {
            tx_hash: tx_hash.clone(),
            encoded_len,
            seq: self.next_seq,
            received_at: now_secs(),
            tx,
        };
        let incoming_key = PriorityKey::of(&entry);

        if self.entries.len() >= self.max_size {
            // Evict the lowest-priority pending tx iff the incoming one is
            // STRICTLY higher priority; otherwise refuse admission.
            let lowest_key = match self.index.keys().next() {
                Some(k) => k.clone(),
                None => {
                    self.total_rejected += 1;
                    return Err(AdmitError::MempoolFull);
                }
            };
            if incoming_key > lowest_key {
                if let Some(evicted_hash) = self.index.get(&lowest_key).cloned() {
                    self.remove(&evicted_hash)
                        .map_err(AdmitError::Unavailable)?;
                    self.total_evicted += 1;
                }
            } else {
                self.total_rejected += 1;
                return Err(AdmitError::MempoolFull);
            }
        }

        self.backend
            .persist_admit(&entry)
            .map_err(AdmitError::Unavailable)?;
        self.next_seq += 1;
        self.index.insert(incoming_key, tx_hash.clone());
        self.entries.insert(tx_hash.clone(), entry);
        self.total_added += 1;
        Ok(tx_hash)
    }

    fn remove(&mut self, tx_hash: &str) -> Result<Option<PendingTx>, String> {
        if let Some(entry) = self.entries.remove(tx_hash) {
            self.index.remove(&PriorityKey::of(&entry));
            self.backend.persist_remove(tx_hash)?;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Pop the highest-priority transactions that fit the byte and count
    /// budgets. Selection is stable on ties (arrival order). Transactions
    /// too large for the REMAINING byte budget are skipped, not dropped.
    pub fn drain(&mut self, max_bytes: usize, max_count: usize) -> Vec<PendingTx> {
        let mut selected: Vec<String> = Vec::new();
        let mut used_bytes = 0usize;

        for (key, tx_hash) in self.index.iter().rev() {
            if selected.len() >= max_count {
                break;
            }
            if used_bytes + key.encoded_len > max_bytes {
                continue;
            }
            used_bytes += key.encoded_len;
            selected.push(tx_hash.clone());
        }

        let mut drained = Vec::with_capacity(selected.len());
        for tx_hash in selected {
            // Journal failures here are logged, not fatal: the drained tx
            // is leaving the pool either way and the block commit is what
            // actually matters for durability.
            match self.remove(&tx_hash) {
                Ok(Some(entry)) => drained.push(entry),
                Ok(None) => {}
                Err(e) => eprintln!("⚠️  Mempool journal remove failed during drain: {}", e),
            }
        }
        self.total_drained += drained.len() as u64;
        drained
    }

    /// Put drained transactions back (a failed proposer tick). Original
    /// seq values are preserved so priority order is unchanged.
    pub fn readmit(&mut self, entries: Vec<PendingTx>) {
        for entry in entries {
            if self.entries.contains_key(&entry.tx_hash) {
                continue;
            }
            if let Err(e) = self.backend.persist_admit(&entry) {
                eprintln!("⚠️  Mempool journal re-admit failed: {}", e);
            }
            self.index.insert(PriorityKey::of(&entry), entry.tx_hash.clone());
            self.entries.insert(entry.tx_hash.clone(), entry);
        }
    }

    /// Drop every pending tx with fee below the floor. Returns the count.
    pub fn evict_below(&mut self, fee_floor: u128) -> usize {
        let victims: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.tx.fee < fee_floor)
            .map(|e| e.tx_hash.clone())
            .collect();
        let count = victims.len();
        for tx_hash in victims {
            if let Err(e) = self.remove(&tx_hash) {
                eprintln!("⚠️  Mempool journal remove failed during evict: {}", e);
            }
        }
        self.total_evicted += count as u64;
        count
    }

    pub fn flush(&self) -> Result<(), String> {
        self.backend.flush()
    }
}
