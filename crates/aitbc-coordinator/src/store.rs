// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - COORDINATOR STORE
//
// sled persistence for jobs, miners, receipts, and the chain-submission
// retry queue. The receipt-pipeline commit (receipt row + history row +
// job transition + miner release) is one cross-tree transaction —
// all-or-nothing, never observable half-done.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_receipt::ReceiptEnvelope;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::path::Path;

use crate::jobs::{Job, JobEvent};
use crate::miners::Miner;

const TREE_JOBS: &str = "jobs";
const TREE_EVENTS: &str = "job_events";
const TREE_MINERS: &str = "miners";
const TREE_RECEIPTS: &str = "receipts"; // r:{receipt_id} rows + h:{job_id}:{seq} history
const TREE_PENDING: &str = "pending_chain_txs";
const TREE_META: &str = "meta";

const META_NONCE: &[u8] = b"coordinator_nonce";

/// A receipt accepted by the pipeline, as persisted
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredJobReceipt {
    pub receipt_id: String,
    pub job_id: String,
    pub envelope: ReceiptEnvelope,
    pub stored_at: u64,
}

/// A reward transaction that could not reach the chain node yet.
/// The transaction is REBUILT (fresh nonce) at retry time; chain-side
/// receipt uniqueness makes redelivery safe.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PendingReward {
    pub receipt_id: String,
    pub recipient: String,
    pub amount: u128,
    pub envelope: ReceiptEnvelope,
    pub parked_at: u64,
}

pub struct CoordinatorDb {
    db: sled::Db,
}

impl CoordinatorDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let db = sled::open(path.as_ref())
            .map_err(|e| format!("Failed to open coordinator db: {}", e))?;
        Ok(CoordinatorDb { db })
    }

    fn tree(&self, name: &str) -> Result<Tree, String> {
        self.db
            .open_tree(name)
            .map_err(|e| format!("Failed to open {} tree: {}", name, e))
    }

    fn receipt_key(receipt_id: &str) -> Vec<u8> {
        let mut key = b"r:".to_vec();
        key.extend_from_slice(receipt_id.as_bytes());
        key
    }

    fn history_key(job_id: &str, seq: u64) -> Vec<u8> {
        let mut key = b"h:".to_vec();
        key.extend_from_slice(job_id.as_bytes());
        key.push(b':');
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    pub fn put_job(&self, job: &Job) -> Result<(), String> {
        let tree = self.tree(TREE_JOBS)?;
        let value =
            serde_json::to_vec(job).map_err(|e| format!("Failed to serialize job: {}", e))?;
        tree.insert(job.id.as_bytes(), value)
            .map_err(|e| format!("Job write failed: {}", e))?;
        Ok(())
    }

    pub fn load_jobs(&self) -> Result<Vec<Job>, String> {
        let tree = self.tree(TREE_JOBS)?;
        let mut jobs = Vec::new();
        for item in tree.iter() {
            let (_, value) = item.map_err(|e| format!("Job scan failed: {}", e))?;
            jobs.push(
                serde_json::from_slice(&value).map_err(|e| format!("Corrupt job row: {}", e))?,
            );
        }
        Ok(jobs)
    }

    pub fn append_event(&self, event: &JobEvent) -> Result<(), String> {
        let tree = self.tree(TREE_EVENTS)?;
        let mut key = event.job_id.as_bytes().to_vec();
        key.push(b':');
        key.extend_from_slice(&event.seq.to_be_bytes());
        let value =
            serde_json::to_vec(event).map_err(|e| format!("Failed to serialize event: {}", e))?;
        tree.insert(key, value)
            .map_err(|e| format!("Event write failed: {}", e))?;
        Ok(())
    }

    pub fn events_for(&self, job_id: &str) -> Result<Vec<JobEvent>, String> {
        let tree = self.tree(TREE_EVENTS)?;
        let mut prefix = job_id.as_bytes().to_vec();
        prefix.push(b':');
        let mut events = Vec::new();
        for item in tree.scan_prefix(&prefix) {
            let (_, value) = item.map_err(|e| format!("Event scan failed: {}", e))?;
            events.push(
                serde_json::from_slice(&value).map_err(|e| format!("Corrupt event row: {}", e))?,
            );
        }
        Ok(events)
    }

    // ── Miners ──────────────────────────────────────────────────────────

    pub fn put_miner(&self, miner: &Miner) -> Result<(), String> {
        let tree = self.tree(TREE_MINERS)?;
        let value =
            serde_json::to_vec(miner).map_err(|e| format!("Failed to serialize miner: {}", e))?;
        tree.insert(miner.id.as_bytes(), value)
            .map_err(|e| format!("Miner write failed: {}", e))?;
        Ok(())
    }

    pub fn load_miners(&self) -> Result<Vec<Miner>, String> {
        let tree = self.tree(TREE_MINERS)?;
        let mut miners = Vec::new();
        for item in tree.iter() {
            let (_, value) = item.map_err(|e| format!("Miner scan failed: {}", e))?;
            miners.push(
                serde_json::from_slice(&value).map_err(|e| format!("Corrupt miner row: {}", e))?,
            );
        }
        Ok(miners)
    }

    // ── Receipts ────────────────────────────────────────────────────────

    pub fn contains_receipt(&self, receipt_id: &str) -> Result<bool, String> {
        let tree = self.tree(TREE_RECEIPTS)?;
        tree.contains_key(Self::receipt_key(receipt_id))
            .map_err(|e| format!("Receipt lookup failed: {}", e))
    }

    pub fn receipt(&self, receipt_id: &str) -> Result<Option<StoredJobReceipt>, String> {
        let tree = self.tree(TREE_RECEIPTS)?;
        match tree
            .get(Self::receipt_key(receipt_id))
            .map_err(|e| format!("Receipt lookup failed: {}", e))?
        {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|e| format!("Corrupt receipt row: {}", e))?,
            )),
            None => Ok(None),
        }
    }

    /// Receipts for a job in storage order (history preserved; the last
    /// entry is the latest).
    pub fn receipts_for_job(&self, job_id: &str) -> Result<Vec<StoredJobReceipt>, String> {
        let tree = self.tree(TREE_RECEIPTS)?;
        let mut prefix = b"h:".to_vec();
        prefix.extend_from_slice(job_id.as_bytes());
        prefix.push(b':');

        let mut receipts = Vec::new();
        for item in tree.scan_prefix(&prefix) {
            let (_, receipt_id_raw) = item.map_err(|e| format!("History scan failed: {}", e))?;
            let receipt_id = String::from_utf8(receipt_id_raw.to_vec())
                .map_err(|e| format!("Corrupt history row: {}", e))?;
            if let Some(row) = self.receipt(&receipt_id)? {
                receipts.push(row);
            }
        }
        Ok(receipts)
    }

    pub fn history_len(&self, job_id: &str) -> Result<u64, String> {
        let tree = self.tree(TREE_RECEIPTS)?;
        let mut prefix = b"h:".to_vec();
        prefix.extend_from_slice(job_id.as_bytes());
        prefix.push(b':');
        let mut count = 0u64;
        for item in tree.scan_prefix(&prefix) {
            item.map_err(|e| format!("History scan failed: {}", e))?;
            count += 1;
        }
        Ok(count)
    }

    /// The all-or-nothing pipeline commit: receipt row, history row,
    /// COMPLETED job, and released miner in one atomic transaction.
    pub fn commit_receipt(
        &self,
        receipt: &StoredJobReceipt,
        history_seq: u64,
        job: &Job,
        miner: &Miner,
    ) -> Result<(), String> {
        use sled::Transactional;

        let jobs_tree = self.tree(TREE_JOBS)?;
        let receipts_tree = self.tree(TREE_RECEIPTS)?;
        let miners_tree = self.tree(TREE_MINERS)?;

        // Pre-serialize outside the transaction
        let receipt_json = serde_json::to_vec(receipt)
            .map_err(|e| format!("Failed to serialize receipt: {}", e))?;
        let job_json =
            serde_json::to_vec(job).map_err(|e| format!("Failed to serialize job: {}", e))?;
        let miner_json =
            serde_json::to_vec(miner).map_err(|e| format!("Failed to serialize miner: {}", e))?;
        let receipt_key = Self::receipt_key(&receipt.receipt_id);
        let history_key = Self::history_key(&receipt.job_id, history_seq);

        (&jobs_tree, &receipts_tree, &miners_tree)
            .transaction(|(tx_jobs, tx_receipts, tx_miners)| {
                tx_receipts.insert(receipt_key.as_slice(), receipt_json.as_slice())?;
                tx_receipts.insert(
                    history_key.as_slice(),
                    receipt.receipt_id.as_bytes(),
                )?;
                tx_jobs.insert(job.id.as_bytes(), job_json.as_slice())?;
                tx_miners.insert(miner.id.as_bytes(), miner_json.as_slice())?;
                Ok(())
            })
            .map_err(|e: sled::transaction::TransactionError<()>| {
                format!("Atomic receipt commit failed: {:?}", e)
            })?;

        self.db
            .flush()
            .map_err(|e| format!("Failed to flush after receipt commit: {}", e))?;
        Ok(())
    }

    // ── Chain submission retry queue ────────────────────────────────────

    pub fn park_reward(&self, pending: &PendingReward) -> Result<(), String> {
        let tree = self.tree(TREE_PENDING)?;
        let value = serde_json::to_vec(pending)
            .map_err(|e| format!("Failed to serialize pending reward: {}", e))?;
        tree.insert(pending.receipt_id.as_bytes(), value)
            .map_err(|e| format!("Pending write failed: {}", e))?;
        Ok(())
    }

    pub fn pending_rewards(&self) -> Result<Vec<PendingReward>, String> {
        let tree = self.tree(TREE_PENDING)?;
        let mut pending = Vec::new();
        for item in tree.iter() {
            let (_, value) = item.map_err(|e| format!("Pending scan failed: {}", e))?;
            pending.push(
                serde_json::from_slice(&value)
                    .map_err(|e| format!("Corrupt pending row: {}", e))?,
            );
        }
        Ok(pending)
    }

    pub fn unpark_reward(&self, receipt_id: &str) -> Result<(), String> {
        let tree = self.tree(TREE_PENDING)?;
        tree.remove(receipt_id.as_bytes())
            .map_err(|e| format!("Pending remove failed: {}", e))?;
        Ok(())
    }

    pub fn pending_count(&self) -> Result<u64, String> {
        Ok(self.tree(TREE_PENDING)?.len() as u64)
    }

    // ── Meta ────────────────────────────────────────────────────────────

    /// Next nonce for coordinator-to-chain transactions. Monotonic across
    /// restarts; the chain's strictly-increasing rule tolerates gaps.
    pub fn next_nonce(&self) -> Result<u64, String> {
        let tree = self.tree(TREE_META)?;
        let updated = tree
            .update_and_fetch(META_NONCE, |old| {
                let current = old
                    .and_then(|raw| raw.try_into().ok().map(u64::from_le_bytes))
                    .unwrap_or(0);
                Some(current.wrapping_add(1).to_le_bytes().to_vec())
            })
            .map_err(|e| format!("Nonce update failed: {}", e))?;
        updated
            .and_then(|raw| raw.as_ref().try_into().ok().map(u64::from_le_bytes))
            .ok_or_else(|| "Nonce row missing after update".to_string())
    }

    pub fn flush(&self) -> Result<(), String> {
        self.db
            .flush()
            .map_err(|e| format!("Failed to flush coordinator db: {}", e))?;
        Ok(())
    }
}
