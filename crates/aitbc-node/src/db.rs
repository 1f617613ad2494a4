// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - LEDGER STORE
//
// sled embedded database for the append-only chain.
// One cross-tree transaction commits a block, its transactions, its
// receipts, and the balance updates as a single atomic unit.
// Foreign keys are surrogate block ids — never heights.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_core::{ApplyError, Block, ChainState};
use aitbc_receipt::ReceiptEnvelope;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::path::Path;
use std::sync::Mutex;

use crate::safe_lock;

const TREE_BLOCKS: &str = "blocks";
const TREE_INDEX: &str = "index";
const TREE_STATE: &str = "state";

// Index key prefixes (one index tree keeps the atomic commit at 3 trees)
const IDX_HEIGHT: u8 = b'h';
const IDX_HASH: u8 = b'x';
const IDX_TX: u8 = b't';
const IDX_RECEIPT: u8 = b'r';

const STATE_ACCOUNT_PREFIX: u8 = b'a';
const META_HEAD: &[u8] = b"m:head";
const META_NEXT_BLOCK_ID: &[u8] = b"m:next_block_id";
const META_FEES: &[u8] = b"m:accumulated_fees";

#[derive(Debug, Clone, PartialEq)]
pub enum AppendError {
    /// Parent hash or height does not extend the local head
    InvalidParent(String),
    /// Recomputed hash or tx root disagrees with the claimed one
    InvalidHash(String),
    /// Timestamp does not strictly advance past the parent
    InvalidTimestamp(String),
    /// Duplicate tx/receipt or balance/nonce violation
    Conflict(String),
    /// sled failure (disk full, lock contention)
    Storage(String),
}

impl std::fmt::Display for AppendError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AppendError::InvalidParent(m) => write!(f, "InvalidParent: {}", m),
            AppendError::InvalidHash(m) => write!(f, "InvalidHash: {}", m),
            AppendError::InvalidTimestamp(m) => write!(f, "InvalidTimestamp: {}", m),
            AppendError::Conflict(m) => write!(f, "Conflict: {}", m),
            AppendError::Storage(m) => write!(f, "Storage: {}", m),
        }
    }
}

/// Current chain head
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HeadInfo {
    pub height: u64,
    pub hash: String,
    pub timestamp: u64,
    pub block_id: u64,
}

/// Where a committed transaction lives (FK by surrogate block id)
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TxLocation {
    pub block_id: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub index: u32,
}

/// A receipt row materialized from a committed ReceiptRecord transaction
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredReceipt {
    pub block_id: u64,
    pub block_height: u64,
    pub block_hash: String,
    pub envelope: ReceiptEnvelope,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub blocks_count: u64,
    pub accounts_count: u64,
    pub size_on_disk: u64,
}

struct LedgerInner {
    head: Option<HeadInfo>,
    next_block_id: u64,
    state: ChainState,
}

/// Ledger store. Writes are serialized through one path (proposer and
/// import both end up here); readers hit sled snapshots directly.
pub struct LedgerDb {
    db: sled::Db,
    chain_id: u64,
    inner: Mutex<LedgerInner>,
}

#[cfg(unix)]
fn is_db_lock_available(path: &Path) -> Result<bool, String> {
    use std::os::unix::io::AsRawFd;

    let db_file = path.join("db");
    if !db_file.exists() {
        return Ok(true); // New database — no lock contention possible
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .open(&db_file)
        .map_err(|e| format!("Cannot open db file for lock check: {}", e))?;

    let fd = file.as_raw_fd();
    // LOCK_EX | LOCK_NB: exclusive, non-blocking
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        // We got the lock — release it immediately (sled will re-acquire)
        unsafe { libc::flock(fd, libc::LOCK_UN) };
        Ok(true)
    } else {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(format!("flock probe failed: {}", err))
        }
    }
}

#[cfg(not(unix))]
fn is_db_lock_available(_path: &Path) -> Result<bool, String> {
    Ok(true) // Non-Unix: rely on sled's own error
}

impl LedgerDb {
    /// Open or create the ledger database.
    ///
    /// The flock is probed NON-BLOCKING before `sled::open` so a second
    /// node process pointed at the same ledger fails fast instead of
    /// hanging in kernel I/O. This is the proposer-singleton guard: one
    /// ledger, one process, one proposer loop.
    pub fn open<P: AsRef<Path>>(path: P, chain_id: u64) -> Result<Self, String> {
        let path_ref = path.as_ref();
        let retry_delays_ms: [u64; 3] = [500, 1000, 2000];

        match is_db_lock_available(path_ref) {
            Ok(true) => {}
            Ok(false) => {
                eprintln!(
                    "⚠️  Ledger flock held by another process at {} — retrying with backoff",
                    path_ref.display()
                );
                let mut acquired = false;
                for (i, delay_ms) in retry_delays_ms.iter().enumerate() {
                    std::thread::sleep(std::time::Duration::from_millis(*delay_ms));
                    eprintln!(
                        "🔄 Lock probe retry {}/{} after {}ms...",
                        i + 1,
                        retry_delays_ms.len(),
                        delay_ms
                    );
                    match is_db_lock_available(path_ref) {
                        Ok(true) => {
                            acquired = true;
                            break;
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            eprintln!("⚠️ flock probe error: {} — deferring to sled::open", e);
                            acquired = true;
                            break;
                        }
                    }
                }
                if !acquired {
                    return Err(format!(
                        "Ledger lock permanently held at {} — another aitbc-node still \
                         owns this ledger. Exactly one node process per ledger.",
                        path_ref.display()
                    ));
                }
            }
            Err(e) => {
                eprintln!("⚠️ flock probe error: {} — deferring to sled::open", e);
            }
        }

        let db = sled::open(path_ref).map_err(|e| format!("Failed to open ledger db: {}", e))?;

        let ledger = LedgerDb {
            db,
            chain_id,
            inner: Mutex::new(LedgerInner {
                head: None,
                next_block_id: 1,
                state: ChainState::new(),
            }),
        };
        ledger.load()?;
        Ok(ledger)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn blocks_tree(&self) -> Result<Tree, String> {
        self.db
            .open_tree(TREE_BLOCKS)
            .map_err(|e| format!("Failed to open blocks tree: {}", e))
    }

    fn index_tree(&self) -> Result<Tree, String> {
        self.db
            .open_tree(TREE_INDEX)
            .map_err(|e| format!("Failed to open index tree: {}", e))
    }

    fn state_tree(&self) -> Result<Tree, String> {
        self.db
            .open_tree(TREE_STATE)
            .map_err(|e| format!("Failed to open state tree: {}", e))
    }

    fn idx_key(prefix: u8, rest: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + rest.len());
        key.push(prefix);
        key.push(b':');
        key.extend_from_slice(rest);
        key
    }

    fn account_key(address: &str) -> Vec<u8> {
        Self::idx_key(STATE_ACCOUNT_PREFIX, address.as_bytes())
    }

    /// Rebuild the in-memory head/state mirror from the durable trees.
    fn load(&self) -> Result<(), String> {
        let index = self.index_tree()?;
        let state_tree = self.state_tree()?;

        let mut inner = safe_lock(&self.inner);

        if let Some(raw) = state_tree
            .get(META_HEAD)
            .map_err(|e| format!("Failed to read head: {}", e))?
        {
            inner.head = Some(
                serde_json::from_slice(&raw).map_err(|e| format!("Corrupt head row: {}", e))?,
            );
        }
        if let Some(raw) = state_tree
            .get(META_NEXT_BLOCK_ID)
            .map_err(|e| format!("Failed to read next block id: {}", e))?
        {
            let bytes: [u8; 8] = raw
                .as_ref()
                .try_into()
                .map_err(|_| "Corrupt next_block_id row".to_string())?;
            inner.next_block_id = u64::from_le_bytes(bytes);
        }

        let mut state = ChainState::new();
        if let Some(raw) = state_tree
            .get(META_FEES)
            .map_err(|e| format!("Failed to read fees: {}", e))?
        {
            let bytes: [u8; 16] = raw
                .as_ref()
                .try_into()
                .map_err(|_| "Corrupt accumulated_fees row".to_string())?;
            state.accumulated_fees = u128::from_le_bytes(bytes);
        }
        for entry in state_tree.scan_prefix([STATE_ACCOUNT_PREFIX, b':']) {
            let (key, value) = entry.map_err(|e| format!("Account scan failed: {}", e))?;
            let address = String::from_utf8(key[2..].to_vec())
                .map_err(|e| format!("Corrupt account key: {}", e))?;
            let account =
                serde_json::from_slice(&value).map_err(|e| format!("Corrupt account row: {}", e))?;
            state.accounts.insert(address, account);
        }
        for entry in index.scan_prefix([IDX_RECEIPT, b':']) {
            let (key, _) = entry.map_err(|e| format!("Receipt scan failed: {}", e))?;
            let receipt_id = String::from_utf8(key[2..].to_vec())
                .map_err(|e| format!("Corrupt receipt key: {}", e))?;
            state.minted_receipts.insert(receipt_id);
        }
        inner.state = state;
        Ok(())
    }

    /// Head of the local chain. None before genesis is installed.
    pub fn head(&self) -> Option<HeadInfo> {
        safe_lock(&self.inner).head.clone()
    }

    /// Read-consistent snapshot of balances/nonces/fees
    pub fn state_snapshot(&self) -> ChainState {
        safe_lock(&self.inner).state.clone()
    }

    pub fn account(&self, address: &str) -> Option<aitbc_core::Account> {
        safe_lock(&self.inner).state.accounts.get(address).cloned()
    }

    /// True if a committed transaction already references this tx hash
    pub fn contains_tx(&self, tx_hash: &str) -> Result<bool, String> {
        let index = self.index_tree()?;
        index
            .contains_key(Self::idx_key(IDX_TX, tx_hash.as_bytes()))
            .map_err(|e| format!("tx lookup failed: {}", e))
    }

    /// True if a committed block already materialized this receipt id
    pub fn contains_receipt(&self, receipt_id: &str) -> Result<bool, String> {
        let index = self.index_tree()?;
        index
            .contains_key(Self::idx_key(IDX_RECEIPT, receipt_id.as_bytes()))
            .map_err(|e| format!("receipt lookup failed: {}", e))
    }

    /// Append a block atomically: block row + height/hash/tx/receipt
    /// indexes + account updates + head pointer, all in ONE cross-tree
    /// sled transaction. A crash mid-append leaves no partial state.
    pub fn append_block(&self, block: &Block) -> Result<u64, AppendError> {
        use sled::Transactional;

        let blocks = self.blocks_tree().map_err(AppendError::Storage)?;
        let index = self.index_tree().map_err(AppendError::Storage)?;
        let state_tree = self.state_tree().map_err(AppendError::Storage)?;

        let mut inner = safe_lock(&self.inner);

        // ── Linkage validation against the local head ───────────────────
        match &inner.head {
            Some(head) => {
                if block.header.height != head.height + 1 {
                    return Err(AppendError::InvalidParent(format!(
                        "height {} does not extend head {}",
                        block.header.height, head.height
                    )));
                }
                if block.header.parent_hash != head.hash {
                    return Err(AppendError::InvalidParent(format!(
                        "parent {} does not match head hash {}",
                        block.header.parent_hash, head.hash
                    )));
                }
                if block.header.timestamp <= head.timestamp {
                    return Err(AppendError::InvalidTimestamp(format!(
                        "timestamp {} must be > parent timestamp {}",
                        block.header.timestamp, head.timestamp
                    )));
                }
            }
            None => {
                if block.header.height != 0
                    || block.header.parent_hash != aitbc_core::GENESIS_PARENT_HASH
                {
                    return Err(AppendError::InvalidParent(
                        "first block must be the genesis block".to_string(),
                    ));
                }
            }
        }

        // ── Content validation ──────────────────────────────────────────
        block
            .verify_hashes(self.chain_id)
            .map_err(AppendError::InvalidHash)?;

        let mut seen_in_block = std::collections::BTreeSet::new();
        for tx in &block.transactions {
            let tx_hash = tx.tx_hash(self.chain_id);
            if !seen_in_block.insert(tx_hash.clone()) {
                return Err(AppendError::Conflict(format!(
                    "duplicate tx {} within block",
                    tx_hash
                )));
            }
            let dup = index
                .contains_key(Self::idx_key(IDX_TX, tx_hash.as_bytes()))
                .map_err(|e| AppendError::Storage(e.to_string()))?;
            if dup {
                return Err(AppendError::Conflict(format!(
                    "tx {} already committed",
                    tx_hash
                )));
            }
        }
        for (receipt_id, _) in block.receipt_records(self.chain_id) {
            let dup = index
                .contains_key(Self::idx_key(IDX_RECEIPT, receipt_id.as_bytes()))
                .map_err(|e| AppendError::Storage(e.to_string()))?;
            if dup {
                return Err(AppendError::Conflict(format!(
                    "receipt {} already materialized",
                    receipt_id
                )));
            }
        }

        // ── Stage balance updates on a copy; failure aborts the append ──
        let mut staged = inner.state.clone();
        staged.apply_block(block, self.chain_id).map_err(|e| match e {
            ApplyError::Validation(msg) => AppendError::Conflict(format!("invalid tx: {}", msg)),
            other => AppendError::Conflict(other.to_string()),
        })?;

        // ── Serialize everything OUTSIDE the transaction ────────────────
        let block_id = inner.next_block_id;
        let block_key = block_id.to_be_bytes().to_vec();
        let block_json = serde_json::to_vec(block)
            .map_err(|e| AppendError::Storage(format!("Failed to serialize block: {}", e)))?;

        let head = HeadInfo {
            height: block.header.height,
            hash: block.header.hash.clone(),
            timestamp: block.header.timestamp,
            block_id,
        };
        let head_json = serde_json::to_vec(&head)
            .map_err(|e| AppendError::Storage(format!("Failed to serialize head: {}", e)))?;

        let mut index_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        index_entries.push((
            Self::idx_key(IDX_HEIGHT, &block.header.height.to_be_bytes()),
            block_key.clone(),
        ));
        index_entries.push((
            Self::idx_key(IDX_HASH, block.header.hash.as_bytes()),
            block_key.clone(),
        ));
        for (i, tx) in block.transactions.iter().enumerate() {
            let loc = TxLocation {
                block_id,
                block_height: block.header.height,
                block_hash: block.header.hash.clone(),
                index: i as u32,
            };
            let loc_json = serde_json::to_vec(&loc)
                .map_err(|e| AppendError::Storage(format!("Failed to serialize tx loc: {}", e)))?;
            index_entries.push((
                Self::idx_key(IDX_TX, tx.tx_hash(self.chain_id).as_bytes()),
                loc_json,
            ));
        }
        for (receipt_id, envelope) in block.receipt_records(self.chain_id) {
            let row = StoredReceipt {
                block_id,
                block_height: block.header.height,
                block_hash: block.header.hash.clone(),
                envelope: envelope.clone(),
            };
            let row_json = serde_json::to_vec(&row).map_err(|e| {
                AppendError::Storage(format!("Failed to serialize receipt row: {}", e))
            })?;
            index_entries.push((Self::idx_key(IDX_RECEIPT, receipt_id.as_bytes()), row_json));
        }

        // Only accounts touched by this block need rewriting
        let mut account_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for tx in &block.transactions {
            for address in [&tx.sender, &tx.recipient] {
                if let Some(account) = staged.accounts.get(address.as_str()) {
                    let account_json = serde_json::to_vec(account).map_err(|e| {
                        AppendError::Storage(format!("Failed to serialize account: {}", e))
                    })?;
                    account_entries.push((Self::account_key(address), account_json));
                }
            }
        }

        let fees_bytes = staged.accumulated_fees.to_le_bytes().to_vec();
        let next_id_bytes = (block_id + 1).to_le_bytes().to_vec();

        // ── Atomic cross-tree commit: all-or-nothing ────────────────────
        (&blocks, &index, &state_tree)
            .transaction(|(tx_blocks, tx_index, tx_state)| {
                tx_blocks.insert(block_key.as_slice(), block_json.as_slice())?;
                for (key, value) in &index_entries {
                    tx_index.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &account_entries {
                    tx_state.insert(key.as_slice(), value.as_slice())?;
                }
                tx_state.insert(META_HEAD, head_json.as_slice())?;
                tx_state.insert(META_NEXT_BLOCK_ID, next_id_bytes.as_slice())?;
                tx_state.insert(META_FEES, fees_bytes.as_slice())?;
                Ok(())
            })
            .map_err(|e: sled::transaction::TransactionError<()>| {
                AppendError::Storage(format!("Atomic append failed: {:?}", e))
            })?;

        self.db
            .flush()
            .map_err(|e| AppendError::Storage(format!("Failed to flush to disk: {}", e)))?;

        inner.state = staged;
        inner.head = Some(head);
        inner.next_block_id = block_id + 1;
        Ok(block_id)
    }

    fn load_block_by_id(&self, block_id_raw: &[u8]) -> Result<Option<Block>, String> {
        let blocks = self.blocks_tree()?;
        match blocks
            .get(block_id_raw)
            .map_err(|e| format!("block read failed: {}", e))?
        {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|e| format!("Corrupt block row: {}", e))?,
            )),
            None => Ok(None),
        }
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, String> {
        let index = self.index_tree()?;
        match index
            .get(Self::idx_key(IDX_HEIGHT, &height.to_be_bytes()))
            .map_err(|e| format!("height lookup failed: {}", e))?
        {
            Some(block_id) => self.load_block_by_id(&block_id),
            None => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, String> {
        let index = self.index_tree()?;
        match index
            .get(Self::idx_key(IDX_HASH, hash.as_bytes()))
            .map_err(|e| format!("hash lookup failed: {}", e))?
        {
            Some(block_id) => self.load_block_by_id(&block_id),
            None => Ok(None),
        }
    }

    /// Transaction + the block it was sealed into
    pub fn get_tx(
        &self,
        tx_hash: &str,
    ) -> Result<Option<(aitbc_core::Transaction, TxLocation)>, String> {
        let index = self.index_tree()?;
        let loc_raw = match index
            .get(Self::idx_key(IDX_TX, tx_hash.as_bytes()))
            .map_err(|e| format!("tx lookup failed: {}", e))?
        {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let loc: TxLocation =
            serde_json::from_slice(&loc_raw).map_err(|e| format!("Corrupt tx loc: {}", e))?;
        let block = self
            .load_block_by_id(&loc.block_id.to_be_bytes())?
            .ok_or_else(|| format!("tx {} points at missing block {}", tx_hash, loc.block_id))?;
        let tx = block
            .transactions
            .get(loc.index as usize)
            .cloned()
            .ok_or_else(|| format!("tx index {} out of range in block {}", loc.index, loc.block_id))?;
        Ok(Some((tx, loc)))
    }

    pub fn get_receipt(&self, receipt_id: &str) -> Result<Option<StoredReceipt>, String> {
        let index = self.index_tree()?;
        match index
            .get(Self::idx_key(IDX_RECEIPT, receipt_id.as_bytes()))
            .map_err(|e| format!("receipt lookup failed: {}", e))?
        {
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|e| format!("Corrupt receipt row: {}", e))?,
            )),
            None => Ok(None),
        }
    }

    /// Blocks in [from, to], ascending. Missing heights are skipped.
    pub fn iter_blocks(&self, from: u64, to: u64) -> Result<Vec<Block>, String> {
        let mut result = Vec::new();
        for height in from..=to {
            if let Some(block) = self.get_block_by_height(height)? {
                result.push(block);
            }
        }
        Ok(result)
    }

    /// The most recent `limit` blocks, descending from the head
    pub fn latest_blocks(&self, limit: usize) -> Result<Vec<Block>, String> {
        let head = match self.head() {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        let mut result = Vec::new();
        let mut height = head.height;
        loop {
            if let Some(block) = self.get_block_by_height(height)? {
                result.push(block);
            }
            if result.len() >= limit || height == 0 {
                break;
            }
            height -= 1;
        }
        Ok(result)
    }

    pub fn stats(&self) -> DatabaseStats {
        let inner = safe_lock(&self.inner);
        DatabaseStats {
            blocks_count: inner.head.as_ref().map(|h| h.height + 1).unwrap_or(0),
            accounts_count: inner.state.accounts.len() as u64,
            size_on_disk: self.db.size_on_disk().unwrap_or(0),
        }
    }

    /// Flush pending writes. Called on graceful shutdown BEFORE exit so
    /// durability never depends on sled's Drop.
    pub fn flush(&self) -> Result<(), String> {
        self.db
            .flush()
            .map_err(|e| format!("Failed to flush ledger: {}", e))?;
        Ok(())
    }
}
