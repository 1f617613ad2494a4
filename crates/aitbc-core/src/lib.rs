// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - CORE MODULE
//
// Chain primitives: Transaction, Block, ChainState, and application logic.
// Linear PoA chain — one proposer per site seals blocks at fixed cadence.
// All financial arithmetic uses u128 minor units (no floating-point).
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_receipt::wire::{WireReader, WireWriter};
use aitbc_receipt::{ReceiptEnvelope, ReceiptError};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, BTreeSet};

/// Parent hash of the genesis block (no parent)
pub const GENESIS_PARENT_HASH: &str = "0";
/// Proposer identity sealed into the genesis block
pub const GENESIS_PROPOSER: &str = "genesis";
/// Genesis timestamp. Fixed so that every site with the same chain id
/// derives the same genesis hash — the cross-site import precondition.
pub const GENESIS_TIMESTAMP: u64 = 0;

/// Default admission fee floor in minor units
pub const DEFAULT_MIN_FEE: u128 = 10;

// ─────────────────────────────────────────────────────────────────
// TRANSACTIONS
// ─────────────────────────────────────────────────────────────────

/// Transaction payload — a tagged sum with a stable wire discriminator.
/// Unknown discriminators fail deserialization and surface as Validation
/// at the RPC boundary; they are never silently accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxPayload {
    /// Plain value transfer: sender debited amount + fee
    Transfer,
    /// Compute-receipt reward mint. Carries the full signed envelope so
    /// importing sites can materialize the receipt row themselves.
    ReceiptRecord { receipt: ReceiptEnvelope },
    /// Dev/test token grant (credits recipient from the emission pool)
    Faucet { memo: String },
}

impl TxPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TxPayload::Transfer => "transfer",
            TxPayload::ReceiptRecord { .. } => "receipt_record",
            TxPayload::Faucet { .. } => "faucet",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    /// value moved to recipient, in minor units
    pub amount: u128,
    /// admission fee, in minor units
    pub fee: u128,
    /// strictly increasing per sender
    pub nonce: u64,
    pub payload: TxPayload,
}

impl Transaction {
    /// Canonical encoding: chain-id domain separation first (prevents
    /// cross-chain replay), then every field in schema order.
    pub fn canonical_encode(&self, chain_id: u64) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u64(chain_id);
        w.put_str(&self.sender);
        w.put_str(&self.recipient);
        w.put_u128(self.amount);
        w.put_u128(self.fee);
        w.put_u64(self.nonce);
        match &self.payload {
            TxPayload::Transfer => w.put_u8(0),
            TxPayload::ReceiptRecord { receipt } => {
                w.put_u8(1);
                w.put_bytes(&receipt.canonical_encode(chain_id));
            }
            TxPayload::Faucet { memo } => {
                w.put_u8(2);
                w.put_str(memo);
            }
        }
        w.into_bytes()
    }

    /// Total inverse of `canonical_encode`
    pub fn decode(chain_id: u64, bytes: &[u8]) -> Result<Self, ReceiptError> {
        let mut r = WireReader::new(bytes);
        let encoded_chain = r.take_u64()?;
        if encoded_chain != chain_id {
            return Err(ReceiptError::Encoding(format!(
                "chain id mismatch: encoded {} expected {}",
                encoded_chain, chain_id
            )));
        }
        let sender = r.take_str()?;
        let recipient = r.take_str()?;
        let amount = r.take_u128()?;
        let fee = r.take_u128()?;
        let nonce = r.take_u64()?;
        let payload = match r.take_u8()? {
            0 => TxPayload::Transfer,
            1 => {
                let envelope_bytes = r.take_bytes()?;
                TxPayload::ReceiptRecord {
                    receipt: ReceiptEnvelope::decode(chain_id, &envelope_bytes)?,
                }
            }
            2 => TxPayload::Faucet {
                memo: r.take_str()?,
            },
            other => {
                return Err(ReceiptError::Encoding(format!(
                    "unknown payload discriminator {}",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(Transaction {
            sender,
            recipient,
            amount,
            fee,
            nonce,
            payload,
        })
    }

    /// Content hash over the canonical encoding. Unique within the chain.
    pub fn tx_hash(&self, chain_id: u64) -> String {
        let mut hasher = Sha3_256::new();
        hasher.update(self.canonical_encode(chain_id));
        hex::encode(hasher.finalize())
    }

    /// Size charged against mempool and block byte budgets
    pub fn encoded_len(&self, chain_id: u64) -> usize {
        self.canonical_encode(chain_id).len()
    }

    /// The receipt id this transaction would mint, if any
    pub fn receipt_id(&self, chain_id: u64) -> Option<String> {
        match &self.payload {
            TxPayload::ReceiptRecord { receipt } => Some(receipt.receipt_id(chain_id)),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// BLOCKS
// ─────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub height: u64,
    pub parent_hash: String,
    pub timestamp: u64,
    pub proposer: String,
    /// Sha3-256 over the ordered transaction hashes
    pub tx_root: String,
    /// Reserved for a future state commitment; empty today
    #[serde(default)]
    pub state_root: String,
    /// Sha3-256 over the canonical header encoding (this field excluded)
    pub hash: String,
}

impl BlockHeader {
    /// Content hash: all header fields EXCEPT the hash itself.
    pub fn compute_hash(&self, chain_id: u64) -> String {
        let mut w = WireWriter::new();
        w.put_u64(chain_id);
        w.put_u64(self.height);
        w.put_str(&self.parent_hash);
        w.put_u64(self.timestamp);
        w.put_str(&self.proposer);
        w.put_str(&self.tx_root);
        w.put_str(&self.state_root);

        let mut hasher = Sha3_256::new();
        hasher.update(w.into_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    /// Transactions in the order the proposer sealed them
    pub transactions: Vec<Transaction>,
}

/// Transaction root: Sha3-256 over the ordered hex tx hashes.
/// An empty block commits to the hash of the empty string.
pub fn compute_tx_root(chain_id: u64, transactions: &[Transaction]) -> String {
    let mut hasher = Sha3_256::new();
    for tx in transactions {
        hasher.update(tx.tx_hash(chain_id).as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl Block {
    /// Seal a block: compute tx root and header hash from content.
    pub fn build(
        chain_id: u64,
        height: u64,
        parent_hash: String,
        timestamp: u64,
        proposer: String,
        transactions: Vec<Transaction>,
    ) -> Self {
        let tx_root = compute_tx_root(chain_id, &transactions);
        let mut header = BlockHeader {
            height,
            parent_hash,
            timestamp,
            proposer,
            tx_root,
            state_root: String::new(),
            hash: String::new(),
        };
        header.hash = header.compute_hash(chain_id);
        Block {
            header,
            transactions,
        }
    }

    /// Recompute tx root and header hash and compare with the claimed
    /// values. Any mismatch means the block was altered in transit.
    pub fn verify_hashes(&self, chain_id: u64) -> Result<(), String> {
        let tx_root = compute_tx_root(chain_id, &self.transactions);
        if tx_root != self.header.tx_root {
            return Err(format!(
                "tx root mismatch: computed {} claimed {}",
                tx_root, self.header.tx_root
            ));
        }
        let hash = self.header.compute_hash(chain_id);
        if hash != self.header.hash {
            return Err(format!(
                "block hash mismatch: computed {} claimed {}",
                hash, self.header.hash
            ));
        }
        Ok(())
    }

    /// Receipts minted by this block, in transaction order.
    pub fn receipt_records(&self, chain_id: u64) -> Vec<(String, &ReceiptEnvelope)> {
        self.transactions
            .iter()
            .filter_map(|tx| match &tx.payload {
                TxPayload::ReceiptRecord { receipt } => {
                    Some((receipt.receipt_id(chain_id), receipt))
                }
                _ => None,
            })
            .collect()
    }

    pub fn encoded_len(&self, chain_id: u64) -> usize {
        self.transactions
            .iter()
            .map(|tx| tx.encoded_len(chain_id))
            .sum()
    }
}

/// Deterministic genesis block. Every site configured with the same
/// chain id derives the identical genesis hash.
pub fn genesis_block(chain_id: u64) -> Block {
    Block::build(
        chain_id,
        0,
        GENESIS_PARENT_HASH.to_string(),
        GENESIS_TIMESTAMP,
        GENESIS_PROPOSER.to_string(),
        Vec::new(),
    )
}

// ─────────────────────────────────────────────────────────────────
// CHAIN STATE
// ─────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Account {
    pub balance: u128,
    /// highest nonce seen from this sender
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// Sender balance cannot cover amount + fee
    InsufficientFunds { sender: String, needed: u128 },
    /// Nonce does not strictly increase for the sender
    NonceReused {
        sender: String,
        nonce: u64,
        current: u64,
    },
    /// The receipt id was already consumed by a prior mint
    ReceiptAlreadyMinted(String),
    /// Structural problem (overflow, malformed payload)
    Validation(String),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ApplyError::InsufficientFunds { sender, needed } => write!(
                f,
                "InsufficientFunds: sender {} cannot cover {} minor units",
                sender, needed
            ),
            ApplyError::NonceReused {
                sender,
                nonce,
                current,
            } => write!(
                f,
                "NonceReused: sender {} sent nonce {} but account is at {}",
                sender, nonce, current
            ),
            ApplyError::ReceiptAlreadyMinted(id) => {
                write!(f, "ReceiptAlreadyMinted: {}", id)
            }
            ApplyError::Validation(msg) => write!(f, "Validation: {}", msg),
        }
    }
}

impl std::error::Error for ApplyError {}

/// Balances, nonces, and the minted-receipt set.
/// BTreeMap/BTreeSet guarantee deterministic iteration and serialization
/// across all sites.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChainState {
    pub accounts: BTreeMap<String, Account>,
    /// O(1) at-most-once guard: receipt ids already consumed by a mint.
    /// Never pruned.
    pub minted_receipts: BTreeSet<String>,
    /// Fees collected but not yet redistributed, in minor units
    pub accumulated_fees: u128,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, address: &str) -> u128 {
        self.accounts.get(address).map(|a| a.balance).unwrap_or(0)
    }

    /// Apply one transaction. Validates everything FIRST, then mutates —
    /// a failed apply leaves the state untouched.
    ///
    /// Rules:
    /// - Transfer: sender debited amount + fee, recipient credited amount.
    /// - ReceiptRecord / Faucet: system mints. Recipient credited amount
    ///   from the emission pool; the sender is not debited. The fee still
    ///   satisfies the admission floor and lands in accumulated_fees.
    /// - Nonce must strictly increase per sender.
    /// - A receipt id is consumed by minting at most once.
    pub fn apply_transaction(&mut self, tx: &Transaction, chain_id: u64) -> Result<(), ApplyError> {
        if tx.sender.is_empty() || tx.recipient.is_empty() {
            return Err(ApplyError::Validation(
                "sender and recipient must be non-empty".to_string(),
            ));
        }

        let sender_state = self.accounts.get(&tx.sender).cloned().unwrap_or_default();
        if tx.nonce <= sender_state.nonce {
            return Err(ApplyError::NonceReused {
                sender: tx.sender.clone(),
                nonce: tx.nonce,
                current: sender_state.nonce,
            });
        }

        let receipt_id = match &tx.payload {
            TxPayload::ReceiptRecord { receipt } => {
                let id = receipt.receipt_id(chain_id);
                if self.minted_receipts.contains(&id) {
                    return Err(ApplyError::ReceiptAlreadyMinted(id));
                }
                let expected = receipt.payload.reward_amount().ok_or_else(|| {
                    ApplyError::Validation("receipt reward overflows u128".to_string())
                })?;
                if expected != tx.amount {
                    return Err(ApplyError::Validation(format!(
                        "receipt reward {} does not match tx amount {}",
                        expected, tx.amount
                    )));
                }
                Some(id)
            }
            _ => None,
        };

        let sender_debit = match tx.payload {
            TxPayload::Transfer => tx
                .amount
                .checked_add(tx.fee)
                .ok_or_else(|| ApplyError::Validation("amount + fee overflows u128".to_string()))?,
            _ => 0,
        };
        if sender_state.balance < sender_debit {
            return Err(ApplyError::InsufficientFunds {
                sender: tx.sender.clone(),
                needed: sender_debit,
            });
        }

        // All validations passed — mutate
        let mut sender_state = sender_state;
        sender_state.balance -= sender_debit;
        sender_state.nonce = tx.nonce;
        self.accounts.insert(tx.sender.clone(), sender_state);

        let recipient_state = self.accounts.entry(tx.recipient.clone()).or_default();
        recipient_state.balance = recipient_state.balance.saturating_add(tx.amount);

        self.accumulated_fees = self.accumulated_fees.saturating_add(tx.fee);
        if let Some(id) = receipt_id {
            self.minted_receipts.insert(id);
        }
        Ok(())
    }

    /// Apply every transaction of a block in sealed order.
    /// The first failure aborts; callers stage on a clone so a failed
    /// block never half-applies (the ledger store relies on this).
    pub fn apply_block(&mut self, block: &Block, chain_id: u64) -> Result<(), ApplyError> {
        for tx in &block.transactions {
            self.apply_transaction(tx, chain_id)?;
        }
        Ok(())
    }
}
