// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - CHAIN CLIENT
//
// Submits coordinator reward transactions to the blockchain node's RPC.
// A Duplicate response is success (the receipt was already minted).
// Transient failures park the reward for the background retry task —
// chain-side receipt uniqueness makes redelivery safe.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_core::{Transaction, TxPayload};
use aitbc_receipt::ReceiptEnvelope;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::CoordinatorConfig;
use crate::metrics::CoordMetrics;
use crate::now_secs;
use crate::store::{CoordinatorDb, PendingReward};

const CHAIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ChainError {
    /// The chain already has this tx/receipt — success for our purposes
    Duplicate,
    /// Permanent rejection (validation, untrusted) — do not retry
    Rejected(String),
    /// Network/mempool trouble — retry later
    Transient(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChainError::Duplicate => write!(f, "Duplicate"),
            ChainError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            ChainError::Transient(msg) => write!(f, "Transient: {}", msg),
        }
    }
}

#[derive(Deserialize)]
struct SendTxResponse {
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

/// Build the reward transaction for a validated receipt. The nonce is
/// drawn fresh from the store on every build, so a parked reward can be
/// safely rebuilt at retry time (the chain allows nonce gaps).
pub fn build_reward_tx(
    cfg: &CoordinatorConfig,
    db: &CoordinatorDb,
    recipient: &str,
    amount: u128,
    envelope: ReceiptEnvelope,
) -> Result<Transaction, String> {
    Ok(Transaction {
        sender: cfg.chain_sender_address(),
        recipient: recipient.to_string(),
        amount,
        fee: cfg.chain_tx_fee,
        nonce: db.next_nonce()?,
        payload: TxPayload::ReceiptRecord { receipt: envelope },
    })
}

pub struct ChainClient {
    base_url: Option<String>,
    http: reqwest::Client,
}

impl ChainClient {
    pub fn new(base_url: Option<String>) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(CHAIN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to build chain http client: {}", e))?;
        Ok(ChainClient { base_url, http })
    }

    pub fn enabled(&self) -> bool {
        self.base_url.is_some()
    }

    /// Submit a transaction. Ok(None) means no chain is configured.
    pub async fn submit_tx(&self, tx: &Transaction) -> Result<Option<String>, ChainError> {
        let base = match &self.base_url {
            Some(url) => url,
            None => return Ok(None),
        };

        let response = self
            .http
            .post(format!("{}/rpc/sendTx", base))
            .json(tx)
            .send()
            .await
            .map_err(|e| ChainError::Transient(format!("sendTx request failed: {}", e)))?;

        let status = response.status();
        let body: SendTxResponse = response.json().await.unwrap_or(SendTxResponse {
            tx_hash: None,
            error: None,
            msg: None,
        });

        if status.is_success() {
            return Ok(body.tx_hash.or(Some(String::new())));
        }
        let detail = format!(
            "{} {}: {}",
            status,
            body.error.unwrap_or_default(),
            body.msg.unwrap_or_default()
        );
        match status.as_u16() {
            409 => Err(ChainError::Duplicate),
            400 | 403 => Err(ChainError::Rejected(detail)),
            _ => Err(ChainError::Transient(detail)),
        }
    }
}

/// Background task: retry parked reward transactions until the chain
/// accepts (or permanently rejects) them.
pub async fn run_chain_retry(
    cfg: Arc<CoordinatorConfig>,
    db: Arc<CoordinatorDb>,
    chain: Arc<ChainClient>,
    metrics: Arc<CoordMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !chain.enabled() {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.chain_retry_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let pending = match db.pending_rewards() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("⚠️  Chain retry: cannot read queue: {}", e);
                continue;
            }
        };
        for reward in pending {
            let tx = match build_reward_tx(
                &cfg,
                &db,
                &reward.recipient,
                reward.amount,
                reward.envelope.clone(),
            ) {
                Ok(tx) => tx,
                Err(e) => {
                    eprintln!("⚠️  Chain retry: rebuild failed for {}: {}", reward.receipt_id, e);
                    continue;
                }
            };
            match chain.submit_tx(&tx).await {
                Ok(_) | Err(ChainError::Duplicate) => {
                    if let Err(e) = db.unpark_reward(&reward.receipt_id) {
                        eprintln!("⚠️  Chain retry: unpark failed: {}", e);
                    } else {
                        metrics.chain_tx_submitted_total.inc();
                        println!("🔂 Reward for receipt {} reached the chain", reward.receipt_id);
                    }
                }
                Err(ChainError::Rejected(msg)) => {
                    // Permanent — drop from the queue and page the operator
                    eprintln!(
                        "🚨 Reward tx for receipt {} permanently rejected: {} — dropping from retry queue",
                        reward.receipt_id, msg
                    );
                    let _ = db.unpark_reward(&reward.receipt_id);
                }
                Err(ChainError::Transient(msg)) => {
                    eprintln!(
                        "⚠️  Reward tx for receipt {} still failing ({}) — will retry",
                        reward.receipt_id, msg
                    );
                }
            }
        }
        metrics
            .chain_tx_retry_queue
            .set(db.pending_count().unwrap_or(0) as i64);
    }
}

/// Park a reward for the retry task
pub fn park(db: &CoordinatorDb, receipt_id: &str, recipient: &str, amount: u128, envelope: ReceiptEnvelope) -> Result<(), String> {
    db.park_reward(&PendingReward {
        receipt_id: receipt_id.to_string(),
        recipient: recipient.to_string(),
        amount,
        envelope,
        parked_at: now_secs(),
    })
}
