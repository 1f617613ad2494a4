// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - CROSS-SITE SYNC
//
// Poll-driven reconciliation between independent sites. One supervised
// task per peer — a slow or failing peer never stalls the others. Blocks
// are imported strictly sequentially, bounded by MAX_REORG_DEPTH per
// cycle. Local history is never rewritten: a conflicting block at an
// existing height is refused and an operator alert is raised.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_core::Block;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::NodeConfig;
use crate::db::{AppendError, LedgerDb};
use crate::metrics::NodeMetrics;
use crate::{now_secs, safe_lock};

/// Bounded timeout for every outgoing cross-site HTTP call
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    Accepted,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportError {
    /// Block proposer is not in TRUSTED_PROPOSERS
    UntrustedProposer(String),
    /// Height gap or parent-hash mismatch against the local head
    InvalidParent(String),
    /// Recomputed block hash / tx root disagrees with the claimed one
    InvalidHash(String),
    /// Conflicts with committed state (fork at height, dup tx/receipt,
    /// balance or nonce violation)
    Conflict(String),
    /// Malformed block (bad timestamp, bad payload)
    Validation(String),
    /// Local storage failure
    Storage(String),
}

impl ImportError {
    pub fn taxonomy(&self) -> &'static str {
        match self {
            ImportError::UntrustedProposer(_) => "UntrustedProposer",
            ImportError::InvalidParent(_) => "InvalidParent",
            ImportError::InvalidHash(_) => "InvalidHash",
            ImportError::Conflict(_) => "Conflict",
            ImportError::Validation(_) => "Validation",
            ImportError::Storage(_) => "InternalError",
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            ImportError::UntrustedProposer(_) => "untrusted_proposer",
            ImportError::InvalidParent(_) => "invalid_parent",
            ImportError::InvalidHash(_) => "invalid_hash",
            ImportError::Conflict(_) => "conflict",
            ImportError::Validation(_) => "validation",
            ImportError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ImportError::UntrustedProposer(m)
            | ImportError::InvalidParent(m)
            | ImportError::InvalidHash(m)
            | ImportError::Conflict(m)
            | ImportError::Validation(m)
            | ImportError::Storage(m) => write!(f, "{}: {}", self.taxonomy(), m),
        }
    }
}

/// Import a foreign block. Acceptance rules in order, short-circuiting:
/// (a) trusted proposer, (b) sequential height + matching parent,
/// (c) recomputed hashes, (d) tx/receipt uniqueness and balances,
/// (e) one atomic append. Shared by the RPC import endpoint and the
/// cross-site poller.
pub fn handle_import(
    cfg: &NodeConfig,
    db: &LedgerDb,
    metrics: &NodeMetrics,
    block: &Block,
) -> Result<ImportOutcome, ImportError> {
    let result = evaluate_import(cfg, db, block);
    let label = match &result {
        Ok(ImportOutcome::Accepted) => "accepted",
        Ok(ImportOutcome::AlreadyExists) => "already_exists",
        Err(e) => e.outcome_label(),
    };
    metrics
        .cross_site_imports_total
        .with_label_values(&[label])
        .inc();
    if let Ok(ImportOutcome::Accepted) = &result {
        if let Some(head) = db.head() {
            metrics.chain_head_height.set(head.height as i64);
        }
    }
    result
}

fn evaluate_import(
    cfg: &NodeConfig,
    db: &LedgerDb,
    block: &Block,
) -> Result<ImportOutcome, ImportError> {
    // (a) provenance: proposer must be allowlisted
    if !cfg.is_trusted_proposer(&block.header.proposer) {
        return Err(ImportError::UntrustedProposer(format!(
            "proposer {:?} not in trusted set",
            block.header.proposer
        )));
    }

    // (b) height position relative to the local head
    let head = db.head();
    if let Some(head) = &head {
        if block.header.height <= head.height {
            // Already have a block at this height — same hash is an
            // idempotent re-import, a different hash is a fork.
            let local = db
                .get_block_by_height(block.header.height)
                .map_err(ImportError::Storage)?;
            return match local {
                Some(local) if local.header.hash == block.header.hash => {
                    Ok(ImportOutcome::AlreadyExists)
                }
                Some(local) => {
                    // Operator alert: two trusted proposers sealed
                    // incompatible blocks. Resolution is out-of-band —
                    // local history is never rewritten.
                    eprintln!(
                        "🚨 ConflictAtHeight {}: local {} vs foreign {} (proposer {}) — manual resolution required",
                        block.header.height,
                        local.header.hash,
                        block.header.hash,
                        block.header.proposer
                    );
                    Err(ImportError::Conflict(format!(
                        "ConflictAtHeight {}: local {} foreign {}",
                        block.header.height, local.header.hash, block.header.hash
                    )))
                }
                None => Err(ImportError::Storage(format!(
                    "missing local block at height {}",
                    block.header.height
                ))),
            };
        }
        if block.header.height > head.height + 1 {
            // Gaps are rejected to force sequential import
            return Err(ImportError::InvalidParent(format!(
                "gap: block height {} but local head is {}",
                block.header.height, head.height
            )));
        }
    }

    // (b cont.) parent linkage, (c) hash integrity, (d) uniqueness and
    // balances, (e) atomic commit — all enforced inside append_block.
    match db.append_block(block) {
        Ok(_) => Ok(ImportOutcome::Accepted),
        Err(AppendError::InvalidParent(m)) => Err(ImportError::InvalidParent(m)),
        Err(AppendError::InvalidHash(m)) => Err(ImportError::InvalidHash(m)),
        Err(AppendError::InvalidTimestamp(m)) => Err(ImportError::Validation(m)),
        Err(AppendError::Conflict(m)) => Err(ImportError::Conflict(m)),
        Err(AppendError::Storage(m)) => Err(ImportError::Storage(m)),
    }
}

// ─────────────────────────────────────────────────────────────────
// PEER POLLING
// ─────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerStatus {
    pub endpoint: String,
    pub height: u64,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub last_poll_at: u64,
}

/// Shared view of sync progress, surfaced by /rpc/syncStatus
pub struct SyncState {
    catching_up: AtomicBool,
    peers: Mutex<HashMap<String, PeerStatus>>,
}

impl SyncState {
    pub fn new() -> Arc<Self> {
        Arc::new(SyncState {
            catching_up: AtomicBool::new(false),
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn catching_up(&self) -> bool {
        self.catching_up.load(Ordering::Relaxed)
    }

    pub fn set_catching_up(&self, value: bool) {
        self.catching_up.store(value, Ordering::Relaxed);
    }

    pub fn record_peer(&self, status: PeerStatus) {
        safe_lock(&self.peers).insert(status.endpoint.clone(), status);
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        let mut list: Vec<PeerStatus> = safe_lock(&self.peers).values().cloned().collect();
        list.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        list
    }
}

#[derive(Deserialize)]
struct PeerHead {
    height: u64,
    #[allow(dead_code)]
    hash: String,
}

/// Spawn one supervised polling task per configured peer.
pub fn run_sync(
    cfg: Arc<NodeConfig>,
    db: Arc<LedgerDb>,
    metrics: Arc<NodeMetrics>,
    sync_state: Arc<SyncState>,
    shutdown: watch::Receiver<bool>,
) {
    for endpoint in cfg.remote_endpoints.clone() {
        let cfg = cfg.clone();
        let db = db.clone();
        let metrics = metrics.clone();
        let sync_state = sync_state.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let client = match reqwest::Client::builder()
                .timeout(PEER_REQUEST_TIMEOUT)
                .build()
            {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("⚠️  Sync task for {} failed to start: {}", endpoint, e);
                    return;
                }
            };
            let mut interval =
                tokio::time::interval(Duration::from_secs(cfg.poll_interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            println!("🔁 Cross-site sync: polling {} every {}s", endpoint, cfg.poll_interval_secs);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                poll_peer_once(&cfg, &db, &metrics, &sync_state, &client, &endpoint).await;
            }
        });
    }
}

/// One poll cycle against one peer: fetch its head, then pull and import
/// any blocks above the local head (bounded). Errors are recorded and
/// retried next cycle — never propagated to local clients.
pub async fn poll_peer_once(
    cfg: &NodeConfig,
    db: &LedgerDb,
    metrics: &NodeMetrics,
    sync_state: &SyncState,
    client: &reqwest::Client,
    endpoint: &str,
) {
    let mut status = PeerStatus {
        endpoint: endpoint.to_string(),
        height: 0,
        healthy: false,
        last_error: None,
        last_poll_at: now_secs(),
    };

    let peer_head: PeerHead = match client
        .get(format!("{}/rpc/head", endpoint))
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(resp) => match resp.json().await {
            Ok(head) => head,
            Err(e) => {
                status.last_error = Some(format!("bad head body: {}", e));
                sync_state.record_peer(status);
                return;
            }
        },
        Err(e) => {
            status.last_error = Some(format!("head fetch failed: {}", e));
            sync_state.record_peer(status);
            return;
        }
    };
    status.height = peer_head.height;
    status.healthy = true;

    let local_height = db.head().map(|h| h.height).unwrap_or(0);
    if peer_head.height <= local_height {
        // Peer is at or behind us; nothing to pull this cycle.
        sync_state.record_peer(status);
        return;
    }

    sync_state.set_catching_up(true);
    let target = peer_head
        .height
        .min(local_height + cfg.max_reorg_depth.max(1));
    let mut imported = 0u64;

    for height in (local_height + 1)..=target {
        let block: Block = match client
            .get(format!("{}/rpc/blocks/{}", endpoint, height))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => match resp.json().await {
                Ok(b) => b,
                Err(e) => {
                    status.last_error = Some(format!("bad block body at {}: {}", height, e));
                    break;
                }
            },
            Err(e) => {
                // No intra-cycle retry; the next cycle starts over
                status.last_error = Some(format!("block fetch {} failed: {}", height, e));
                break;
            }
        };

        match handle_import(cfg, db, metrics, &block) {
            Ok(ImportOutcome::Accepted) | Ok(ImportOutcome::AlreadyExists) => imported += 1,
            Err(e) => {
                status.last_error = Some(format!("import at {} refused: {}", height, e));
                eprintln!("⚠️  Sync from {}: {}", endpoint, e);
                break;
            }
        }
    }

    if imported > 0 {
        println!(
            "🔁 Imported {} block(s) from {} (head now {})",
            imported,
            endpoint,
            db.head().map(|h| h.height).unwrap_or(0)
        );
    }
    let caught_up = db.head().map(|h| h.height).unwrap_or(0) >= peer_head.height;
    sync_state.set_catching_up(!caught_up);
    sync_state.record_peer(status);
}
