// ========================================
// CROSS-SITE SYNC E2E TESTS FOR AITBC
// ========================================
//
// Test Scenarios:
// 1. Site A catches up to site B within poll cycles (S5)
// 2. Untrusted proposer rejected over HTTP (S6)
// 3. MAX_REORG_DEPTH bounds each poll cycle
// 4. Import boundary rules (genesis parent, equal timestamps)
//
// Usage:
//   cargo test --test cross_site_e2e -- --test-threads=1 --nocapture
//
// ========================================

use std::sync::{Arc, Mutex};

use aitbc_core::{genesis_block, Block, Transaction, TxPayload};
use aitbc_node::config::NodeConfig;
use aitbc_node::db::LedgerDb;
use aitbc_node::mempool::{MemoryBackend, Mempool};
use aitbc_node::metrics::NodeMetrics;
use aitbc_node::proposer::propose_once;
use aitbc_node::rate_limiter::RateLimiter;
use aitbc_node::rpc::{bind_ephemeral, RpcContext};
use aitbc_node::sync::{poll_peer_once, ImportError, SyncState};
use aitbc_node::{genesis, safe_lock};
use aitbc_receipt::{generate_keypair, sign_payload, ReceiptEnvelope, ReceiptPayload};

const CHAIN_ID: u64 = 2;

struct Site {
    _dir: tempfile::TempDir,
    cfg: Arc<NodeConfig>,
    db: Arc<LedgerDb>,
    mempool: Arc<Mutex<Mempool>>,
    metrics: Arc<NodeMetrics>,
    sync_state: Arc<SyncState>,
    base_url: String,
}

fn spawn_site(proposer_id: &str, trusted: &[&str]) -> Site {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = NodeConfig::for_tests(CHAIN_ID, dir.path().to_str().unwrap());
    cfg.proposer_id = proposer_id.to_string();
    cfg.trusted_proposers = trusted.iter().map(|s| s.to_string()).collect();
    let cfg = Arc::new(cfg);

    let db = Arc::new(LedgerDb::open(dir.path(), CHAIN_ID).unwrap());
    genesis::ensure_genesis(&db).unwrap();
    let mempool = Arc::new(Mutex::new(
        Mempool::new(
            CHAIN_ID,
            cfg.min_fee,
            cfg.mempool_max_size,
            cfg.max_block_size_bytes,
            Box::new(MemoryBackend),
        )
        .unwrap(),
    ));
    let metrics = NodeMetrics::new().unwrap();
    let sync_state = SyncState::new();
    let ctx = RpcContext {
        cfg: cfg.clone(),
        db: db.clone(),
        mempool: mempool.clone(),
        metrics: metrics.clone(),
        sync_state: sync_state.clone(),
    };
    let (addr, server) = bind_ephemeral(ctx, RateLimiter::new(1000, None));
    tokio::spawn(server);
    Site {
        _dir: dir,
        cfg,
        db,
        mempool,
        metrics,
        sync_state,
        base_url: format!("http://{}", addr),
    }
}

fn faucet_tx(recipient: &str, amount: u128, nonce: u64) -> Transaction {
    Transaction {
        sender: "faucet".to_string(),
        recipient: recipient.to_string(),
        amount,
        fee: 50,
        nonce,
        payload: TxPayload::Faucet {
            memo: String::new(),
        },
    }
}

fn receipt_tx(nonce: u64) -> (String, Transaction) {
    let miner = generate_keypair();
    let payload = ReceiptPayload {
        job_id: format!("job-{}", nonce),
        provider_id: "miner-1".to_string(),
        client_id: "client-1".to_string(),
        compute_units: 10,
        unit_type: "token".to_string(),
        unit_price: 7,
        model: "llama3.2".to_string(),
        started_at: 1_700_000_000,
        completed_at: 1_700_000_009,
        result_hash: "cd".repeat(32),
    };
    let envelope = ReceiptEnvelope {
        miner_signature: sign_payload(&payload, CHAIN_ID, "miner-1", &miner.secret_key).unwrap(),
        attestations: vec![],
        payload,
    };
    let receipt_id = envelope.receipt_id(CHAIN_ID);
    let tx = Transaction {
        sender: "coordinator".to_string(),
        recipient: "AITminer".to_string(),
        amount: 70,
        fee: 50,
        nonce,
        payload: TxPayload::ReceiptRecord { receipt: envelope },
    };
    (receipt_id, tx)
}

/// Grow a site's chain by sealing blocks locally
fn grow_site(site: &Site, blocks: usize, txs_per_block: Vec<Vec<Transaction>>) {
    for i in 0..blocks {
        if let Some(txs) = txs_per_block.get(i) {
            let mut pool = safe_lock(&site.mempool);
            for tx in txs {
                pool.admit(tx.clone()).unwrap();
            }
        }
        propose_once(&site.cfg, &site.db, &site.mempool).unwrap();
    }
}

// ========================================
// TEST 1: CROSS-SITE CATCH-UP (S5)
// ========================================
#[tokio::test]
async fn test_cross_site_catch_up() {
    println!("\n🧪 TEST 1: Site A catches up to site B");
    println!("================================================\n");

    let site_b = spawn_site("site-b", &[]);
    let (receipt_id, reward_tx) = receipt_tx(1);
    grow_site(
        &site_b,
        5,
        vec![
            vec![faucet_tx("alice", 1_000, 1)],
            vec![],
            vec![reward_tx],
            vec![],
            vec![],
        ],
    );
    assert_eq!(site_b.db.head().unwrap().height, 5);

    // Site A trusts site B and polls it once
    let site_a = spawn_site("site-a", &["site-b"]);
    let client = reqwest::Client::new();
    poll_peer_once(
        &site_a.cfg,
        &site_a.db,
        &site_a.metrics,
        &site_a.sync_state,
        &client,
        &site_b.base_url,
    )
    .await;

    // One cycle: A imported all five blocks
    assert_eq!(site_a.db.head().unwrap().height, 5);
    assert_eq!(
        site_a.db.head().unwrap().hash,
        site_b.db.head().unwrap().hash
    );
    // Transactions, balances, and receipts materialized on import
    assert_eq!(site_a.db.account("alice").unwrap().balance, 1_000);
    let stored = site_a.db.get_receipt(&receipt_id).unwrap().unwrap();
    assert_eq!(stored.block_height, 3);
    assert_eq!(site_a.db.account("AITminer").unwrap().balance, 70);
    assert!(!site_a.sync_state.catching_up());

    // A second poll is a no-op (peers equal)
    poll_peer_once(
        &site_a.cfg,
        &site_a.db,
        &site_a.metrics,
        &site_a.sync_state,
        &client,
        &site_b.base_url,
    )
    .await;
    assert_eq!(site_a.db.head().unwrap().height, 5);
    println!("✅ Site A fully caught up to site B in one poll cycle");
}

// ========================================
// TEST 2: UNTRUSTED PROPOSER OVER HTTP (S6)
// ========================================
#[tokio::test]
async fn test_untrusted_proposer_rejected_over_http() {
    println!("\n🧪 TEST 2: Untrusted importBlock is 403");
    println!("================================================\n");

    let site_a = spawn_site("site-a", &["site-b"]);
    let head = site_a.db.head().unwrap();

    let rogue = Block::build(
        CHAIN_ID,
        head.height + 1,
        head.hash.clone(),
        head.timestamp + 1,
        "site-evil".to_string(),
        vec![],
    );

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/rpc/blocks/import", site_a.base_url))
        .json(&rogue)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "UntrustedProposer");
    assert_eq!(site_a.db.head().unwrap().height, head.height);

    // A trusted proposer's block on the same endpoint is accepted
    let trusted = Block::build(
        CHAIN_ID,
        head.height + 1,
        head.hash,
        head.timestamp + 1,
        "site-b".to_string(),
        vec![],
    );
    let response = client
        .post(format!("{}/rpc/blocks/import", site_a.base_url))
        .json(&trusted)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(site_a.db.head().unwrap().height, head.height + 1);
    println!("✅ Provenance allowlist enforced at the import endpoint");
}

// ========================================
// TEST 3: MAX_REORG_DEPTH BOUNDS EACH CYCLE
// ========================================
#[tokio::test]
async fn test_reorg_depth_bounds_poll_cycle() {
    println!("\n🧪 TEST 3: MAX_REORG_DEPTH per poll cycle");
    println!("================================================\n");

    let site_b = spawn_site("site-b", &[]);
    grow_site(&site_b, 5, vec![]);

    let site_a = spawn_site("site-a", &["site-b"]);
    // The poller sees a tighter reorg bound than the serving config
    let mut poll_cfg = (*site_a.cfg).clone();
    poll_cfg.max_reorg_depth = 2;
    let client = reqwest::Client::new();

    let mut heights = Vec::new();
    for _ in 0..3 {
        poll_peer_once(
            &poll_cfg,
            &site_a.db,
            &site_a.metrics,
            &site_a.sync_state,
            &client,
            &site_b.base_url,
        )
        .await;
        heights.push(site_a.db.head().unwrap().height);
    }
    // 2 heights per cycle: 2 → 4 → 5
    assert_eq!(heights, vec![2, 4, 5]);
    println!("✅ Sequential bounded import: {:?}", heights);
}

// ========================================
// TEST 4: IMPORT BOUNDARY RULES
// ========================================
#[tokio::test]
async fn test_import_boundary_rules() {
    println!("\n🧪 TEST 4: Import boundary rules");
    println!("================================================\n");

    let site_a = spawn_site("site-a", &["site-b"]);
    let genesis_hash = genesis_block(CHAIN_ID).header.hash;
    let head = site_a.db.head().unwrap();
    assert_eq!(head.hash, genesis_hash);

    // Height 1 must name the genesis hash exactly
    let wrong_parent = Block::build(
        CHAIN_ID,
        1,
        "ee".repeat(32),
        head.timestamp + 1,
        "site-b".to_string(),
        vec![],
    );
    let err = aitbc_node::sync::handle_import(
        &site_a.cfg,
        &site_a.db,
        &site_a.metrics,
        &wrong_parent,
    )
    .unwrap_err();
    assert!(matches!(err, ImportError::InvalidParent(_)));

    // Timestamp equal to the parent's is refused
    let equal_ts = Block::build(
        CHAIN_ID,
        1,
        genesis_hash.clone(),
        head.timestamp,
        "site-b".to_string(),
        vec![],
    );
    let err =
        aitbc_node::sync::handle_import(&site_a.cfg, &site_a.db, &site_a.metrics, &equal_ts)
            .unwrap_err();
    assert!(matches!(err, ImportError::Validation(_)));

    // The correct block at height 1 goes through
    let good = Block::build(
        CHAIN_ID,
        1,
        genesis_hash,
        head.timestamp + 1,
        "site-b".to_string(),
        vec![],
    );
    aitbc_node::sync::handle_import(&site_a.cfg, &site_a.db, &site_a.metrics, &good).unwrap();
    assert_eq!(site_a.db.head().unwrap().height, 1);
    println!("✅ Genesis-parent and timestamp boundaries enforced");
}
