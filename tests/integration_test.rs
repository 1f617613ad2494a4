// ========================================
// INTEGRATION TESTS FOR AITBC
// ========================================
//
// Test Scenarios:
// 1. Happy-path job completion (coordinator + chain node end-to-end)
// 2. Duplicate receipt resubmission
// 3. Fee-too-low rejection at the RPC boundary
// 4. Circuit breaker trip/recovery timeline
// 5. Job timeout sweeps (assign + execute)
// 6. Miner failure report
//
// Usage:
//   cargo test --test integration_test -- --test-threads=1 --nocapture
//
// ========================================

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aitbc_coordinator::chain::ChainClient;
use aitbc_coordinator::config::CoordinatorConfig;
use aitbc_coordinator::jobs::{JobState, JobStore, JobSubmission};
use aitbc_coordinator::matcher::assignment_tick;
use aitbc_coordinator::metrics::CoordMetrics;
use aitbc_coordinator::miners::{MinerRegistration, MinerRegistry};
use aitbc_coordinator::pipeline::{ReceiptPipeline, ResultSubmission};
use aitbc_coordinator::store::CoordinatorDb;
use aitbc_coordinator::sweeps::timeout_sweep;
use aitbc_coordinator::CoordinatorCtx;
use aitbc_node::breaker::{CircuitBreaker, TickOutcome};
use aitbc_node::config::NodeConfig;
use aitbc_node::db::LedgerDb;
use aitbc_node::mempool::{MemoryBackend, Mempool};
use aitbc_node::metrics::NodeMetrics;
use aitbc_node::proposer::propose_once;
use aitbc_node::rate_limiter::RateLimiter;
use aitbc_node::rpc::{bind_ephemeral, RpcContext};
use aitbc_node::sync::SyncState;
use aitbc_node::{genesis, safe_lock};
use aitbc_receipt::{generate_keypair, sign_payload, KeyPair, ReceiptEnvelope, ReceiptPayload};

const CHAIN_ID: u64 = 2;

struct TestNode {
    _dir: tempfile::TempDir,
    cfg: Arc<NodeConfig>,
    db: Arc<LedgerDb>,
    mempool: Arc<Mutex<Mempool>>,
    metrics: Arc<NodeMetrics>,
    base_url: String,
}

/// Spin up a full in-process chain node with its RPC bound to an
/// ephemeral port.
fn spawn_node() -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Arc::new(NodeConfig::for_tests(CHAIN_ID, dir.path().to_str().unwrap()));
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
    let ctx = RpcContext {
        cfg: cfg.clone(),
        db: db.clone(),
        mempool: mempool.clone(),
        metrics: metrics.clone(),
        sync_state: SyncState::new(),
    };
    let (addr, server) = bind_ephemeral(ctx, RateLimiter::new(1000, None));
    tokio::spawn(server);
    TestNode {
        _dir: dir,
        cfg,
        db,
        mempool,
        metrics,
        base_url: format!("http://{}", addr),
    }
}

struct TestCoordinator {
    _dir: tempfile::TempDir,
    ctx: CoordinatorCtx,
}

fn spawn_coordinator(chain_url: Option<String>) -> TestCoordinator {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = CoordinatorConfig::for_tests(CHAIN_ID, dir.path().to_str().unwrap());
    cfg.chain_rpc_url = chain_url.clone();
    cfg.attestation_key = Some(generate_keypair());
    let cfg = Arc::new(cfg);

    let db = Arc::new(CoordinatorDb::open(dir.path()).unwrap());
    let jobs = Arc::new(JobStore::load(db.clone()).unwrap());
    let miners = Arc::new(MinerRegistry::load(db.clone()).unwrap());
    let chain = Arc::new(ChainClient::new(chain_url).unwrap());
    let metrics = CoordMetrics::new().unwrap();
    let pipeline = Arc::new(ReceiptPipeline::new(
        cfg.clone(),
        db.clone(),
        jobs.clone(),
        miners.clone(),
        chain.clone(),
        metrics.clone(),
    ));
    TestCoordinator {
        _dir: dir,
        ctx: CoordinatorCtx {
            cfg,
            db,
            jobs,
            miners,
            chain,
            pipeline,
            metrics,
        },
    }
}

fn register_miner(ctx: &CoordinatorCtx, id: &str, models: &[&str]) -> KeyPair {
    let keypair = generate_keypair();
    ctx.miners
        .register(MinerRegistration {
            miner_id: id.to_string(),
            public_key_hex: keypair.public_key_hex(),
            models: models.iter().map(|s| s.to_string()).collect(),
            gpu_class: "a100".to_string(),
            max_concurrent_jobs: 1,
        })
        .unwrap();
    keypair
}

fn submit_job(ctx: &CoordinatorCtx, model: &str) -> String {
    ctx.jobs
        .submit(JobSubmission {
            client_id: "client-1".to_string(),
            model: model.to_string(),
            prompt: "hello".to_string(),
            params: serde_json::Value::Null,
            requirements: vec![],
            priority: 0,
            t_assign_secs: None,
            t_execute_secs: None,
        })
        .unwrap()
        .id
}

fn signed_receipt(
    job_id: &str,
    miner_id: &str,
    miner_key: &KeyPair,
    model: &str,
) -> ReceiptEnvelope {
    let payload = ReceiptPayload {
        job_id: job_id.to_string(),
        provider_id: miner_id.to_string(),
        client_id: "client-1".to_string(),
        compute_units: 100,
        unit_type: "token".to_string(),
        unit_price: 5,
        model: model.to_string(),
        started_at: 1_700_000_000,
        completed_at: 1_700_000_030,
        result_hash: "ab".repeat(32),
    };
    ReceiptEnvelope {
        miner_signature: sign_payload(&payload, CHAIN_ID, miner_id, &miner_key.secret_key)
            .unwrap(),
        attestations: vec![],
        payload,
    }
}

// ========================================
// TEST 1: HAPPY PATH JOB COMPLETION (S1)
// ========================================
#[tokio::test]
async fn test_happy_path_job_completion() {
    println!("\n🧪 TEST 1: Happy-path job completion");
    println!("================================================\n");

    let node = spawn_node();
    let coordinator = spawn_coordinator(Some(node.base_url.clone()));
    let ctx = &coordinator.ctx;

    // One miner with the capability the job needs
    let miner_key = register_miner(ctx, "miner-1", &["llama3.2"]);
    let head_before = node.db.head().unwrap().height;

    // Client submits a job; the matcher assigns it
    let job_id = submit_job(ctx, "llama3.2");
    assert_eq!(ctx.jobs.get(&job_id).unwrap().state, JobState::Queued);
    assert_eq!(assignment_tick(&ctx.jobs, &ctx.miners), 1);
    assert_eq!(ctx.jobs.get(&job_id).unwrap().state, JobState::Assigned);

    // Miner heartbeat reports the job started
    ctx.jobs
        .transition(&job_id, JobState::Running, "miner started", |j| {
            j.started_at = Some(aitbc_coordinator::now_secs());
        })
        .unwrap();

    // Miner returns a signed receipt
    let envelope = signed_receipt(&job_id, "miner-1", &miner_key, "llama3.2");
    let expected_payload = envelope.payload.clone();
    let accepted = ctx
        .pipeline
        .submit_result(
            &job_id,
            ResultSubmission {
                output: Some("hi there".to_string()),
                receipt: Some(envelope),
                error: None,
            },
        )
        .await
        .unwrap();
    assert!(accepted.attested);
    assert!(!accepted.chain_parked);

    // QUEUED→ASSIGNED→RUNNING→COMPLETED, receipt recorded
    let job = ctx.jobs.get(&job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.receipt_id.as_deref(), Some(accepted.receipt_id.as_str()));
    assert_eq!(ctx.db.receipts_for_job(&job_id).unwrap().len(), 1);

    // Miner released and credited
    let miner = ctx.miners.get("miner-1").unwrap();
    assert_eq!(miner.completed, 1);
    assert_eq!(miner.current_jobs, 0);
    assert_eq!(miner.score, 100);

    // The reward tx reached the node's mempool; sealing advances the head
    assert_eq!(safe_lock(&node.mempool).size(), 1);
    let block = propose_once(&node.cfg, &node.db, &node.mempool).unwrap();
    assert_eq!(block.header.height, head_before + 1);
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(
        block.transactions[0].receipt_id(CHAIN_ID).as_deref(),
        Some(accepted.receipt_id.as_str())
    );

    // The receipt row on the chain matches the submitted payload
    let stored = node.db.get_receipt(&accepted.receipt_id).unwrap().unwrap();
    assert_eq!(stored.envelope.payload, expected_payload);
    // The coordinator attestation rode along
    assert_eq!(stored.envelope.attestations.len(), 1);

    // Miner's chain account was minted units * unit_price
    let miner_balance = node.db.account(&miner.address).unwrap().balance;
    assert_eq!(miner_balance, 500);
    println!("✅ Happy path complete: head {} → {}", head_before, block.header.height);
}

// ========================================
// TEST 2: DUPLICATE RECEIPT (S2)
// ========================================
#[tokio::test]
async fn test_duplicate_receipt_rejected() {
    println!("\n🧪 TEST 2: Duplicate receipt");
    println!("================================================\n");

    let node = spawn_node();
    let coordinator = spawn_coordinator(Some(node.base_url.clone()));
    let ctx = &coordinator.ctx;

    let miner_key = register_miner(ctx, "miner-1", &["llama3.2"]);
    let job_id = submit_job(ctx, "llama3.2");
    assignment_tick(&ctx.jobs, &ctx.miners);
    ctx.jobs
        .transition(&job_id, JobState::Running, "started", |_| {})
        .unwrap();

    let envelope = signed_receipt(&job_id, "miner-1", &miner_key, "llama3.2");
    ctx.pipeline
        .submit_result(
            &job_id,
            ResultSubmission {
                output: None,
                receipt: Some(envelope.clone()),
                error: None,
            },
        )
        .await
        .unwrap();
    let mempool_after_first = safe_lock(&node.mempool).size();

    // Same signed receipt again
    let err = ctx
        .pipeline
        .submit_result(
            &job_id,
            ResultSubmission {
                output: None,
                receipt: Some(envelope),
                error: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.taxonomy(), "Duplicate");

    // Job still COMPLETED once; exactly one receipt; no new ledger tx
    assert_eq!(ctx.jobs.get(&job_id).unwrap().state, JobState::Completed);
    assert_eq!(ctx.db.receipts_for_job(&job_id).unwrap().len(), 1);
    assert_eq!(safe_lock(&node.mempool).size(), mempool_after_first);
    assert_eq!(ctx.miners.get("miner-1").unwrap().completed, 1);
    println!("✅ Duplicate receipt correctly refused");
}

// ========================================
// TEST 3: FEE-TOO-LOW REJECTION (S3)
// ========================================
#[tokio::test]
async fn test_fee_too_low_rejection() {
    println!("\n🧪 TEST 3: Fee-too-low rejection over HTTP");
    println!("================================================\n");

    let node = spawn_node();
    let client = reqwest::Client::new();

    // MIN_FEE defaults to 10; submit fee = 5
    let tx = serde_json::json!({
        "sender": "faucet",
        "recipient": "alice",
        "amount": 100,
        "fee": 5,
        "nonce": 1,
        "payload": {"type": "faucet", "memo": ""},
    });
    let response = client
        .post(format!("{}/rpc/sendTx", node.base_url))
        .json(&tx)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "FeeTooLow");

    assert_eq!(safe_lock(&node.mempool).size(), 0);
    assert_eq!(node.metrics.rpc_send_tx_rejected_total.get(), 1);

    // Unknown payload discriminators are Validation, not silently accepted
    let weird = serde_json::json!({
        "sender": "faucet",
        "recipient": "alice",
        "amount": 100,
        "fee": 50,
        "nonce": 1,
        "payload": {"type": "self_destruct"},
    });
    let response = client
        .post(format!("{}/rpc/sendTx", node.base_url))
        .json(&weird)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Validation");
    println!("✅ Admission policy enforced at the RPC boundary");
}

// ========================================
// TEST 4: CIRCUIT BREAKER TIMELINE (S4)
// ========================================
#[tokio::test]
async fn test_circuit_breaker_timeline() {
    println!("\n🧪 TEST 4: Circuit breaker trip and recovery");
    println!("================================================\n");

    // A ledger with NO genesis makes every proposer tick fail — the same
    // failure class as a broken ledger store.
    let dir = tempfile::tempdir().unwrap();
    let cfg = NodeConfig::for_tests(CHAIN_ID, dir.path().to_str().unwrap());
    let db = LedgerDb::open(dir.path(), CHAIN_ID).unwrap();
    let mempool = Mutex::new(
        Mempool::new(
            CHAIN_ID,
            cfg.min_fee,
            cfg.mempool_max_size,
            cfg.max_block_size_bytes,
            Box::new(MemoryBackend),
        )
        .unwrap(),
    );

    let mut breaker = CircuitBreaker::new(3, Duration::from_millis(50));

    // Ticks 1..3 fail; the third trips the breaker
    for _ in 0..3 {
        let outcome = breaker.guard(|| propose_once(&cfg, &db, &mempool));
        assert!(matches!(outcome, TickOutcome::Executed(Err(_))));
    }
    assert_eq!(breaker.state_gauge(), 1);
    assert_eq!(breaker.trips, 1);

    // While OPEN, ticks are skipped and counted
    for _ in 0..2 {
        assert!(matches!(
            breaker.guard(|| propose_once(&cfg, &db, &mempool)),
            TickOutcome::Skipped
        ));
    }
    assert_eq!(breaker.skipped, 2);

    // Repair the ledger, wait out the cooldown — the half-open probe
    // succeeds and the breaker closes
    genesis::ensure_genesis(&db).unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    let outcome = breaker.guard(|| propose_once(&cfg, &db, &mempool));
    assert!(matches!(outcome, TickOutcome::Executed(Ok(_))));
    assert_eq!(breaker.state_gauge(), 0);
    assert_eq!(breaker.trips, 1);
    assert_eq!(db.head().unwrap().height, 1);
    println!("✅ Breaker: CLOSED → OPEN (3 failures) → HALF_OPEN → CLOSED");
}

// ========================================
// TEST 5: TIMEOUT SWEEPS
// ========================================
#[tokio::test]
async fn test_timeout_sweeps() {
    println!("\n🧪 TEST 5: Assign/execute timeout sweeps");
    println!("================================================\n");

    let coordinator = spawn_coordinator(None);
    let ctx = &coordinator.ctx;
    register_miner(ctx, "miner-1", &["llama3.2"]);

    // T_assign: assigned long ago, never started → back to QUEUED
    let stalled = submit_job(ctx, "llama3.2");
    assignment_tick(&ctx.jobs, &ctx.miners);
    ctx.jobs
        .transition(&stalled, JobState::Queued, "test rewind", |j| {
            j.miner_id = None;
        })
        .unwrap();
    ctx.jobs
        .transition(&stalled, JobState::Assigned, "re-assign stale", |j| {
            j.miner_id = Some("miner-1".to_string());
            j.assigned_at = Some(aitbc_coordinator::now_secs() - 10_000);
        })
        .unwrap();

    let report = timeout_sweep(ctx);
    assert_eq!(report.reverted_to_queue, 1);
    assert_eq!(ctx.jobs.get(&stalled).unwrap().state, JobState::Queued);
    assert_eq!(ctx.miners.get("miner-1").unwrap().suspect_count, 1);

    // T_execute: running past the deadline → FAILED, miner penalized
    let doomed = submit_job(ctx, "llama3.2");
    assignment_tick(&ctx.jobs, &ctx.miners);
    // The sweep above re-queued `stalled`; make sure we operate on `doomed`
    let doomed_job = ctx.jobs.get(&doomed).unwrap();
    if doomed_job.state == JobState::Queued {
        // stalled got the slot first — give doomed its own assignment
        ctx.jobs
            .transition(&doomed, JobState::Assigned, "test assign", |j| {
                j.miner_id = Some("miner-1".to_string());
                j.assigned_at = Some(aitbc_coordinator::now_secs());
            })
            .unwrap();
    }
    ctx.jobs
        .transition(&doomed, JobState::Running, "test start", |j| {
            j.started_at = Some(aitbc_coordinator::now_secs() - 100_000);
        })
        .unwrap();

    let report = timeout_sweep(ctx);
    assert_eq!(report.failed_on_timeout, 1);
    let failed = ctx.jobs.get(&doomed).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.failure.as_deref().unwrap().contains("JobTimeout"));
    assert!(ctx.miners.get("miner-1").unwrap().failed >= 1);
    println!("✅ Both timeout classes enforced");
}

// ========================================
// TEST 6: MINER FAILURE REPORT
// ========================================
#[tokio::test]
async fn test_miner_failure_report() {
    println!("\n🧪 TEST 6: Miner failure report");
    println!("================================================\n");

    let coordinator = spawn_coordinator(None);
    let ctx = &coordinator.ctx;
    let miner_key = register_miner(ctx, "miner-1", &["llama3.2"]);
    let job_id = submit_job(ctx, "llama3.2");
    assignment_tick(&ctx.jobs, &ctx.miners);

    ctx.pipeline.report_failure(&job_id, "CUDA out of memory").unwrap();

    let job = ctx.jobs.get(&job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure.as_deref().unwrap().contains("CUDA out of memory"));

    let miner = ctx.miners.get("miner-1").unwrap();
    assert_eq!(miner.failed, 1);
    assert_eq!(miner.current_jobs, 0);
    assert_eq!(miner.score, 0);

    // A receipt arriving after the failure is refused — FAILED is terminal
    let envelope = signed_receipt(&job_id, "miner-1", &miner_key, "llama3.2");
    let err = ctx
        .pipeline
        .submit_result(
            &job_id,
            ResultSubmission {
                output: None,
                receipt: Some(envelope),
                error: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.taxonomy(), "Conflict");
    println!("✅ Failure report handled; terminal state enforced");
}
