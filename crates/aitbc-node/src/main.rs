// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - BLOCKCHAIN NODE DAEMON
//
// Startup: config → ledger (flock singleton) → genesis → mempool →
// metrics → proposer task → cross-site sync tasks → RPC server.
// Shutdown (ctrl-c): stop proposer at a tick boundary, flush mempool
// backend and ledger, exit.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use aitbc_node::config::{MempoolBackendKind, NodeConfig};
use aitbc_node::db::LedgerDb;
use aitbc_node::mempool::{DurableBackend, MemoryBackend, Mempool, MempoolBackend};
use aitbc_node::metrics::NodeMetrics;
use aitbc_node::rate_limiter::RateLimiter;
use aitbc_node::rpc::{routes, RpcContext};
use aitbc_node::sync::SyncState;
use aitbc_node::{genesis, proposer, safe_lock, sync};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Arc::new(NodeConfig::from_env()?);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("⛓️  AITBC node starting");
    println!(
        "   chain_id={} proposer={} db={}",
        cfg.chain_id, cfg.proposer_id, cfg.db_path
    );
    println!(
        "   block_time={}s min_fee={} mempool={:?}/{} peers={}",
        cfg.block_time_secs,
        cfg.min_fee,
        cfg.mempool_backend,
        cfg.mempool_max_size,
        cfg.remote_endpoints.len()
    );
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Ledger store — the flock probe inside open() enforces one node
    // process (and therefore one proposer) per ledger.
    let db = Arc::new(LedgerDb::open(&cfg.db_path, cfg.chain_id)?);
    genesis::ensure_genesis(&db)?;

    let backend: Box<dyn MempoolBackend> = match cfg.mempool_backend {
        MempoolBackendKind::Memory => Box::new(MemoryBackend),
        MempoolBackendKind::Durable => {
            let mempool_db = sled::open(format!("{}_mempool", cfg.db_path))
                .map_err(|e| format!("Failed to open mempool journal: {}", e))?;
            Box::new(DurableBackend::open(&mempool_db)?)
        }
    };
    let mempool = Arc::new(Mutex::new(Mempool::new(
        cfg.chain_id,
        cfg.min_fee,
        cfg.mempool_max_size,
        cfg.max_block_size_bytes,
        backend,
    )?));

    let metrics = NodeMetrics::new()?;
    if let Some(head) = db.head() {
        metrics.chain_head_height.set(head.height as i64);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background task: the single PoA proposer loop
    let proposer_handle = tokio::spawn(proposer::run_proposer(
        cfg.clone(),
        db.clone(),
        mempool.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    // Background tasks: one supervised sync poller per peer
    let sync_state = SyncState::new();
    sync::run_sync(
        cfg.clone(),
        db.clone(),
        metrics.clone(),
        sync_state.clone(),
        shutdown_rx.clone(),
    );

    // RPC server
    let ctx = RpcContext {
        cfg: cfg.clone(),
        db: db.clone(),
        mempool: mempool.clone(),
        metrics: metrics.clone(),
        sync_state,
    };
    let limiter = RateLimiter::new(cfg.rate_limit_rps, Some(cfg.rate_limit_burst));
    let mut server_shutdown = shutdown_rx.clone();
    let (addr, server) = warp::serve(routes(ctx, limiter)).bind_with_graceful_shutdown(
        ([0, 0, 0, 0], cfg.rpc_port),
        async move {
            let _ = server_shutdown.changed().await;
        },
    );
    println!("🌐 RPC listening on http://{}", addr);
    let server_handle = tokio::spawn(server);

    // Graceful shutdown on ctrl-c
    tokio::signal::ctrl_c().await?;
    println!("\n🛑 Shutdown requested — stopping at tick boundary...");
    let _ = shutdown_tx.send(true);
    let _ = proposer_handle.await;
    let _ = server_handle.await;

    safe_lock(&mempool).flush()?;
    db.flush()?;
    println!("✅ Ledger and mempool flushed. Bye.");
    Ok(())
}
