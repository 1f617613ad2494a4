// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - COORDINATOR DAEMON
//
// Startup: config → store → job/miner registries → pipeline → matcher,
// sweep, and chain-retry tasks → HTTP API. Shutdown (ctrl-c): stop
// loops, let in-flight requests finish, flush the store.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::sync::Arc;
use tokio::sync::watch;

use aitbc_coordinator::chain::{run_chain_retry, ChainClient};
use aitbc_coordinator::config::CoordinatorConfig;
use aitbc_coordinator::jobs::JobStore;
use aitbc_coordinator::metrics::CoordMetrics;
use aitbc_coordinator::miners::MinerRegistry;
use aitbc_coordinator::pipeline::ReceiptPipeline;
use aitbc_coordinator::store::CoordinatorDb;
use aitbc_coordinator::sweeps::{run_match_loop, run_sweep_loop};
use aitbc_coordinator::{api, CoordinatorCtx};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Arc::new(CoordinatorConfig::from_env()?);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🗂️  AITBC coordinator starting");
    println!(
        "   id={} chain_id={} db={}",
        cfg.coordinator_id, cfg.chain_id, cfg.db_path
    );
    match &cfg.chain_rpc_url {
        Some(url) => println!("   chain node: {}", url),
        None => println!("   chain node: DISABLED (receipts stored locally only)"),
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db = Arc::new(CoordinatorDb::open(&cfg.db_path)?);
    let jobs = Arc::new(JobStore::load(db.clone())?);
    let miners = Arc::new(MinerRegistry::load(db.clone())?);
    let chain = Arc::new(ChainClient::new(cfg.chain_rpc_url.clone())?);
    let metrics = CoordMetrics::new()?;
    let pipeline = Arc::new(ReceiptPipeline::new(
        cfg.clone(),
        db.clone(),
        jobs.clone(),
        miners.clone(),
        chain.clone(),
        metrics.clone(),
    ));

    let ctx = CoordinatorCtx {
        cfg: cfg.clone(),
        db: db.clone(),
        jobs,
        miners,
        chain: chain.clone(),
        pipeline,
        metrics: metrics.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(run_match_loop(ctx.clone(), shutdown_rx.clone()));
    tokio::spawn(run_sweep_loop(ctx.clone(), shutdown_rx.clone()));
    tokio::spawn(run_chain_retry(
        cfg.clone(),
        db.clone(),
        chain,
        metrics,
        shutdown_rx.clone(),
    ));

    let mut server_shutdown = shutdown_rx.clone();
    let (addr, server) = warp::serve(api::routes(ctx)).bind_with_graceful_shutdown(
        ([0, 0, 0, 0], cfg.port),
        async move {
            let _ = server_shutdown.changed().await;
        },
    );
    println!("🌐 Coordinator API listening on http://{}", addr);
    let server_handle = tokio::spawn(server);

    tokio::signal::ctrl_c().await?;
    println!("\n🛑 Shutdown requested...");
    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;

    db.flush()?;
    println!("✅ Coordinator store flushed. Bye.");
    Ok(())
}
