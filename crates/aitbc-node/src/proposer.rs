// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - POA PROPOSER
//
// Single cooperative loop, one per site. Every BLOCK_TIME_SECONDS tick:
// drain the mempool, seal a block on the local head, append atomically.
// Empty drains still seal heartbeat blocks — cross-site liveness detection
// depends on the cadence never pausing. Tick failures feed the circuit
// breaker and never propagate further; drained txs return to the pool.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_core::Block;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::breaker::{CircuitBreaker, TickOutcome};
use crate::config::NodeConfig;
use crate::db::LedgerDb;
use crate::mempool::Mempool;
use crate::metrics::NodeMetrics;
use crate::{now_secs, safe_lock};

/// Seal exactly one block from the current mempool contents.
/// Shared by the proposer loop and the test harness.
pub fn propose_once(
    cfg: &NodeConfig,
    db: &LedgerDb,
    mempool: &Mutex<Mempool>,
) -> Result<Block, String> {
    let head = db
        .head()
        .ok_or_else(|| "ledger has no genesis block".to_string())?;

    let drained = safe_lock(mempool).drain(cfg.max_block_size_bytes, cfg.max_txs_per_block);
    let txs: Vec<_> = drained.iter().map(|entry| entry.tx.clone()).collect();

    // Wall clock, clamped forward: the chain's timestamps must strictly
    // increase even if the host clock stalls or steps backwards.
    let timestamp = now_secs().max(head.timestamp + 1);

    let block = Block::build(
        cfg.chain_id,
        head.height + 1,
        head.hash.clone(),
        timestamp,
        cfg.proposer_id.clone(),
        txs,
    );

    match db.append_block(&block) {
        Ok(_) => Ok(block),
        Err(e) => {
            // The block was not committed — nothing is lost if the txs
            // go back into the pool with their original priorities.
            safe_lock(mempool).readmit(drained);
            Err(e.to_string())
        }
    }
}

/// The proposer loop. Owned by exactly one task in exactly one process —
/// the ledger flock guarantees the process half of that invariant.
pub async fn run_proposer(
    cfg: Arc<NodeConfig>,
    db: Arc<LedgerDb>,
    mempool: Arc<Mutex<Mempool>>,
    metrics: Arc<NodeMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut breaker = CircuitBreaker::new(
        cfg.circuit_breaker_threshold,
        Duration::from_secs(cfg.circuit_breaker_timeout_secs),
    );
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.block_time_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    metrics.poa_proposer_running.set(1);
    println!(
        "⛏️  PoA proposer started: id={} cadence={}s breaker={}x/{}s",
        cfg.proposer_id,
        cfg.block_time_secs,
        cfg.circuit_breaker_threshold,
        cfg.circuit_breaker_timeout_secs
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                // Stop at a tick boundary — never mid-append
                break;
            }
        }

        let outcome = breaker.guard(|| propose_once(&cfg, &db, &mempool));
        match outcome {
            TickOutcome::Executed(Ok(block)) => {
                metrics.blocks_proposed_total.inc();
                metrics.chain_head_height.set(block.header.height as i64);
                if !block.transactions.is_empty() {
                    metrics
                        .mempool_tx_drained_total
                        .inc_by(block.transactions.len() as u64);
                    println!(
                        "📦 Sealed block {} ({} txs)",
                        block.header.height,
                        block.transactions.len()
                    );
                }
            }
            TickOutcome::Executed(Err(e)) => {
                eprintln!("⚠️  Proposer tick failed: {}", e);
            }
            TickOutcome::Skipped => {
                metrics.blocks_skipped_circuit_breaker_total.inc();
            }
        }

        metrics.circuit_breaker_state.set(breaker.state_gauge());
        // trips/skipped counters are owned by the breaker; mirror the trip
        // count into prometheus without double counting
        let trips_reported = metrics.circuit_breaker_trips_total.get();
        if breaker.trips > trips_reported {
            metrics
                .circuit_breaker_trips_total
                .inc_by(breaker.trips - trips_reported);
        }
        metrics
            .mempool_size
            .set(safe_lock(&mempool).size() as i64);
    }

    metrics.poa_proposer_running.set(0);
    println!("⛏️  PoA proposer stopped at tick boundary");
}
