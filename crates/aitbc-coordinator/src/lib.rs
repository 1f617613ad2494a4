// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - COORDINATOR
//
// Compute-marketplace coordinator: accepts jobs, matches miners,
// validates signed receipts, attests them, and records reward
// transactions on the blockchain node.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod api;
pub mod chain;
pub mod config;
pub mod jobs;
pub mod matcher;
pub mod metrics;
pub mod miners;
pub mod pipeline;
pub mod store;
pub mod sweeps;

use std::sync::{Arc, Mutex, MutexGuard};

/// Recover from poisoned mutex instead of panicking
pub fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Unix timestamp in seconds
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Everything a request handler or background sweep needs, wired once at
/// startup and passed explicitly (no globals).
#[derive(Clone)]
pub struct CoordinatorCtx {
    pub cfg: Arc<config::CoordinatorConfig>,
    pub db: Arc<store::CoordinatorDb>,
    pub jobs: Arc<jobs::JobStore>,
    pub miners: Arc<miners::MinerRegistry>,
    pub chain: Arc<chain::ChainClient>,
    pub pipeline: Arc<pipeline::ReceiptPipeline>,
    pub metrics: Arc<metrics::CoordMetrics>,
}
