// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - BLOCKCHAIN NODE
//
// Single-proposer PoA node: mempool, ledger store, block production with
// circuit breaker, HTTP RPC, cross-site sync, prometheus metrics.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod breaker;
pub mod config;
pub mod db;
pub mod genesis;
pub mod mempool;
pub mod metrics;
pub mod proposer;
pub mod rate_limiter;
pub mod rpc;
pub mod sync;

use std::sync::{Mutex, MutexGuard};

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
