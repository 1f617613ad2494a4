// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - NODE CONFIGURATION
//
// Immutable configuration loaded once from the environment at startup and
// passed explicitly into each subsystem. No global mutable settings.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MempoolBackendKind {
    Memory,
    Durable,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Sealed into every canonical encoding — prevents cross-chain replay
    pub chain_id: u64,
    pub db_path: String,
    /// Identity sealed into blocks this site proposes
    pub proposer_id: String,
    pub block_time_secs: u64,
    pub max_block_size_bytes: usize,
    pub max_txs_per_block: usize,
    /// Admission fee floor in minor units
    pub min_fee: u128,
    pub mempool_backend: MempoolBackendKind,
    pub mempool_max_size: usize,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_secs: u64,
    /// Proposer ids accepted by the block import path
    pub trusted_proposers: Vec<String>,
    /// Max heights imported per poll cycle (safety rail)
    pub max_reorg_depth: u64,
    /// Peer RPC base URLs polled by cross-site sync
    pub remote_endpoints: Vec<String>,
    pub poll_interval_secs: u64,
    pub rpc_port: u16,
    /// Per-IP token bucket: requests per second / burst
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{}: cannot parse {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn parse_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, String> {
        let chain_id: u64 = parse_env("CHAIN_ID", 2)?;
        let proposer_id = env::var("PROPOSER_ID").unwrap_or_else(|_| "site-local".to_string());

        let mempool_backend = match env::var("MEMPOOL_BACKEND").as_deref() {
            Ok("durable") => MempoolBackendKind::Durable,
            Ok("memory") | Err(_) => MempoolBackendKind::Memory,
            Ok(other) => {
                return Err(format!(
                    "MEMPOOL_BACKEND: unknown backend {:?} (expected memory|durable)",
                    other
                ))
            }
        };

        let cfg = NodeConfig {
            chain_id,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "aitbc_ledger".to_string()),
            proposer_id,
            block_time_secs: parse_env("BLOCK_TIME_SECONDS", 5)?,
            max_block_size_bytes: parse_env("MAX_BLOCK_SIZE_BYTES", 1_048_576)?,
            max_txs_per_block: parse_env("MAX_TXS_PER_BLOCK", 500)?,
            min_fee: parse_env("MIN_FEE", aitbc_core::DEFAULT_MIN_FEE)?,
            mempool_backend,
            mempool_max_size: parse_env("MEMPOOL_MAX_SIZE", 10_000)?,
            circuit_breaker_threshold: parse_env("CIRCUIT_BREAKER_THRESHOLD", 3)?,
            circuit_breaker_timeout_secs: parse_env("CIRCUIT_BREAKER_TIMEOUT", 30)?,
            trusted_proposers: parse_list("TRUSTED_PROPOSERS"),
            max_reorg_depth: parse_env("MAX_REORG_DEPTH", 100)?,
            remote_endpoints: parse_list("CROSS_SITE_REMOTE_ENDPOINTS"),
            poll_interval_secs: parse_env("CROSS_SITE_POLL_INTERVAL", 10)?,
            rpc_port: parse_env("RPC_PORT", 8545)?,
            rate_limit_rps: parse_env("RATE_LIMIT_RPS", 100)?,
            rate_limit_burst: parse_env("RATE_LIMIT_BURST", 200)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.block_time_secs == 0 {
            return Err("BLOCK_TIME_SECONDS must be positive".to_string());
        }
        if self.mempool_max_size == 0 {
            return Err("MEMPOOL_MAX_SIZE must be positive".to_string());
        }
        if self.max_txs_per_block == 0 || self.max_block_size_bytes == 0 {
            return Err("block caps must be positive".to_string());
        }
        if self.proposer_id.is_empty() {
            return Err("PROPOSER_ID must be non-empty".to_string());
        }
        Ok(())
    }

    /// A proposer is trusted if allowlisted, or if it is this site's own
    /// identity (a site always accepts its own blocks).
    pub fn is_trusted_proposer(&self, proposer: &str) -> bool {
        proposer == self.proposer_id
            || proposer == aitbc_core::GENESIS_PROPOSER
            || self.trusted_proposers.iter().any(|p| p == proposer)
    }

    /// Test/bench construction with sane defaults and no env reads
    pub fn for_tests(chain_id: u64, db_path: &str) -> Self {
        NodeConfig {
            chain_id,
            db_path: db_path.to_string(),
            proposer_id: "site-test".to_string(),
            block_time_secs: 1,
            max_block_size_bytes: 1_048_576,
            max_txs_per_block: 500,
            min_fee: aitbc_core::DEFAULT_MIN_FEE,
            mempool_backend: MempoolBackendKind::Memory,
            mempool_max_size: 10_000,
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout_secs: 30,
            trusted_proposers: vec![],
            max_reorg_depth: 100,
            remote_endpoints: vec![],
            poll_interval_secs: 10,
            rpc_port: 0,
            rate_limit_rps: 100,
            rate_limit_burst: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = NodeConfig::for_tests(2, "/tmp/x");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_trusted_proposer_includes_self_and_genesis() {
        let mut cfg = NodeConfig::for_tests(2, "/tmp/x");
        cfg.trusted_proposers = vec!["site-b".to_string()];
        assert!(cfg.is_trusted_proposer("site-test"));
        assert!(cfg.is_trusted_proposer("site-b"));
        assert!(cfg.is_trusted_proposer(aitbc_core::GENESIS_PROPOSER));
        assert!(!cfg.is_trusted_proposer("site-evil"));
    }

    #[test]
    fn test_zero_block_time_rejected() {
        let mut cfg = NodeConfig::for_tests(2, "/tmp/x");
        cfg.block_time_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
