// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - COORDINATOR CONFIGURATION
//
// Immutable configuration loaded once from the environment. Key material
// comes in as hex seeds; absence of a key disables the feature it guards
// (attestation, chain submission, API auth) instead of failing startup.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_receipt::{keypair_from_secret_hex, KeyPair};
use std::env;

pub struct CoordinatorConfig {
    pub chain_id: u64,
    /// Identity used as the attestation signer id and chain tx sender tag
    pub coordinator_id: String,
    /// sled path (DATABASE_URL)
    pub db_path: String,
    /// Shared API secret checked against X-Api-Key (JWT_SECRET).
    /// None disables auth — dev mode only.
    pub api_key: Option<String>,
    /// Coordinator identity key (RECEIPT_SIGNING_KEY_HEX). Derives the
    /// chain sender address. None → receipts flow unsigned by us and the
    /// sender falls back to the coordinator id.
    pub signing_key: Option<KeyPair>,
    /// Attestation key (RECEIPT_ATTESTATION_KEY_HEX). None disables the
    /// attestation step of the receipt pipeline.
    pub attestation_key: Option<KeyPair>,
    /// Blockchain node RPC base URL. None → receipts are stored locally
    /// but no reward transactions are emitted.
    pub chain_rpc_url: Option<String>,
    /// Fee attached to coordinator-to-chain transactions
    pub chain_tx_fee: u128,
    pub port: u16,

    // Lifecycle timers (seconds)
    pub t_assign_secs: u64,
    pub t_execute_secs: u64,
    pub t_sweep_secs: u64,
    pub t_heartbeat_timeout_secs: u64,
    pub match_interval_secs: u64,
    pub chain_retry_secs: u64,
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

fn optional_key(var: &str) -> Result<Option<KeyPair>, String> {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => keypair_from_secret_hex(&raw)
            .map(Some)
            .map_err(|e| format!("{}: {}", var, e)),
        _ => Ok(None),
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, String> {
        let signing_key = optional_key("RECEIPT_SIGNING_KEY_HEX")?;
        let attestation_key = optional_key("RECEIPT_ATTESTATION_KEY_HEX")?;

        let cfg = CoordinatorConfig {
            chain_id: parse_env("CHAIN_ID", 2)?,
            coordinator_id: env::var("COORDINATOR_ID")
                .unwrap_or_else(|_| "coordinator".to_string()),
            db_path: env::var("DATABASE_URL").unwrap_or_else(|_| "aitbc_coordinator".to_string()),
            api_key: env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            signing_key,
            attestation_key,
            chain_rpc_url: env::var("CHAIN_RPC_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|url| url.trim_end_matches('/').to_string()),
            chain_tx_fee: parse_env("CHAIN_TX_FEE", aitbc_core::DEFAULT_MIN_FEE)?,
            port: parse_env("COORDINATOR_PORT", 8080)?,
            t_assign_secs: parse_env("T_ASSIGN_SECS", 60)?,
            t_execute_secs: parse_env("T_EXECUTE_SECS", 600)?,
            t_sweep_secs: parse_env("T_SWEEP_SECS", 10)?,
            t_heartbeat_timeout_secs: parse_env("T_HEARTBEAT_TIMEOUT_SECS", 90)?,
            match_interval_secs: parse_env("MATCH_INTERVAL_SECS", 2)?,
            chain_retry_secs: parse_env("CHAIN_RETRY_SECS", 30)?,
        };
        if cfg.api_key.is_none() {
            println!("🔓 JWT_SECRET unset — API auth DISABLED (dev mode)");
        }
        if cfg.attestation_key.is_none() {
            println!("ℹ️  RECEIPT_ATTESTATION_KEY_HEX unset — attestation step disabled");
        }
        Ok(cfg)
    }

    /// Chain account the coordinator sends reward transactions from
    pub fn chain_sender_address(&self) -> String {
        match &self.signing_key {
            Some(key) => key.address(),
            None => self.coordinator_id.clone(),
        }
    }

    /// Test construction with sane defaults and no env reads
    pub fn for_tests(chain_id: u64, db_path: &str) -> Self {
        CoordinatorConfig {
            chain_id,
            coordinator_id: "coordinator-test".to_string(),
            db_path: db_path.to_string(),
            api_key: None,
            signing_key: None,
            attestation_key: None,
            chain_rpc_url: None,
            chain_tx_fee: aitbc_core::DEFAULT_MIN_FEE,
            port: 0,
            t_assign_secs: 60,
            t_execute_secs: 600,
            t_sweep_secs: 10,
            t_heartbeat_timeout_secs: 90,
            match_interval_secs: 2,
            chain_retry_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aitbc_receipt::generate_keypair;

    #[test]
    fn test_sender_address_falls_back_to_id() {
        let cfg = CoordinatorConfig::for_tests(2, "/tmp/x");
        assert_eq!(cfg.chain_sender_address(), "coordinator-test");
    }

    #[test]
    fn test_sender_address_from_signing_key() {
        let mut cfg = CoordinatorConfig::for_tests(2, "/tmp/x");
        let key = generate_keypair();
        let expected = key.address();
        cfg.signing_key = Some(key);
        assert_eq!(cfg.chain_sender_address(), expected);
        assert!(cfg.chain_sender_address().starts_with("AIT"));
    }
}
