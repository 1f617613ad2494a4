// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - GENESIS
//
// Installs the deterministic genesis block on first boot. Every site
// with the same chain id derives the identical genesis hash, which is
// what makes cross-site import possible from height 1.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::db::LedgerDb;

/// Ensure the ledger has its genesis block. Idempotent: an already
/// initialized ledger is validated, not rewritten.
pub fn ensure_genesis(db: &LedgerDb) -> Result<(), String> {
    let genesis = aitbc_core::genesis_block(db.chain_id());

    match db.head() {
        Some(head) => {
            // Sanity: the stored chain must be rooted in OUR genesis.
            let stored = db
                .get_block_by_height(0)?
                .ok_or_else(|| "ledger has a head but no block at height 0".to_string())?;
            if stored.header.hash != genesis.header.hash {
                return Err(format!(
                    "ledger at height {} is rooted in foreign genesis {} (expected {}) — \
                     wrong CHAIN_ID or wrong DB_PATH",
                    head.height, stored.header.hash, genesis.header.hash
                ));
            }
            Ok(())
        }
        None => {
            db.append_block(&genesis)
                .map_err(|e| format!("failed to install genesis: {}", e))?;
            println!(
                "🌱 Genesis installed: chain_id={} hash={}",
                db.chain_id(),
                genesis.header.hash
            );
            Ok(())
        }
    }
}
