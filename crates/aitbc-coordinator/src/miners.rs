// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - MINER REGISTRY
//
// Tracks GPU providers: capabilities, availability, heartbeats, and a
// completion score. A background sweep marks miners OFFLINE when their
// heartbeat goes stale; their un-started assignments revert to the queue.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::store::CoordinatorDb;
use crate::{now_secs, safe_lock};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MinerState {
    Available,
    Busy,
    Maintenance,
    Offline,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Miner {
    pub id: String,
    /// Chain address rewards are minted to (derived from the public key)
    pub address: String,
    /// hex Ed25519 public key — the receipt trust anchor for this miner
    pub public_key: String,
    /// Capability set: models this miner can serve
    pub models: Vec<String>,
    pub gpu_class: String,
    pub max_concurrent_jobs: u32,
    pub state: MinerState,
    pub last_heartbeat: u64,
    pub current_jobs: u32,
    pub completed: u64,
    pub failed: u64,
    /// 100 * completed / (completed + failed), snapshot on completion
    pub score: u32,
    /// Assignments this miner timed out on without starting
    #[serde(default)]
    pub suspect_count: u32,
    pub registered_at: u64,
}

impl Miner {
    /// Capabilities advertised for matching: models plus the GPU class
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = self.models.clone();
        if !self.gpu_class.is_empty() {
            caps.push(self.gpu_class.clone());
        }
        caps
    }

    pub fn has_capacity(&self) -> bool {
        self.current_jobs < self.max_concurrent_jobs
    }

    fn recompute_score(&mut self) {
        let total = self.completed + self.failed;
        self.score = if total == 0 {
            0
        } else {
            ((100 * self.completed) / total) as u32
        };
    }

    /// Apply a finished job to this record: release the slot, update the
    /// track record, snapshot the score.
    pub fn complete_job(&mut self, success: bool) {
        self.current_jobs = self.current_jobs.saturating_sub(1);
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.recompute_score();
        if self.state == MinerState::Busy && self.has_capacity() {
            self.state = MinerState::Available;
        }
    }
}

/// Miner registration body
#[derive(Deserialize, Debug, Clone)]
pub struct MinerRegistration {
    pub miner_id: String,
    pub public_key_hex: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub gpu_class: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: u32,
}

fn default_max_concurrent() -> u32 {
    1
}

pub struct MinerRegistry {
    inner: Mutex<HashMap<String, Miner>>,
    db: Arc<CoordinatorDb>,
}

impl MinerRegistry {
    pub fn load(db: Arc<CoordinatorDb>) -> Result<Self, String> {
        let mut map = HashMap::new();
        for miner in db.load_miners()? {
            map.insert(miner.id.clone(), miner);
        }
        if !map.is_empty() {
            println!("⚒️  Miner registry: restored {} miners", map.len());
        }
        Ok(MinerRegistry {
            inner: Mutex::new(map),
            db,
        })
    }

    /// Register or re-register a miner. Re-registration refreshes
    /// capabilities and the key, but keeps the track record.
    pub fn register(&self, registration: MinerRegistration) -> Result<Miner, String> {
        if registration.miner_id.is_empty() {
            return Err("miner_id must be non-empty".to_string());
        }
        let pubkey = hex::decode(&registration.public_key_hex)
            .map_err(|e| format!("public_key_hex is not valid hex: {}", e))?;
        if pubkey.len() != aitbc_receipt::PUBLIC_KEY_LEN {
            return Err(format!(
                "public key must be {} bytes, got {}",
                aitbc_receipt::PUBLIC_KEY_LEN,
                pubkey.len()
            ));
        }
        if registration.max_concurrent_jobs == 0 {
            return Err("max_concurrent_jobs must be positive".to_string());
        }

        let now = now_secs();
        let mut inner = safe_lock(&self.inner);
        let miner = match inner.get(&registration.miner_id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.public_key = registration.public_key_hex.clone();
                updated.address = aitbc_receipt::public_key_to_address(&pubkey);
                updated.models = registration.models;
                updated.gpu_class = registration.gpu_class;
                updated.max_concurrent_jobs = registration.max_concurrent_jobs;
                updated.state = MinerState::Available;
                updated.last_heartbeat = now;
                updated
            }
            None => Miner {
                id: registration.miner_id.clone(),
                address: aitbc_receipt::public_key_to_address(&pubkey),
                public_key: registration.public_key_hex.clone(),
                models: registration.models,
                gpu_class: registration.gpu_class,
                max_concurrent_jobs: registration.max_concurrent_jobs,
                state: MinerState::Available,
                last_heartbeat: now,
                current_jobs: 0,
                completed: 0,
                failed: 0,
                score: 0,
                suspect_count: 0,
                registered_at: now,
            },
        };
        self.db.put_miner(&miner)?;
        inner.insert(miner.id.clone(), miner.clone());
        Ok(miner)
    }

    pub fn get(&self, miner_id: &str) -> Option<Miner> {
        safe_lock(&self.inner).get(miner_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Miner> {
        safe_lock(&self.inner).values().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        safe_lock(&self.inner)
            .values()
            .filter(|m| !matches!(m.state, MinerState::Offline))
            .count()
    }

    /// Record a heartbeat. An OFFLINE or BUSY miner reporting in comes
    /// back AVAILABLE (unless it asked for MAINTENANCE and still has
    /// capacity accounting that says otherwise).
    pub fn heartbeat(
        &self,
        miner_id: &str,
        requested_state: Option<MinerState>,
    ) -> Result<Miner, String> {
        self.update(miner_id, |miner| {
            miner.last_heartbeat = now_secs();
            match requested_state {
                Some(MinerState::Maintenance) => miner.state = MinerState::Maintenance,
                // A heartbeat never claims OFFLINE; the sweep owns that
                _ => {
                    miner.state = if miner.has_capacity() {
                        MinerState::Available
                    } else {
                        MinerState::Busy
                    };
                }
            }
        })
    }

    /// Miners that could run a job with the given requirements right now
    pub fn list_available(&self, requirements: &[String]) -> Vec<Miner> {
        safe_lock(&self.inner)
            .values()
            .filter(|m| {
                m.state == MinerState::Available
                    && m.has_capacity()
                    && requirements
                        .iter()
                        .all(|req| m.capabilities().contains(req))
            })
            .cloned()
            .collect()
    }

    pub fn mark_busy(&self, miner_id: &str) -> Result<Miner, String> {
        self.update(miner_id, |miner| {
            miner.current_jobs += 1;
            if !miner.has_capacity() {
                miner.state = MinerState::Busy;
            }
        })
    }

    /// Release one job slot (completion, failure, cancel, or revert)
    pub fn release(&self, miner_id: &str) -> Result<Miner, String> {
        self.update(miner_id, |miner| {
            miner.current_jobs = miner.current_jobs.saturating_sub(1);
            if miner.state == MinerState::Busy && miner.has_capacity() {
                miner.state = MinerState::Available;
            }
        })
    }

    /// Update the track record and score snapshot after a job finishes
    pub fn record_result(&self, miner_id: &str, success: bool) -> Result<Miner, String> {
        self.update(miner_id, |miner| {
            if success {
                miner.completed += 1;
            } else {
                miner.failed += 1;
            }
            miner.recompute_score();
        })
    }

    pub fn mark_suspect(&self, miner_id: &str) -> Result<Miner, String> {
        self.update(miner_id, |miner| {
            miner.suspect_count += 1;
        })
    }

    /// Heartbeat sweep: every miner silent for longer than `timeout_secs`
    /// goes OFFLINE. Returns the ids that transitioned so the caller can
    /// revert their un-started assignments.
    pub fn sweep_offline(&self, timeout_secs: u64) -> Vec<String> {
        let now = now_secs();
        let mut inner = safe_lock(&self.inner);
        let mut transitioned = Vec::new();
        for miner in inner.values_mut() {
            if miner.state != MinerState::Offline
                && now.saturating_sub(miner.last_heartbeat) > timeout_secs
            {
                miner.state = MinerState::Offline;
                miner.current_jobs = 0;
                transitioned.push(miner.id.clone());
                if let Err(e) = self.db.put_miner(miner) {
                    eprintln!("⚠️  Failed to persist offline miner {}: {}", miner.id, e);
                }
            }
        }
        if !transitioned.is_empty() {
            println!(
                "💤 Heartbeat sweep: {} miner(s) marked OFFLINE: {:?}",
                transitioned.len(),
                transitioned
            );
        }
        transitioned
    }

    /// Install a miner record already persisted by an atomic multi-entity
    /// commit (receipt pipeline).
    pub fn apply_committed(&self, miner: Miner) {
        safe_lock(&self.inner).insert(miner.id.clone(), miner);
    }

    fn update(&self, miner_id: &str, mutate: impl FnOnce(&mut Miner)) -> Result<Miner, String> {
        let mut inner = safe_lock(&self.inner);
        let miner = inner
            .get_mut(miner_id)
            .ok_or_else(|| format!("miner {} not registered", miner_id))?;
        mutate(miner);
        let snapshot = miner.clone();
        self.db.put_miner(&snapshot)?;
        Ok(snapshot)
    }
}
