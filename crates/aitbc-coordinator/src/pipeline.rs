// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - RECEIPT PIPELINE
//
// Validation and persistence of miner-signed receipts. All-or-nothing:
// schema/job match → miner signature → receipt_id dedup → coordinator
// attestation → one atomic commit (receipt + history + COMPLETED job +
// released miner) → reward transaction to the chain. Two concurrent
// reports for the same job are serialized; the second sees
// DuplicateReceipt. Every receipt for a job is preserved as history.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_receipt::{sign_payload, verify_payload, ReceiptEnvelope, ReceiptError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::chain::{build_reward_tx, park, ChainClient, ChainError};
use crate::config::CoordinatorConfig;
use crate::jobs::{JobState, JobStore};
use crate::metrics::CoordMetrics;
use crate::miners::MinerRegistry;
use crate::store::{CoordinatorDb, StoredJobReceipt};
use crate::{now_secs, safe_lock};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    NotFound(String),
    /// Payload does not match the job (ids, model, time ordering)
    Validation(String),
    SignatureInvalid(String),
    /// Signer is not a registered miner (or not the assigned one)
    UnknownSigner(String),
    /// This receipt_id is already stored
    DuplicateReceipt(String),
    /// Job is not in a state that accepts results
    InvalidJobState(String),
    Storage(String),
}

impl PipelineError {
    pub fn taxonomy(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => "NotFound",
            PipelineError::Validation(_) => "Validation",
            PipelineError::SignatureInvalid(_) => "SignatureInvalid",
            PipelineError::UnknownSigner(_) => "UnknownSigner",
            PipelineError::DuplicateReceipt(_) => "Duplicate",
            PipelineError::InvalidJobState(_) => "Conflict",
            PipelineError::Storage(_) => "InternalError",
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PipelineError::NotFound(m)
            | PipelineError::Validation(m)
            | PipelineError::SignatureInvalid(m)
            | PipelineError::UnknownSigner(m)
            | PipelineError::InvalidJobState(m)
            | PipelineError::Storage(m) => write!(f, "{}: {}", self.taxonomy(), m),
            PipelineError::DuplicateReceipt(id) => {
                write!(f, "DuplicateReceipt: {}", id)
            }
        }
    }
}

/// Miner result submission body. A success carries a signed receipt;
/// a failure report carries `error` instead.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ResultSubmission {
    /// Raw job output (kept alongside the job for /result)
    pub output: Option<String>,
    pub receipt: Option<ReceiptEnvelope>,
    pub error: Option<String>,
}

/// What the miner gets back on acceptance
#[derive(Serialize, Debug, Clone)]
pub struct ReceiptAccepted {
    pub receipt_id: String,
    pub job_id: String,
    pub attested: bool,
    /// Hash of the reward transaction, when the chain accepted it inline
    pub tx_hash: Option<String>,
    /// True when the reward tx is parked for background retry
    pub chain_parked: bool,
}

pub struct ReceiptPipeline {
    cfg: Arc<CoordinatorConfig>,
    db: Arc<CoordinatorDb>,
    jobs: Arc<JobStore>,
    miners: Arc<MinerRegistry>,
    chain: Arc<ChainClient>,
    metrics: Arc<CoordMetrics>,
    /// Serializes validate+commit so two concurrent reports for the same
    /// job resolve by first-to-commit; the loser sees DuplicateReceipt.
    commit_lock: Mutex<()>,
}

impl ReceiptPipeline {
    pub fn new(
        cfg: Arc<CoordinatorConfig>,
        db: Arc<CoordinatorDb>,
        jobs: Arc<JobStore>,
        miners: Arc<MinerRegistry>,
        chain: Arc<ChainClient>,
        metrics: Arc<CoordMetrics>,
    ) -> Self {
        ReceiptPipeline {
            cfg,
            db,
            jobs,
            miners,
            chain,
            metrics,
            commit_lock: Mutex::new(()),
        }
    }

    /// A miner reporting it could not finish the job: RUNNING → FAILED
    /// (or ASSIGNED → FAILED via the implicit-start rule), miner slot
    /// released, failure counted against the miner's score.
    pub fn report_failure(&self, job_id: &str, error: &str) -> Result<(), PipelineError> {
        let _guard = safe_lock(&self.commit_lock);
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        if !matches!(job.state, JobState::Assigned | JobState::Running) {
            return Err(PipelineError::InvalidJobState(format!(
                "job {} is {:?}, failure reports are accepted only while ASSIGNED or RUNNING",
                job_id, job.state
            )));
        }
        if job.state == JobState::Assigned {
            self.jobs
                .transition(job_id, JobState::Running, "failure report implies start", |j| {
                    j.started_at.get_or_insert(now_secs());
                })
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
        }
        let failure = error.to_string();
        self.jobs
            .transition(job_id, JobState::Failed, "miner reported failure", |j| {
                j.failure = Some(failure);
            })
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        if let Some(miner_id) = &job.miner_id {
            let _ = self.miners.release(miner_id);
            let _ = self.miners.record_result(miner_id, false);
        }
        self.metrics.jobs_failed_total.inc();
        println!("❌ Job {} failed: miner report", job_id);
        Ok(())
    }

    /// Steps 1–6 of the pipeline (everything local), under the commit
    /// lock. Returns what step 7 (chain submission) needs.
    fn validate_and_commit(
        &self,
        job_id: &str,
        submission: &ResultSubmission,
    ) -> Result<(String, ReceiptEnvelope, String, u128), PipelineError> {
        let _guard = safe_lock(&self.commit_lock);
        let now = now_secs();

        // 1. Job lookup + payload/job match
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        if !matches!(job.state, JobState::Assigned | JobState::Running) {
            return Err(PipelineError::InvalidJobState(format!(
                "job {} is {:?}, results are accepted only while ASSIGNED or RUNNING",
                job_id, job.state
            )));
        }
        let receipt = submission.receipt.as_ref().ok_or_else(|| {
            PipelineError::Validation("result carries neither receipt nor error".to_string())
        })?;
        let payload = &receipt.payload;
        if payload.job_id != job.id {
            return Err(PipelineError::Validation(format!(
                "receipt is for job {}, submitted against {}",
                payload.job_id, job.id
            )));
        }
        if payload.model != job.model {
            return Err(PipelineError::Validation(format!(
                "receipt model {} does not match job model {}",
                payload.model, job.model
            )));
        }
        if payload.client_id != job.client_id {
            return Err(PipelineError::Validation(
                "receipt client does not match job client".to_string(),
            ));
        }
        if payload.completed_at < payload.started_at {
            return Err(PipelineError::Validation(
                "completed_at precedes started_at".to_string(),
            ));
        }
        if job.miner_id.as_deref() != Some(payload.provider_id.as_str()) {
            return Err(PipelineError::UnknownSigner(format!(
                "receipt provider {} is not the assigned miner",
                payload.provider_id
            )));
        }
        let reward = payload.reward_amount().ok_or_else(|| {
            PipelineError::Validation("units * unit_price overflows u128".to_string())
        })?;

        // 2. Miner signature against the registered trust anchor
        let miner = self.miners.get(&payload.provider_id).ok_or_else(|| {
            PipelineError::UnknownSigner(format!("miner {} not registered", payload.provider_id))
        })?;
        if receipt.miner_signature.signer_id != miner.id {
            return Err(PipelineError::UnknownSigner(format!(
                "signature signer {} is not miner {}",
                receipt.miner_signature.signer_id, miner.id
            )));
        }
        let miner_pubkey = hex::decode(&miner.public_key)
            .map_err(|e| PipelineError::Storage(format!("corrupt miner pubkey: {}", e)))?;
        verify_payload(
            payload,
            self.cfg.chain_id,
            &receipt.miner_signature,
            &miner_pubkey,
        )
        .map_err(|e| match e {
            ReceiptError::SignatureInvalid => {
                PipelineError::SignatureInvalid("miner signature does not verify".to_string())
            }
            other => PipelineError::Validation(other.to_string()),
        })?;

        // 3. Content address + at-most-once guard
        let receipt_id = payload.receipt_id(self.cfg.chain_id);
        if self
            .db
            .contains_receipt(&receipt_id)
            .map_err(PipelineError::Storage)?
        {
            return Err(PipelineError::DuplicateReceipt(receipt_id));
        }

        // 4. Coordinator attestation (skipped when no key is configured)
        let mut envelope = receipt.clone();
        if let Some(key) = &self.cfg.attestation_key {
            let attestation = sign_payload(
                payload,
                self.cfg.chain_id,
                &self.cfg.coordinator_id,
                &key.secret_key,
            )
            .map_err(|e| PipelineError::Storage(format!("attestation failed: {}", e)))?;
            envelope.attestations.push(attestation);
        }

        // 5+6. One atomic commit: receipt + history + COMPLETED job +
        // released miner. Prior receipts for the job stay in history.
        let mut updated_job = job;
        if updated_job.state == JobState::Assigned {
            // The result itself is evidence the miner started
            updated_job.started_at.get_or_insert(now);
            updated_job.event_seq += 1;
        }
        updated_job.state = JobState::Completed;
        updated_job.receipt_id = Some(receipt_id.clone());
        updated_job.output = submission.output.clone();
        updated_job.completed_at = Some(now);
        updated_job.event_seq += 1;

        let mut updated_miner = miner;
        updated_miner.complete_job(true);

        let stored = StoredJobReceipt {
            receipt_id: receipt_id.clone(),
            job_id: updated_job.id.clone(),
            envelope: envelope.clone(),
            stored_at: now,
        };
        let history_seq = self
            .db
            .history_len(&updated_job.id)
            .map_err(PipelineError::Storage)?;
        self.db
            .commit_receipt(&stored, history_seq, &updated_job, &updated_miner)
            .map_err(PipelineError::Storage)?;

        // Mirror the committed rows into the in-memory stores
        let recipient = updated_miner.address.clone();
        self.jobs.apply_committed(updated_job.clone());
        self.miners.apply_committed(updated_miner);

        // Audit event, best effort (the commit above is the source of truth)
        let _ = self.db.append_event(&crate::jobs::JobEvent {
            job_id: updated_job.id.clone(),
            seq: updated_job.event_seq,
            at: now,
            from_state: JobState::Running,
            to_state: JobState::Completed,
            note: format!("receipt {} accepted", receipt_id),
        });

        self.metrics.receipts_stored_total.inc();
        self.metrics.jobs_completed_total.inc();
        println!(
            "🧾 Receipt {} accepted for job {} (reward {} to {})",
            receipt_id, updated_job.id, reward, recipient
        );
        Ok((receipt_id, envelope, recipient, reward))
    }

    /// Full pipeline: validate, attest, commit, then emit the reward
    /// transaction. Local errors roll back everything (the commit is a
    /// single transaction); chain trouble parks the reward for retry.
    pub async fn submit_result(
        &self,
        job_id: &str,
        submission: ResultSubmission,
    ) -> Result<ReceiptAccepted, PipelineError> {
        let (receipt_id, envelope, recipient, reward) =
            match self.validate_and_commit(job_id, &submission) {
                Ok(out) => out,
                Err(e) => {
                    self.metrics.receipts_rejected_total.inc();
                    return Err(e);
                }
            };
        let attested = !envelope.attestations.is_empty();

        // 7. Reward transaction. The lock is NOT held across the await.
        let mut tx_hash = None;
        let mut chain_parked = false;
        if self.chain.enabled() {
            let tx = build_reward_tx(&self.cfg, &self.db, &recipient, reward, envelope.clone())
                .map_err(PipelineError::Storage)?;
            match self.chain.submit_tx(&tx).await {
                Ok(hash) => {
                    self.metrics.chain_tx_submitted_total.inc();
                    tx_hash = hash;
                }
                Err(ChainError::Duplicate) => {
                    // Already minted (a prior attempt landed) — success
                    self.metrics.chain_tx_submitted_total.inc();
                }
                Err(ChainError::Rejected(msg)) => {
                    eprintln!(
                        "🚨 Reward tx for receipt {} rejected by chain: {}",
                        receipt_id, msg
                    );
                }
                Err(ChainError::Transient(msg)) => {
                    eprintln!(
                        "⚠️  Chain unreachable for receipt {} ({}) — parking for retry",
                        receipt_id, msg
                    );
                    park(&self.db, &receipt_id, &recipient, reward, envelope)
                        .map_err(PipelineError::Storage)?;
                    self.metrics
                        .chain_tx_retry_queue
                        .set(self.db.pending_count().unwrap_or(0) as i64);
                    chain_parked = true;
                }
            }
        }

        Ok(ReceiptAccepted {
            receipt_id,
            job_id: job_id.to_string(),
            attested,
            tx_hash,
            chain_parked,
        })
    }

    /// Verify stored receipts for a job: miner signature against the
    /// registry, attestations against the configured attestation key.
    pub fn verify_history(&self, job_id: &str) -> Result<Vec<(String, bool)>, PipelineError> {
        let rows = self
            .db
            .receipts_for_job(job_id)
            .map_err(PipelineError::Storage)?;
        let mut verdicts = Vec::with_capacity(rows.len());
        for row in rows {
            verdicts.push((
                row.receipt_id.clone(),
                self.verify_envelope(&row.envelope),
            ));
        }
        Ok(verdicts)
    }

    fn verify_envelope(&self, envelope: &ReceiptEnvelope) -> bool {
        let payload = &envelope.payload;
        let miner = match self.miners.get(&payload.provider_id) {
            Some(m) => m,
            None => return false,
        };
        let miner_pubkey = match hex::decode(&miner.public_key) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        if verify_payload(
            payload,
            self.cfg.chain_id,
            &envelope.miner_signature,
            &miner_pubkey,
        )
        .is_err()
        {
            return false;
        }
        if let Some(key) = &self.cfg.attestation_key {
            for attestation in &envelope.attestations {
                if attestation.signer_id == self.cfg.coordinator_id
                    && verify_payload(payload, self.cfg.chain_id, attestation, &key.public_key)
                        .is_err()
                {
                    return false;
                }
            }
        }
        true
    }
}
