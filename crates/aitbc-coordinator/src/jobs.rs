// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - JOB STATE MACHINE
//
// Lifecycle: QUEUED → ASSIGNED → RUNNING → {COMPLETED | FAILED},
// ASSIGNED → QUEUED (revert on start timeout), any non-terminal →
// CANCELLED. Transitions are monotonic along this DAG; every transition
// appends an audit event. History is retained indefinitely.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::store::CoordinatorDb;
use crate::{now_secs, safe_lock};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// The lifecycle DAG. Anything not listed here is an invalid edge.
pub fn can_transition(from: JobState, to: JobState) -> bool {
    use JobState::*;
    matches!(
        (from, to),
        (Queued, Assigned)
            | (Assigned, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Assigned, Queued) // miner never started — revert
            | (Queued, Cancelled)
            | (Assigned, Cancelled)
            | (Running, Cancelled)
    )
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Job {
    pub id: String,
    // Immutable inputs
    pub client_id: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    pub submitted_at: u64,
    // Mutable lifecycle
    pub state: JobState,
    pub miner_id: Option<String>,
    /// Set iff state == COMPLETED
    pub receipt_id: Option<String>,
    pub output: Option<String>,
    pub failure: Option<String>,
    pub assigned_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// Per-job timeout overrides (fall back to coordinator config)
    pub t_assign_secs: Option<u64>,
    pub t_execute_secs: Option<u64>,
    #[serde(default)]
    pub event_seq: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub seq: u64,
    pub at: u64,
    pub from_state: JobState,
    pub to_state: JobState,
    pub note: String,
}

/// Client job submission body
#[derive(Deserialize, Debug, Clone)]
pub struct JobSubmission {
    pub client_id: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    pub t_assign_secs: Option<u64>,
    pub t_execute_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobError {
    NotFound(String),
    InvalidTransition { from: JobState, to: JobState },
    Validation(String),
    Storage(String),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            JobError::NotFound(id) => write!(f, "NotFound: job {}", id),
            JobError::InvalidTransition { from, to } => {
                write!(f, "Conflict: invalid transition {:?} → {:?}", from, to)
            }
            JobError::Validation(msg) => write!(f, "Validation: {}", msg),
            JobError::Storage(msg) => write!(f, "InternalError: {}", msg),
        }
    }
}

fn new_job_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// In-memory job table with write-through sled persistence.
pub struct JobStore {
    inner: Mutex<HashMap<String, Job>>,
    db: Arc<CoordinatorDb>,
}

impl JobStore {
    pub fn load(db: Arc<CoordinatorDb>) -> Result<Self, String> {
        let mut map = HashMap::new();
        for job in db.load_jobs()? {
            map.insert(job.id.clone(), job);
        }
        if !map.is_empty() {
            println!("💼 Job store: restored {} jobs", map.len());
        }
        Ok(JobStore {
            inner: Mutex::new(map),
            db,
        })
    }

    pub fn submit(&self, request: JobSubmission) -> Result<Job, JobError> {
        if request.model.is_empty() {
            return Err(JobError::Validation("model must be non-empty".to_string()));
        }
        if request.client_id.is_empty() {
            return Err(JobError::Validation(
                "client_id must be non-empty".to_string(),
            ));
        }

        let now = now_secs();
        let job = Job {
            id: new_job_id(),
            client_id: request.client_id,
            model: request.model.clone(),
            prompt: request.prompt,
            params: request.params,
            // The model itself is always a capability requirement
            requirements: {
                let mut reqs = request.requirements;
                if !reqs.contains(&request.model) {
                    reqs.push(request.model);
                }
                reqs
            },
            priority: request.priority,
            submitted_at: now,
            state: JobState::Queued,
            miner_id: None,
            receipt_id: None,
            output: None,
            failure: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            t_assign_secs: request.t_assign_secs,
            t_execute_secs: request.t_execute_secs,
            event_seq: 1,
        };

        self.db.put_job(&job).map_err(JobError::Storage)?;
        self.db
            .append_event(&JobEvent {
                job_id: job.id.clone(),
                seq: 1,
                at: now,
                from_state: JobState::Queued,
                to_state: JobState::Queued,
                note: "submitted".to_string(),
            })
            .map_err(JobError::Storage)?;
        safe_lock(&self.inner).insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        safe_lock(&self.inner).get(job_id).cloned()
    }

    /// Validate and apply one lifecycle transition. `mutate` runs after
    /// the edge check, before persistence — it fills in transition-
    /// specific fields (miner id, timestamps, receipt id).
    pub fn transition(
        &self,
        job_id: &str,
        to: JobState,
        note: &str,
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job, JobError> {
        let mut inner = safe_lock(&self.inner);
        let job = inner
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let from = job.state;
        if !can_transition(from, to) {
            return Err(JobError::InvalidTransition { from, to });
        }

        let mut updated = job;
        updated.state = to;
        updated.event_seq += 1;
        mutate(&mut updated);

        self.db.put_job(&updated).map_err(JobError::Storage)?;
        self.db
            .append_event(&JobEvent {
                job_id: updated.id.clone(),
                seq: updated.event_seq,
                at: now_secs(),
                from_state: from,
                to_state: to,
                note: note.to_string(),
            })
            .map_err(JobError::Storage)?;
        inner.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    /// Install a job that was already persisted by an atomic multi-entity
    /// commit (the receipt pipeline writes job + miner + receipt in one
    /// sled transaction and then mirrors the result here).
    pub fn apply_committed(&self, job: Job) {
        safe_lock(&self.inner).insert(job.id.clone(), job);
    }

    /// QUEUED jobs in assignment order: priority desc, then submit time asc
    pub fn queued_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = safe_lock(&self.inner)
            .values()
            .filter(|j| j.state == JobState::Queued)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.submitted_at.cmp(&b.submitted_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    pub fn jobs_for_miner(&self, miner_id: &str, state: JobState) -> Vec<Job> {
        let mut jobs: Vec<Job> = safe_lock(&self.inner)
            .values()
            .filter(|j| j.state == state && j.miner_id.as_deref() == Some(miner_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        jobs
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<Job> {
        safe_lock(&self.inner)
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect()
    }

    pub fn queued_count(&self) -> usize {
        safe_lock(&self.inner)
            .values()
            .filter(|j| j.state == JobState::Queued)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(CoordinatorDb::open(dir.path()).unwrap());
        (dir, JobStore::load(db).unwrap())
    }

    fn submission(model: &str, priority: i64) -> JobSubmission {
        JobSubmission {
            client_id: "client-1".to_string(),
            model: model.to_string(),
            prompt: "hello".to_string(),
            params: serde_json::Value::Null,
            requirements: vec![],
            priority,
            t_assign_secs: None,
            t_execute_secs: None,
        }
    }

    #[test]
    fn test_submit_enqueues() {
        let (_dir, store) = store();
        let job = store.submit(submission("llama3.2", 0)).unwrap();
        assert_eq!(job.state, JobState::Queued);
        // The model is implicitly a requirement
        assert!(job.requirements.contains(&"llama3.2".to_string()));
        assert_eq!(store.queued_count(), 1);
    }

    #[test]
    fn test_happy_path_transitions() {
        let (_dir, store) = store();
        let job = store.submit(submission("llama3.2", 0)).unwrap();

        store
            .transition(&job.id, JobState::Assigned, "matched", |j| {
                j.miner_id = Some("miner-1".to_string());
                j.assigned_at = Some(100);
            })
            .unwrap();
        store
            .transition(&job.id, JobState::Running, "started", |j| {
                j.started_at = Some(101);
            })
            .unwrap();
        let done = store
            .transition(&job.id, JobState::Completed, "receipt accepted", |j| {
                j.receipt_id = Some("abc".to_string());
                j.completed_at = Some(105);
            })
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.receipt_id.as_deref(), Some("abc"));
        assert_eq!(done.event_seq, 4);
    }

    #[test]
    fn test_invalid_edges_rejected() {
        let (_dir, store) = store();
        let job = store.submit(submission("llama3.2", 0)).unwrap();

        // QUEUED → RUNNING skips assignment
        let err = store
            .transition(&job.id, JobState::Running, "", |_| {})
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));

        // QUEUED → COMPLETED skips everything
        let err = store
            .transition(&job.id, JobState::Completed, "", |_| {})
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let (_dir, store) = store();
        let job = store.submit(submission("llama3.2", 0)).unwrap();
        store
            .transition(&job.id, JobState::Cancelled, "client cancel", |_| {})
            .unwrap();

        for target in [JobState::Assigned, JobState::Running, JobState::Cancelled] {
            let err = store.transition(&job.id, target, "", |_| {}).unwrap_err();
            assert!(matches!(err, JobError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn test_assigned_reverts_to_queued() {
        let (_dir, store) = store();
        let job = store.submit(submission("llama3.2", 0)).unwrap();
        store
            .transition(&job.id, JobState::Assigned, "matched", |j| {
                j.miner_id = Some("miner-1".to_string());
            })
            .unwrap();
        let reverted = store
            .transition(&job.id, JobState::Queued, "start timeout", |j| {
                j.miner_id = None;
                j.assigned_at = None;
            })
            .unwrap();
        assert_eq!(reverted.state, JobState::Queued);
        assert!(reverted.miner_id.is_none());
    }

    #[test]
    fn test_queue_order_priority_then_age() {
        let (_dir, store) = store();
        let low = store.submit(submission("m", 0)).unwrap();
        let high = store.submit(submission("m", 5)).unwrap();
        let low2 = store.submit(submission("m", 0)).unwrap();

        let order: Vec<String> = store.queued_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(order[0], high.id);
        // Equal priority: earlier submission first (ids tie-break equal stamps)
        assert!(order[1..].contains(&low.id) && order[1..].contains(&low2.id));
    }

    #[test]
    fn test_jobs_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = {
            let db = Arc::new(CoordinatorDb::open(dir.path()).unwrap());
            let store = JobStore::load(db.clone()).unwrap();
            let job = store.submit(submission("llama3.2", 0)).unwrap();
            db.flush().unwrap();
            job.id
        };
        let db = Arc::new(CoordinatorDb::open(dir.path()).unwrap());
        let store = JobStore::load(db).unwrap();
        let restored = store.get(&job_id).unwrap();
        assert_eq!(restored.state, JobState::Queued);
    }
}
