// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - MARKETPLACE MATCHER
//
// Maps job requirements to eligible miners. Eligible = capabilities ⊇
// requirements ∧ AVAILABLE ∧ free slot. Preference order: score desc,
// heartbeat recency desc, then a random tiebreak seeded from the job id
// so assignment is reproducible in tests.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::jobs::{JobState, JobStore};
use crate::miners::{Miner, MinerRegistry};
use crate::now_secs;

/// Deterministic per-job seed for the random tiebreak
pub fn match_seed(job_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    hasher.finish()
}

/// Order candidates by (score desc, last_heartbeat desc, seeded random).
/// The candidate list is first sorted by id so the seeded tiebreak is
/// independent of map iteration order.
pub fn rank_candidates(mut candidates: Vec<Miner>, seed: u64) -> Vec<Miner> {
    candidates.sort_by(|a, b| a.id.cmp(&b.id));

    let mut rng = StdRng::seed_from_u64(seed);
    let mut keyed: Vec<(Miner, u64)> = candidates
        .into_iter()
        .map(|m| {
            let tiebreak: u64 = rng.gen();
            (m, tiebreak)
        })
        .collect();

    keyed.sort_by(|(a, ta), (b, tb)| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
            .then_with(|| ta.cmp(tb))
    });
    keyed.into_iter().map(|(m, _)| m).collect()
}

/// One assignment pass: give every QUEUED job (in priority order) its
/// best eligible miner. Jobs with no match stay QUEUED for the next
/// tick. Returns the number of assignments made.
pub fn assignment_tick(jobs: &JobStore, registry: &MinerRegistry) -> usize {
    let mut assigned = 0usize;

    for job in jobs.queued_jobs() {
        let candidates = registry.list_available(&job.requirements);
        if candidates.is_empty() {
            continue;
        }
        let ranked = rank_candidates(candidates, match_seed(&job.id));
        let chosen = &ranked[0];

        let miner_id = chosen.id.clone();
        match jobs.transition(&job.id, JobState::Assigned, "matched to miner", |j| {
            j.miner_id = Some(miner_id.clone());
            j.assigned_at = Some(now_secs());
        }) {
            Ok(_) => {}
            Err(e) => {
                eprintln!("⚠️  Matcher: transition failed for job {}: {}", job.id, e);
                continue;
            }
        }
        if let Err(e) = registry.mark_busy(&chosen.id) {
            // Miner vanished between snapshot and assignment — put the
            // job back and move on.
            eprintln!("⚠️  Matcher: mark_busy failed for {}: {}", chosen.id, e);
            let _ = jobs.transition(&job.id, JobState::Queued, "assignment rolled back", |j| {
                j.miner_id = None;
                j.assigned_at = None;
            });
            continue;
        }
        println!("🤝 Job {} assigned to miner {}", job.id, chosen.id);
        assigned += 1;
    }
    assigned
}
