// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - BACKGROUND SWEEPS
//
// Three periodic loops keep the marketplace honest:
// - matcher loop: assigns QUEUED jobs to eligible miners
// - timeout sweep: T_assign (ASSIGNED without start → back to QUEUED,
//   miner marked suspect) and T_execute (RUNNING too long → FAILED)
// - heartbeat sweep: stale miners go OFFLINE and their un-started
//   assignments revert to the queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::time::Duration;
use tokio::sync::watch;

use crate::jobs::JobState;
use crate::matcher::assignment_tick;
use crate::{now_secs, CoordinatorCtx};

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub reverted_to_queue: usize,
    pub failed_on_timeout: usize,
    pub miners_offline: usize,
}

/// One pass of the heartbeat + job-timeout sweeps. Factored out of the
/// loop so tests can drive it against a fabricated clock state.
pub fn timeout_sweep(ctx: &CoordinatorCtx) -> SweepReport {
    let now = now_secs();
    let mut report = SweepReport::default();

    // Stale miners → OFFLINE; their un-started assignments revert
    let offline = ctx
        .miners
        .sweep_offline(ctx.cfg.t_heartbeat_timeout_secs);
    report.miners_offline = offline.len();
    for miner_id in &offline {
        for job in ctx.jobs.jobs_for_miner(miner_id, JobState::Assigned) {
            let result = ctx
                .jobs
                .transition(&job.id, JobState::Queued, "assigned miner went offline", |j| {
                    j.miner_id = None;
                    j.assigned_at = None;
                });
            match result {
                Ok(_) => report.reverted_to_queue += 1,
                Err(e) => eprintln!("⚠️  Sweep: revert of {} failed: {}", job.id, e),
            }
        }
    }

    // T_assign: assigned but never started
    for job in ctx.jobs.jobs_in_state(JobState::Assigned) {
        let deadline = job.t_assign_secs.unwrap_or(ctx.cfg.t_assign_secs);
        let assigned_at = match job.assigned_at {
            Some(at) => at,
            None => continue,
        };
        if now.saturating_sub(assigned_at) <= deadline {
            continue;
        }
        let miner_id = job.miner_id.clone();
        let result = ctx
            .jobs
            .transition(&job.id, JobState::Queued, "start timeout — reassigning", |j| {
                j.miner_id = None;
                j.assigned_at = None;
            });
        match result {
            Ok(_) => {
                report.reverted_to_queue += 1;
                if let Some(miner_id) = miner_id {
                    // The miner sat on the assignment — suspect
                    let _ = ctx.miners.release(&miner_id);
                    let _ = ctx.miners.mark_suspect(&miner_id);
                    println!("⏱️  Job {} reverted to queue; miner {} marked suspect", job.id, miner_id);
                }
            }
            Err(e) => eprintln!("⚠️  Sweep: T_assign revert of {} failed: {}", job.id, e),
        }
    }

    // T_execute: running too long
    for job in ctx.jobs.jobs_in_state(JobState::Running) {
        let deadline = job.t_execute_secs.unwrap_or(ctx.cfg.t_execute_secs);
        let started_at = match job.started_at {
            Some(at) => at,
            None => continue,
        };
        if now.saturating_sub(started_at) <= deadline {
            continue;
        }
        let miner_id = job.miner_id.clone();
        let result = ctx
            .jobs
            .transition(&job.id, JobState::Failed, "execution timeout", |j| {
                j.failure = Some(format!("JobTimeout: no completion within {}s", deadline));
            });
        match result {
            Ok(_) => {
                report.failed_on_timeout += 1;
                ctx.metrics.jobs_failed_total.inc();
                if let Some(miner_id) = miner_id {
                    let _ = ctx.miners.release(&miner_id);
                    let _ = ctx.miners.record_result(&miner_id, false);
                }
                println!("⏱️  Job {} FAILED on execution timeout", job.id);
            }
            Err(e) => eprintln!("⚠️  Sweep: T_execute fail of {} failed: {}", job.id, e),
        }
    }

    ctx.metrics.jobs_queued.set(ctx.jobs.queued_count() as i64);
    ctx.metrics
        .miners_online
        .set(ctx.miners.online_count() as i64);
    report
}

/// Matcher loop: assignment tick every MATCH_INTERVAL_SECS
pub async fn run_match_loop(ctx: CoordinatorCtx, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(ctx.cfg.match_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let assigned = assignment_tick(&ctx.jobs, &ctx.miners);
        if assigned > 0 {
            ctx.metrics.jobs_queued.set(ctx.jobs.queued_count() as i64);
        }
    }
}

/// Timeout/heartbeat sweep loop: one pass every T_SWEEP_SECS
pub async fn run_sweep_loop(ctx: CoordinatorCtx, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(ctx.cfg.t_sweep_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        timeout_sweep(&ctx);
    }
}
