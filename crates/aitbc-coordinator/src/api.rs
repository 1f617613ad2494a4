// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - COORDINATOR HTTP API
//
// /v1 endpoints for clients (job submit/status/result/cancel) and miner
// runtimes (register, heartbeat, poll, result). Auth: X-Api-Key shared
// secret on every /v1 route; /health and /metrics are open.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::config::CoordinatorConfig;
use crate::jobs::{JobError, JobState, JobSubmission};
use crate::miners::{MinerRegistration, MinerState};
use crate::now_secs;
use crate::pipeline::{PipelineError, ResultSubmission};
use crate::CoordinatorCtx;

fn ok_json(value: serde_json::Value) -> warp::reply::Response {
    warp::reply::json(&value).into_response()
}

fn error_json(error: &str, msg: &str, code: StatusCode) -> warp::reply::Response {
    let body = serde_json::json!({
        "status": "error",
        "error": error,
        "msg": msg,
    });
    warp::reply::with_status(warp::reply::json(&body), code).into_response()
}

fn job_error_response(err: &JobError) -> warp::reply::Response {
    let code = match err {
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
        JobError::Validation(_) => StatusCode::BAD_REQUEST,
        JobError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let taxonomy = match err {
        JobError::NotFound(_) => "NotFound",
        JobError::InvalidTransition { .. } => "Conflict",
        JobError::Validation(_) => "Validation",
        JobError::Storage(_) => "InternalError",
    };
    error_json(taxonomy, &err.to_string(), code)
}

fn pipeline_error_response(err: &PipelineError) -> warp::reply::Response {
    let code = match err {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Validation(_) | PipelineError::SignatureInvalid(_) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::UnknownSigner(_) => StatusCode::FORBIDDEN,
        PipelineError::DuplicateReceipt(_) | PipelineError::InvalidJobState(_) => {
            StatusCode::CONFLICT
        }
        PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_json(err.taxonomy(), &err.to_string(), code)
}

#[derive(Debug)]
struct Unauthorized;
impl warp::reject::Reject for Unauthorized {}

/// X-Api-Key check. JWT_SECRET unset → auth disabled (dev mode).
fn with_auth(
    cfg: Arc<CoordinatorConfig>,
) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("x-api-key")
        .and(warp::any().map(move || cfg.clone()))
        .and_then(
            |provided: Option<String>, cfg: Arc<CoordinatorConfig>| async move {
                match &cfg.api_key {
                    Some(expected) if provided.as_deref() != Some(expected.as_str()) => {
                        Err(warp::reject::custom(Unauthorized))
                    }
                    _ => Ok(()),
                }
            },
        )
        .untuple_one()
}

fn with_ctx(
    ctx: CoordinatorCtx,
) -> impl Filter<Extract = (CoordinatorCtx,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

#[derive(Deserialize, Debug)]
struct HeartbeatRequest {
    miner_id: String,
    status: Option<MinerState>,
    /// Jobs this miner has actually started executing
    #[serde(default)]
    running_jobs: Vec<String>,
}

pub fn routes(
    ctx: CoordinatorCtx,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    // 1. POST /v1/jobs — client job submission
    let ctx_submit = ctx.clone();
    let submit_route = warp::path!("jobs")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_ctx(ctx_submit))
        .map(|body: bytes::Bytes, c: CoordinatorCtx| {
            let request: JobSubmission = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return error_json(
                        "Validation",
                        &format!("invalid job body: {}", e),
                        StatusCode::BAD_REQUEST,
                    )
                }
            };
            match c.jobs.submit(request) {
                Ok(job) => {
                    c.metrics.jobs_submitted_total.inc();
                    c.metrics.jobs_queued.set(c.jobs.queued_count() as i64);
                    ok_json(serde_json::json!({
                        "status": "ok",
                        "job_id": job.id,
                        "state": job.state,
                    }))
                }
                Err(e) => job_error_response(&e),
            }
        });

    // 2. GET /v1/jobs/{id} — status
    let ctx_status = ctx.clone();
    let status_route = warp::path!("jobs" / String)
        .and(warp::get())
        .and(with_ctx(ctx_status))
        .map(|job_id: String, c: CoordinatorCtx| match c.jobs.get(&job_id) {
            Some(job) => ok_json(serde_json::json!(job)),
            None => error_json(
                "NotFound",
                &format!("job {} not found", job_id),
                StatusCode::NOT_FOUND,
            ),
        });

    // 3. GET /v1/jobs/{id}/result — output + latest receipt
    let ctx_result = ctx.clone();
    let result_route = warp::path!("jobs" / String / "result")
        .and(warp::get())
        .and(with_ctx(ctx_result))
        .map(|job_id: String, c: CoordinatorCtx| {
            let job = match c.jobs.get(&job_id) {
                Some(job) => job,
                None => {
                    return error_json(
                        "NotFound",
                        &format!("job {} not found", job_id),
                        StatusCode::NOT_FOUND,
                    )
                }
            };
            if job.state != JobState::Completed {
                return error_json(
                    "NotFound",
                    &format!("job {} has no result yet (state {:?})", job_id, job.state),
                    StatusCode::NOT_FOUND,
                );
            }
            let receipt = job
                .receipt_id
                .as_deref()
                .and_then(|id| c.db.receipt(id).ok().flatten());
            ok_json(serde_json::json!({
                "job_id": job.id,
                "output": job.output,
                "receipt_id": job.receipt_id,
                "receipt": receipt.map(|r| r.envelope),
            }))
        });

    // 4. GET /v1/jobs/{id}/receipts — full history (?verify=true)
    let ctx_history = ctx.clone();
    let receipts_route = warp::path!("jobs" / String / "receipts")
        .and(warp::get())
        .and(warp::query::<std::collections::HashMap<String, String>>())
        .and(with_ctx(ctx_history))
        .map(
            |job_id: String,
             query: std::collections::HashMap<String, String>,
             c: CoordinatorCtx| {
                if c.jobs.get(&job_id).is_none() {
                    return error_json(
                        "NotFound",
                        &format!("job {} not found", job_id),
                        StatusCode::NOT_FOUND,
                    );
                }
                let rows = match c.db.receipts_for_job(&job_id) {
                    Ok(rows) => rows,
                    Err(e) => {
                        return error_json("InternalError", &e, StatusCode::INTERNAL_SERVER_ERROR)
                    }
                };
                let verify = query.get("verify").map(|v| v == "true").unwrap_or(false);
                let verdicts = if verify {
                    match c.pipeline.verify_history(&job_id) {
                        Ok(v) => Some(v),
                        Err(e) => return pipeline_error_response(&e),
                    }
                } else {
                    None
                };
                ok_json(serde_json::json!({
                    "job_id": job_id,
                    "count": rows.len(),
                    "receipts": rows,
                    "verified": verdicts,
                }))
            },
        );

    // 5. POST /v1/jobs/{id}/cancel
    let ctx_cancel = ctx.clone();
    let cancel_route = warp::path!("jobs" / String / "cancel")
        .and(warp::post())
        .and(with_ctx(ctx_cancel))
        .map(|job_id: String, c: CoordinatorCtx| {
            let result = c
                .jobs
                .transition(&job_id, JobState::Cancelled, "client cancel", |_| {});
            match result {
                Ok(job) => {
                    // Release the assigned miner, if any
                    if let Some(miner_id) = &job.miner_id {
                        if let Err(e) = c.miners.release(miner_id) {
                            eprintln!("⚠️  Cancel: release failed for {}: {}", miner_id, e);
                        }
                    }
                    c.metrics.jobs_cancelled_total.inc();
                    c.metrics.jobs_queued.set(c.jobs.queued_count() as i64);
                    ok_json(serde_json::json!({
                        "status": "ok",
                        "job_id": job.id,
                        "state": job.state,
                    }))
                }
                Err(e) => job_error_response(&e),
            }
        });

    // 6. GET /v1/miners/poll?miner_id= — miner pulls its assignments
    let ctx_poll = ctx.clone();
    let poll_route = warp::path!("miners" / "poll")
        .and(warp::get())
        .and(warp::query::<std::collections::HashMap<String, String>>())
        .and(with_ctx(ctx_poll))
        .map(
            |query: std::collections::HashMap<String, String>, c: CoordinatorCtx| {
                let miner_id = match query.get("miner_id") {
                    Some(id) if !id.is_empty() => id.clone(),
                    _ => {
                        return error_json(
                            "Validation",
                            "miner_id query parameter required",
                            StatusCode::BAD_REQUEST,
                        )
                    }
                };
                // Polling is evidence of liveness
                if let Err(e) = c.miners.heartbeat(&miner_id, None) {
                    return error_json("NotFound", &e, StatusCode::NOT_FOUND);
                }
                let assigned = c.jobs.jobs_for_miner(&miner_id, JobState::Assigned);
                let jobs: Vec<serde_json::Value> = assigned
                    .iter()
                    .map(|job| {
                        serde_json::json!({
                            "job_id": job.id,
                            "client_id": job.client_id,
                            "model": job.model,
                            "prompt": job.prompt,
                            "params": job.params,
                            "priority": job.priority,
                            "assigned_at": job.assigned_at,
                        })
                    })
                    .collect();
                ok_json(serde_json::json!({
                    "miner_id": miner_id,
                    "count": jobs.len(),
                    "jobs": jobs,
                }))
            },
        );

    // 7. POST /v1/miners/register
    let ctx_register = ctx.clone();
    let register_route = warp::path!("miners" / "register")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_ctx(ctx_register))
        .map(|body: bytes::Bytes, c: CoordinatorCtx| {
            let registration: MinerRegistration = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return error_json(
                        "Validation",
                        &format!("invalid registration body: {}", e),
                        StatusCode::BAD_REQUEST,
                    )
                }
            };
            match c.miners.register(registration) {
                Ok(miner) => {
                    c.metrics.miners_online.set(c.miners.online_count() as i64);
                    println!("⚒️  Miner {} registered ({:?})", miner.id, miner.models);
                    ok_json(serde_json::json!({
                        "status": "ok",
                        "miner_id": miner.id,
                        "address": miner.address,
                        "state": miner.state,
                    }))
                }
                Err(e) => error_json("Validation", &e, StatusCode::BAD_REQUEST),
            }
        });

    // 8. POST /v1/miners/heartbeat
    let ctx_heartbeat = ctx.clone();
    let heartbeat_route = warp::path!("miners" / "heartbeat")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_ctx(ctx_heartbeat))
        .map(|body: bytes::Bytes, c: CoordinatorCtx| {
            let request: HeartbeatRequest = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return error_json(
                        "Validation",
                        &format!("invalid heartbeat body: {}", e),
                        StatusCode::BAD_REQUEST,
                    )
                }
            };
            let miner = match c.miners.heartbeat(&request.miner_id, request.status) {
                Ok(m) => m,
                Err(e) => return error_json("NotFound", &e, StatusCode::NOT_FOUND),
            };

            // A heartbeat naming a job is the job-start signal
            let mut started = Vec::new();
            for job_id in &request.running_jobs {
                match c.jobs.get(job_id) {
                    Some(job)
                        if job.state == JobState::Assigned
                            && job.miner_id.as_deref() == Some(request.miner_id.as_str()) =>
                    {
                        let result = c.jobs.transition(
                            job_id,
                            JobState::Running,
                            "miner heartbeat reported start",
                            |j| {
                                j.started_at = Some(now_secs());
                            },
                        );
                        match result {
                            Ok(_) => started.push(job_id.clone()),
                            Err(e) => {
                                eprintln!("⚠️  Heartbeat start for {} failed: {}", job_id, e)
                            }
                        }
                    }
                    _ => {}
                }
            }

            ok_json(serde_json::json!({
                "status": "ok",
                "miner_id": miner.id,
                "state": miner.state,
                "started_jobs": started,
            }))
        });

    // 9. POST /v1/miners/{job_id}/result — the receipt pipeline entry
    let ctx_result_submit = ctx.clone();
    let submit_result_route = warp::path!("miners" / String / "result")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_ctx(ctx_result_submit))
        .then(|job_id: String, body: bytes::Bytes, c: CoordinatorCtx| async move {
            let submission: ResultSubmission = match serde_json::from_slice(&body) {
                Ok(s) => s,
                Err(e) => {
                    return error_json(
                        "Validation",
                        &format!("invalid result body: {}", e),
                        StatusCode::BAD_REQUEST,
                    )
                }
            };
            // A failure report carries `error` instead of a receipt
            if let Some(error) = &submission.error {
                return match c.pipeline.report_failure(&job_id, error) {
                    Ok(()) => ok_json(serde_json::json!({
                        "status": "ok",
                        "job_id": job_id,
                        "state": JobState::Failed,
                    })),
                    Err(e) => pipeline_error_response(&e),
                };
            }
            match c.pipeline.submit_result(&job_id, submission).await {
                Ok(accepted) => {
                    c.metrics.jobs_queued.set(c.jobs.queued_count() as i64);
                    ok_json(serde_json::json!({
                        "status": "ok",
                        "receipt_id": accepted.receipt_id,
                        "job_id": accepted.job_id,
                        "attested": accepted.attested,
                        "tx_hash": accepted.tx_hash,
                        "chain_parked": accepted.chain_parked,
                    }))
                }
                Err(e) => pipeline_error_response(&e),
            }
        });

    let v1 = warp::path("v1").and(with_auth(ctx.cfg.clone())).and(
        submit_route
            .or(result_route)
            .or(receipts_route)
            .or(cancel_route)
            .or(status_route)
            .or(poll_route)
            .or(register_route)
            .or(heartbeat_route)
            .or(submit_result_route),
    );

    // GET /health — open
    let ctx_health = ctx.clone();
    let health_route = warp::path!("health")
        .and(warp::get())
        .and(with_ctx(ctx_health))
        .map(|c: CoordinatorCtx| {
            ok_json(serde_json::json!({
                "status": "ok",
                "chain_id": c.cfg.chain_id,
                "coordinator_id": c.cfg.coordinator_id,
                "jobs_queued": c.jobs.queued_count(),
                "miners_online": c.miners.online_count(),
                "chain_enabled": c.chain.enabled(),
            }))
        });

    // GET /metrics — open
    let ctx_metrics = ctx.clone();
    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and(with_ctx(ctx_metrics))
        .map(|c: CoordinatorCtx| match c.metrics.export() {
            Ok(text) => warp::reply::with_header(text, "Content-Type", "text/plain; version=0.0.4")
                .into_response(),
            Err(e) => error_json(
                "InternalError",
                &format!("metrics export failed: {}", e),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        });

    v1.or(health_route).or(metrics_route).recover(handle_rejection)
}

async fn handle_rejection(
    rejection: warp::Rejection,
) -> Result<warp::reply::Response, Infallible> {
    if rejection.find::<Unauthorized>().is_some() {
        return Ok(error_json(
            "Validation",
            "missing or invalid X-Api-Key",
            StatusCode::UNAUTHORIZED,
        ));
    }
    if rejection.is_not_found() {
        return Ok(error_json(
            "NotFound",
            "no such endpoint",
            StatusCode::NOT_FOUND,
        ));
    }
    if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_json(
            "Validation",
            "method not allowed",
            StatusCode::METHOD_NOT_ALLOWED,
        ));
    }
    Ok(error_json(
        "InternalError",
        &format!("unhandled rejection: {:?}", rejection),
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
}

/// Serve the API on an OS-assigned port (tests, embedded deployments).
pub fn bind_ephemeral(
    ctx: CoordinatorCtx,
) -> (SocketAddr, impl std::future::Future<Output = ()>) {
    warp::serve(routes(ctx)).bind_ephemeral(([127, 0, 0, 1], 0))
}
