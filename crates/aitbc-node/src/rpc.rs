// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - RPC SURFACE
//
// HTTP/JSON endpoints: transaction submission, block queries, foreign
// block import, sync status. Every error response carries a stable
// taxonomy identifier in the `error` field. Per-IP token-bucket rate
// limiting on /rpc/*; /health and /metrics are unmetered.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use aitbc_core::{Block, Transaction};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use warp::http::{HeaderValue, StatusCode};
use warp::{Filter, Reply};

use crate::config::NodeConfig;
use crate::db::LedgerDb;
use crate::mempool::{AdmitError, Mempool};
use crate::metrics::NodeMetrics;
use crate::rate_limiter::{filters, RateLimiter};
use crate::safe_lock;
use crate::sync::{handle_import, ImportError, ImportOutcome, SyncState};

#[derive(Clone)]
pub struct RpcContext {
    pub cfg: Arc<NodeConfig>,
    pub db: Arc<LedgerDb>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub metrics: Arc<NodeMetrics>,
    pub sync_state: Arc<SyncState>,
}

fn with_ctx(
    ctx: RpcContext,
) -> impl Filter<Extract = (RpcContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

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

fn not_found(what: &str) -> warp::reply::Response {
    error_json("NotFound", what, StatusCode::NOT_FOUND)
}

fn admit_error_response(err: &AdmitError) -> warp::reply::Response {
    match err {
        AdmitError::FeeTooLow { .. } => {
            error_json("FeeTooLow", &err.to_string(), StatusCode::BAD_REQUEST)
        }
        AdmitError::Duplicate => error_json("Duplicate", &err.to_string(), StatusCode::CONFLICT),
        AdmitError::MempoolFull => {
            error_json("MempoolFull", &err.to_string(), StatusCode::SERVICE_UNAVAILABLE)
        }
        AdmitError::Validation(msg) => error_json("Validation", msg, StatusCode::BAD_REQUEST),
        AdmitError::Unavailable(msg) => {
            error_json("MempoolUnavailable", msg, StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

fn import_error_response(err: &ImportError) -> warp::reply::Response {
    let code = match err {
        ImportError::UntrustedProposer(_) => StatusCode::FORBIDDEN,
        ImportError::Conflict(_) => StatusCode::CONFLICT,
        ImportError::InvalidParent(_) | ImportError::InvalidHash(_) | ImportError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        ImportError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_json(err.taxonomy(), &err.to_string(), code)
}

fn block_json(block: &Block) -> serde_json::Value {
    // Blocks serialize directly; the header already carries its hash
    serde_json::to_value(block).unwrap_or_else(|_| serde_json::json!(null))
}

pub fn routes(
    ctx: RpcContext,
    limiter: RateLimiter,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    // 1. GET /rpc/head
    let ctx_head = ctx.clone();
    let head_route = warp::path!("head")
        .and(warp::get())
        .and(with_ctx(ctx_head))
        .map(|c: RpcContext| {
            c.metrics.rpc_requests_total.with_label_values(&["head"]).inc();
            match c.db.head() {
                Some(head) => ok_json(serde_json::json!({
                    "height": head.height,
                    "hash": head.hash,
                    "timestamp": head.timestamp,
                })),
                None => error_json(
                    "InternalError",
                    "ledger has no genesis block",
                    StatusCode::SERVICE_UNAVAILABLE,
                ),
            }
        });

    // 2. GET /rpc/blocks/{height}
    let ctx_block = ctx.clone();
    let block_by_height_route = warp::path!("blocks" / u64)
        .and(warp::get())
        .and(with_ctx(ctx_block))
        .map(|height: u64, c: RpcContext| {
            c.metrics
                .rpc_requests_total
                .with_label_values(&["get_block"])
                .inc();
            match c.db.get_block_by_height(height) {
                Ok(Some(block)) => ok_json(block_json(&block)),
                Ok(None) => not_found(&format!("no block at height {}", height)),
                Err(e) => error_json("InternalError", &e, StatusCode::INTERNAL_SERVER_ERROR),
            }
        });

    // 3. GET /rpc/blocks?limit=N — latest blocks, newest first
    let ctx_blocks = ctx.clone();
    let latest_blocks_route = warp::path!("blocks")
        .and(warp::get())
        .and(warp::query::<std::collections::HashMap<String, String>>())
        .and(with_ctx(ctx_blocks))
        .map(
            |query: std::collections::HashMap<String, String>, c: RpcContext| {
                c.metrics
                    .rpc_requests_total
                    .with_label_values(&["get_blocks"])
                    .inc();
                let limit = query
                    .get("limit")
                    .and_then(|raw| raw.parse::<usize>().ok())
                    .unwrap_or(10)
                    .clamp(1, 100);
                match c.db.latest_blocks(limit) {
                    Ok(blocks) => ok_json(serde_json::json!({
                        "count": blocks.len(),
                        "blocks": blocks.iter().map(block_json).collect::<Vec<_>>(),
                    })),
                    Err(e) => error_json("InternalError", &e, StatusCode::INTERNAL_SERVER_ERROR),
                }
            },
        );

    // 4. GET /rpc/tx/{hash}
    let ctx_tx = ctx.clone();
    let tx_route = warp::path!("tx" / String)
        .and(warp::get())
        .and(with_ctx(ctx_tx))
        .map(|tx_hash: String, c: RpcContext| {
            c.metrics
                .rpc_requests_total
                .with_label_values(&["get_tx"])
                .inc();
            match c.db.get_tx(&tx_hash) {
                Ok(Some((tx, loc))) => ok_json(serde_json::json!({
                    "tx_hash": tx_hash,
                    "tx": tx,
                    "block": {
                        "id": loc.block_id,
                        "height": loc.block_height,
                        "hash": loc.block_hash,
                        "index": loc.index,
                    },
                })),
                Ok(None) => not_found(&format!("transaction {} not found", tx_hash)),
                Err(e) => error_json("InternalError", &e, StatusCode::INTERNAL_SERVER_ERROR),
            }
        });

    // 5. GET /rpc/receipt/{id}
    let ctx_receipt = ctx.clone();
    let receipt_route = warp::path!("receipt" / String)
        .and(warp::get())
        .and(with_ctx(ctx_receipt))
        .map(|receipt_id: String, c: RpcContext| {
            c.metrics
                .rpc_requests_total
                .with_label_values(&["get_receipt"])
                .inc();
            match c.db.get_receipt(&receipt_id) {
                Ok(Some(row)) => ok_json(serde_json::json!({
                    "receipt_id": receipt_id,
                    "receipt": row.envelope,
                    "block": {
                        "id": row.block_id,
                        "height": row.block_height,
                        "hash": row.block_hash,
                    },
                })),
                Ok(None) => not_found(&format!("receipt {} not found", receipt_id)),
                Err(e) => error_json("InternalError", &e, StatusCode::INTERNAL_SERVER_ERROR),
            }
        });

    // 6. POST /rpc/sendTx
    let ctx_send = ctx.clone();
    let send_tx_route = warp::path!("sendTx")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_ctx(ctx_send))
        .map(|body: bytes::Bytes, c: RpcContext| {
            c.metrics
                .rpc_requests_total
                .with_label_values(&["send_tx"])
                .inc();
            // Parse manually so a malformed body is a clean 400, not a 500
            let tx: Transaction = match serde_json::from_slice(&body) {
                Ok(tx) => tx,
                Err(e) => {
                    c.metrics.rpc_send_tx_rejected_total.inc();
                    return error_json(
                        "Validation",
                        &format!("invalid transaction body: {}", e),
                        StatusCode::BAD_REQUEST,
                    );
                }
            };

            let result = safe_lock(&c.mempool).admit(tx);
            let response = match &result {
                Ok(tx_hash) => {
                    c.metrics.mempool_tx_added_total.inc();
                    ok_json(serde_json::json!({
                        "status": "ok",
                        "tx_hash": tx_hash,
                    }))
                }
                Err(err) => {
                    c.metrics.rpc_send_tx_rejected_total.inc();
                    admit_error_response(err)
                }
            };
            {
                let pool = safe_lock(&c.mempool);
                c.metrics.mempool_size.set(pool.size() as i64);
                // Mirror the pool's eviction count into prometheus
                let reported = c.metrics.mempool_evictions_total.get();
                if pool.total_evicted > reported {
                    c.metrics
                        .mempool_evictions_total
                        .inc_by(pool.total_evicted - reported);
                }
            }
            response
        });

    // 7. POST /rpc/blocks/import
    let ctx_import = ctx.clone();
    let import_route = warp::path!("blocks" / "import")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_ctx(ctx_import))
        .map(|body: bytes::Bytes, c: RpcContext| {
            c.metrics
                .rpc_requests_total
                .with_label_values(&["import_block"])
                .inc();
            let block: Block = match serde_json::from_slice(&body) {
                Ok(b) => b,
                Err(e) => {
                    return error_json(
                        "Validation",
                        &format!("invalid block body: {}", e),
                        StatusCode::BAD_REQUEST,
                    )
                }
            };
            match handle_import(&c.cfg, &c.db, &c.metrics, &block) {
                Ok(ImportOutcome::Accepted) => ok_json(serde_json::json!({
                    "status": "ok",
                    "outcome": "accepted",
                    "height": block.header.height,
                })),
                Ok(ImportOutcome::AlreadyExists) => ok_json(serde_json::json!({
                    "status": "ok",
                    "outcome": "already_exists",
                    "height": block.header.height,
                })),
                Err(err) => import_error_response(&err),
            }
        });

    // 8. GET /rpc/syncStatus
    let ctx_sync = ctx.clone();
    let sync_status_route = warp::path!("syncStatus")
        .and(warp::get())
        .and(with_ctx(ctx_sync))
        .map(|c: RpcContext| {
            c.metrics
                .rpc_requests_total
                .with_label_values(&["sync_status"])
                .inc();
            let state = c.db.state_snapshot();
            ok_json(serde_json::json!({
                "height": c.db.head().map(|h| h.height).unwrap_or(0),
                "catching_up": c.sync_state.catching_up(),
                "peers": c.sync_state.peers(),
                "mempool_size": safe_lock(&c.mempool).size(),
                "accumulated_fees": state.accumulated_fees.to_string(),
            }))
        });

    let rpc = warp::path("rpc").and(filters::rate_limit(limiter)).and(
        head_route
            .or(import_route)
            .or(block_by_height_route)
            .or(latest_blocks_route)
            .or(tx_route)
            .or(receipt_route)
            .or(send_tx_route)
            .or(sync_status_route),
    );

    // GET /health — liveness, unmetered
    let ctx_health = ctx.clone();
    let health_route = warp::path!("health")
        .and(warp::get())
        .and(with_ctx(ctx_health))
        .map(|c: RpcContext| {
            ok_json(serde_json::json!({
                "status": "ok",
                "chain_id": c.cfg.chain_id,
                "proposer_id": c.cfg.proposer_id,
                "height": c.db.head().map(|h| h.height).unwrap_or(0),
                "mempool_backend": safe_lock(&c.mempool).backend_name(),
            }))
        });

    // GET /metrics — prometheus text format, unmetered
    let ctx_metrics = ctx.clone();
    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and(with_ctx(ctx_metrics))
        .map(|c: RpcContext| match c.metrics.export() {
            Ok(text) => warp::reply::with_header(text, "Content-Type", "text/plain; version=0.0.4")
                .into_response(),
            Err(e) => error_json(
                "InternalError",
                &format!("metrics export failed: {}", e),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        });

    let metrics_for_recover = ctx.metrics.clone();
    rpc.or(health_route)
        .or(metrics_route)
        .recover(move |rejection| {
            let metrics = metrics_for_recover.clone();
            async move { handle_rejection(rejection, metrics).await }
        })
}

async fn handle_rejection(
    rejection: warp::Rejection,
    metrics: Arc<NodeMetrics>,
) -> Result<warp::reply::Response, Infallible> {
    if let Some(limited) = rejection.find::<filters::RateLimitExceeded>() {
        metrics.rpc_rate_limited_total.inc();
        let mut response = error_json(
            "RateLimited",
            &format!("rate limit exceeded for {}", limited.ip),
            StatusCode::TOO_MANY_REQUESTS,
        );
        response.headers_mut().insert(
            "Retry-After",
            HeaderValue::from_str(&limited.retry_after.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        return Ok(response);
    }
    if rejection.is_not_found() {
        return Ok(not_found("no such endpoint"));
    }
    if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
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

/// Serve the RPC on an OS-assigned port. Used by tests and embedded
/// deployments; returns the bound address and the server future.
pub fn bind_ephemeral(
    ctx: RpcContext,
    limiter: RateLimiter,
) -> (SocketAddr, impl std::future::Future<Output = ()>) {
    warp::serve(routes(ctx, limiter)).bind_ephemeral(([127, 0, 0, 1], 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::MemoryBackend;
    use aitbc_core::{genesis_block, TxPayload};

    const CHAIN_ID: u64 = 2;

    fn test_ctx() -> (tempfile::TempDir, RpcContext) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(NodeConfig::for_tests(CHAIN_ID, dir.path().to_str().unwrap()));
        let db = Arc::new(LedgerDb::open(dir.path(), CHAIN_ID).unwrap());
        db.append_block(&genesis_block(CHAIN_ID)).unwrap();
        let mempool = Arc::new(Mutex::new(
            Mempool::new(
                CHAIN_ID,
                cfg.min_fee,
                cfg.mempool_max_size,
                cfg.max_block_size_bytes,
                Box::new(MemoryBackend),
            )
            .unwrap(),
        ));
        let ctx = RpcContext {
            cfg,
            db,
            mempool,
            metrics: NodeMetrics::new().unwrap(),
            sync_state: SyncState::new(),
        };
        (dir, ctx)
    }

    fn tx_body(fee: u128) -> Vec<u8> {
        let tx = Transaction {
            sender: "faucet".to_string(),
            recipient: "alice".to_string(),
            amount: 100,
            fee,
            nonce: 1,
            payload: TxPayload::Faucet {
                memo: String::new(),
            },
        };
        serde_json::to_vec(&tx).unwrap()
    }

    #[tokio::test]
    async fn test_head_route() {
        let (_dir, ctx) = test_ctx();
        let api = routes(ctx, RateLimiter::new(100, None));

        let resp = warp::test::request()
            .method("GET")
            .path("/rpc/head")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["height"], 0);
    }

    #[tokio::test]
    async fn test_send_tx_accepted() {
        let (_dir, ctx) = test_ctx();
        let mempool = ctx.mempool.clone();
        let api = routes(ctx, RateLimiter::new(100, None));

        let resp = warp::test::request()
            .method("POST")
            .path("/rpc/sendTx")
            .body(tx_body(50))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(safe_lock(&mempool).size(), 1);
    }

    #[tokio::test]
    async fn test_send_tx_fee_too_low_is_400() {
        let (_dir, ctx) = test_ctx();
        let mempool = ctx.mempool.clone();
        let metrics = ctx.metrics.clone();
        let api = routes(ctx, RateLimiter::new(100, None));

        let resp = warp::test::request()
            .method("POST")
            .path("/rpc/sendTx")
            .body(tx_body(5))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "FeeTooLow");
        assert_eq!(safe_lock(&mempool).size(), 0);
        assert_eq!(metrics.rpc_send_tx_rejected_total.get(), 1);
    }

    #[tokio::test]
    async fn test_send_tx_duplicate_is_409() {
        let (_dir, ctx) = test_ctx();
        let api = routes(ctx, RateLimiter::new(100, None));

        let first = warp::test::request()
            .method("POST")
            .path("/rpc/sendTx")
            .body(tx_body(50))
            .reply(&api)
            .await;
        assert_eq!(first.status(), 200);

        let second = warp::test::request()
            .method("POST")
            .path("/rpc/sendTx")
            .body(tx_body(50))
            .reply(&api)
            .await;
        assert_eq!(second.status(), 409);
        let body: serde_json::Value = serde_json::from_slice(second.body()).unwrap();
        assert_eq!(body["error"], "Duplicate");
    }

    #[tokio::test]
    async fn test_send_tx_garbage_is_400() {
        let (_dir, ctx) = test_ctx();
        let api = routes(ctx, RateLimiter::new(100, None));

        let resp = warp::test::request()
            .method("POST")
            .path("/rpc/sendTx")
            .body("{not json")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "Validation");
    }

    #[tokio::test]
    async fn test_block_not_found_is_404() {
        let (_dir, ctx) = test_ctx();
        let api = routes(ctx, RateLimiter::new(100, None));

        let resp = warp::test::request()
            .method("GET")
            .path("/rpc/blocks/999")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 404);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn test_import_untrusted_is_403() {
        let (_dir, ctx) = test_ctx();
        let db = ctx.db.clone();
        let api = routes(ctx, RateLimiter::new(100, None));

        let head = db.head().unwrap();
        let foreign = Block::build(
            CHAIN_ID,
            1,
            head.hash,
            head.timestamp + 1,
            "site-evil".to_string(),
            vec![],
        );
        let resp = warp::test::request()
            .method("POST")
            .path("/rpc/blocks/import")
            .body(serde_json::to_vec(&foreign).unwrap())
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 403);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "UntrustedProposer");
        assert_eq!(db.head().unwrap().height, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_is_429_with_retry_after() {
        let (_dir, ctx) = test_ctx();
        let metrics = ctx.metrics.clone();
        // One token, no burst headroom
        let api = routes(ctx, RateLimiter::new(1, Some(1)));

        let first = warp::test::request()
            .method("GET")
            .path("/rpc/head")
            .reply(&api)
            .await;
        assert_eq!(first.status(), 200);

        let second = warp::test::request()
            .method("GET")
            .path("/rpc/head")
            .reply(&api)
            .await;
        assert_eq!(second.status(), 429);
        assert!(second.headers().contains_key("Retry-After"));
        assert_eq!(metrics.rpc_rate_limited_total.get(), 1);

        // /health is unmetered
        let health = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&api)
            .await;
        assert_eq!(health.status(), 200);
    }

    #[tokio::test]
    async fn test_metrics_route_exports_text() {
        let (_dir, ctx) = test_ctx();
        let api = routes(ctx, RateLimiter::new(100, None));

        let resp = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 200);
        let text = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(text.contains("mempool_size"));
    }

    #[tokio::test]
    async fn test_sync_status_route() {
        let (_dir, ctx) = test_ctx();
        let api = routes(ctx, RateLimiter::new(100, None));

        let resp = warp::test::request()
            .method("GET")
            .path("/rpc/syncStatus")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["height"], 0);
        assert_eq!(body["catching_up"], false);
    }
}
