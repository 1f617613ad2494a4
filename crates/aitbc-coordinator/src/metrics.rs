// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - COORDINATOR METRICS
//
// Prometheus counters/gauges for the job lifecycle, receipt pipeline,
// miner fleet, and chain submission queue. Scraped at /metrics.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub struct CoordMetrics {
    registry: Registry,

    pub jobs_submitted_total: IntCounter,
    pub jobs_completed_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub jobs_cancelled_total: IntCounter,
    pub jobs_queued: IntGauge,

    pub receipts_stored_total: IntCounter,
    pub receipts_rejected_total: IntCounter,

    pub miners_online: IntGauge,

    pub chain_tx_submitted_total: IntCounter,
    pub chain_tx_retry_queue: IntGauge,
}

impl CoordMetrics {
    pub fn new() -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let jobs_submitted_total = IntCounter::with_opts(Opts::new(
            "jobs_submitted_total",
            "Jobs accepted by the admission endpoint",
        ))?;
        registry.register(Box::new(jobs_submitted_total.clone()))?;

        let jobs_completed_total = IntCounter::with_opts(Opts::new(
            "jobs_completed_total",
            "Jobs completed with a valid receipt",
        ))?;
        registry.register(Box::new(jobs_completed_total.clone()))?;

        let jobs_failed_total = IntCounter::with_opts(Opts::new(
            "jobs_failed_total",
            "Jobs that failed or timed out",
        ))?;
        registry.register(Box::new(jobs_failed_total.clone()))?;

        let jobs_cancelled_total = IntCounter::with_opts(Opts::new(
            "jobs_cancelled_total",
            "Jobs cancelled by clients",
        ))?;
        registry.register(Box::new(jobs_cancelled_total.clone()))?;

        let jobs_queued =
            IntGauge::with_opts(Opts::new("jobs_queued", "Jobs currently waiting for a miner"))?;
        registry.register(Box::new(jobs_queued.clone()))?;

        let receipts_stored_total = IntCounter::with_opts(Opts::new(
            "receipts_stored_total",
            "Receipts validated and persisted",
        ))?;
        registry.register(Box::new(receipts_stored_total.clone()))?;

        let receipts_rejected_total = IntCounter::with_opts(Opts::new(
            "receipts_rejected_total",
            "Receipts rejected by the pipeline",
        ))?;
        registry.register(Box::new(receipts_rejected_total.clone()))?;

        let miners_online = IntGauge::with_opts(Opts::new(
            "miners_online",
            "Registered miners not currently OFFLINE",
        ))?;
        registry.register(Box::new(miners_online.clone()))?;

        let chain_tx_submitted_total = IntCounter::with_opts(Opts::new(
            "chain_tx_submitted_total",
            "Reward transactions accepted by the chain node",
        ))?;
        registry.register(Box::new(chain_tx_submitted_total.clone()))?;

        let chain_tx_retry_queue = IntGauge::with_opts(Opts::new(
            "chain_tx_retry_queue",
            "Reward transactions parked for retry",
        ))?;
        registry.register(Box::new(chain_tx_retry_queue.clone()))?;

        Ok(Arc::new(Self {
            registry,
            jobs_submitted_total,
            jobs_completed_total,
            jobs_failed_total,
            jobs_cancelled_total,
            jobs_queued,
            receipts_stored_total,
            receipts_rejected_total,
            miners_online,
            chain_tx_submitted_total,
            chain_tx_retry_queue,
        }))
    }

    pub fn export(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
