// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - NODE METRICS
//
// Prometheus-compatible metrics for production monitoring.
// Flat counter/gauge surface scraped at /metrics.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub struct NodeMetrics {
    registry: Registry,

    // Block production
    pub blocks_proposed_total: IntCounter,
    pub chain_head_height: IntGauge,
    pub poa_proposer_running: IntGauge,

    // Mempool
    pub mempool_size: IntGauge,
    pub mempool_tx_added_total: IntCounter,
    pub mempool_tx_drained_total: IntCounter,
    pub mempool_evictions_total: IntCounter,

    // Circuit breaker
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_trips_total: IntCounter,
    pub blocks_skipped_circuit_breaker_total: IntCounter,

    // RPC
    pub rpc_requests_total: IntCounterVec,
    pub rpc_rate_limited_total: IntCounter,
    pub rpc_send_tx_rejected_total: IntCounter,

    // Cross-site sync
    pub cross_site_imports_total: IntCounterVec,
}

impl NodeMetrics {
    pub fn new() -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let blocks_proposed_total = IntCounter::with_opts(Opts::new(
            "blocks_proposed_total",
            "Blocks sealed by the local PoA proposer",
        ))?;
        registry.register(Box::new(blocks_proposed_total.clone()))?;

        let chain_head_height = IntGauge::with_opts(Opts::new(
            "chain_head_height",
            "Height of the local chain head",
        ))?;
        registry.register(Box::new(chain_head_height.clone()))?;

        let poa_proposer_running = IntGauge::with_opts(Opts::new(
            "poa_proposer_running",
            "Whether the proposer loop is running (1) or stopped (0)",
        ))?;
        registry.register(Box::new(poa_proposer_running.clone()))?;

        let mempool_size = IntGauge::with_opts(Opts::new(
            "mempool_size",
            "Transactions currently pending in the mempool",
        ))?;
        registry.register(Box::new(mempool_size.clone()))?;

        let mempool_tx_added_total = IntCounter::with_opts(Opts::new(
            "mempool_tx_added_total",
            "Transactions admitted into the mempool",
        ))?;
        registry.register(Box::new(mempool_tx_added_total.clone()))?;

        let mempool_tx_drained_total = IntCounter::with_opts(Opts::new(
            "mempool_tx_drained_total",
            "Transactions drained from the mempool into blocks",
        ))?;
        registry.register(Box::new(mempool_tx_drained_total.clone()))?;

        let mempool_evictions_total = IntCounter::with_opts(Opts::new(
            "mempool_evictions_total",
            "Transactions evicted from the mempool",
        ))?;
        registry.register(Box::new(mempool_evictions_total.clone()))?;

        let circuit_breaker_state = IntGauge::with_opts(Opts::new(
            "circuit_breaker_state",
            "Proposer circuit breaker state (0=closed, 1=open)",
        ))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_trips_total = IntCounter::with_opts(Opts::new(
            "circuit_breaker_trips_total",
            "Times the proposer circuit breaker tripped open",
        ))?;
        registry.register(Box::new(circuit_breaker_trips_total.clone()))?;

        let blocks_skipped_circuit_breaker_total = IntCounter::with_opts(Opts::new(
            "blocks_skipped_circuit_breaker_total",
            "Proposer ticks skipped while the circuit breaker was open",
        ))?;
        registry.register(Box::new(blocks_skipped_circuit_breaker_total.clone()))?;

        let rpc_requests_total = IntCounterVec::new(
            Opts::new("rpc_requests_total", "RPC requests by operation"),
            &["op"],
        )?;
        registry.register(Box::new(rpc_requests_total.clone()))?;

        let rpc_rate_limited_total = IntCounter::with_opts(Opts::new(
            "rpc_rate_limited_total",
            "RPC requests refused by the per-IP rate limiter",
        ))?;
        registry.register(Box::new(rpc_rate_limited_total.clone()))?;

        let rpc_send_tx_rejected_total = IntCounter::with_opts(Opts::new(
            "rpc_send_tx_rejected_total",
            "sendTx requests rejected at admission",
        ))?;
        registry.register(Box::new(rpc_send_tx_rejected_total.clone()))?;

        let cross_site_imports_total = IntCounterVec::new(
            Opts::new(
                "cross_site_imports_total",
                "Foreign block import attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(cross_site_imports_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            blocks_proposed_total,
            chain_head_height,
            poa_proposer_running,
            mempool_size,
            mempool_tx_added_total,
            mempool_tx_drained_total,
            mempool_evictions_total,
            circuit_breaker_state,
            circuit_breaker_trips_total,
            blocks_skipped_circuit_breaker_total,
            rpc_requests_total,
            rpc_rate_limited_total,
            rpc_send_tx_rejected_total,
            cross_site_imports_total,
        }))
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = NodeMetrics::new().unwrap();
        assert_eq!(metrics.blocks_proposed_total.get(), 0);
        assert_eq!(metrics.chain_head_height.get(), 0);
    }

    #[test]
    fn test_metrics_export_contains_required_series() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.blocks_proposed_total.inc_by(3);
        metrics.chain_head_height.set(3);
        metrics.rpc_requests_total.with_label_values(&["head"]).inc();
        metrics
            .cross_site_imports_total
            .with_label_values(&["accepted"])
            .inc();

        let output = metrics.export().unwrap();
        for series in [
            "blocks_proposed_total",
            "chain_head_height",
            "mempool_size",
            "mempool_tx_added_total",
            "mempool_tx_drained_total",
            "mempool_evictions_total",
            "circuit_breaker_state",
            "circuit_breaker_trips_total",
            "blocks_skipped_circuit_breaker_total",
            "rpc_requests_total",
            "rpc_rate_limited_total",
            "poa_proposer_running",
            "cross_site_imports_total",
        ] {
            assert!(output.contains(series), "missing series {}", series);
        }
        assert!(output.contains("op=\"head\""));
        assert!(output.contains("outcome=\"accepted\""));
    }
}
