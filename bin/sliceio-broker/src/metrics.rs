//! Broker counters and the health/metrics HTTP endpoint

use crate::registry::WorkerRegistry;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Request and membership counters
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    pub requests_routed: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub responses_relayed: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub workers_purged: AtomicU64,
    pub client_connections: AtomicU64,
    pub worker_connections: AtomicU64,
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

fn gauge(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name} {value}");
}

impl BrokerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self, live_workers: usize, uptime_secs: u64) -> String {
        let mut output = String::with_capacity(2048);
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        gauge(
            &mut output,
            "sliceio_broker_workers_live",
            "Workers currently registered",
            live_workers as u64,
        );
        counter(
            &mut output,
            "sliceio_broker_uptime_seconds",
            "Broker uptime in seconds",
            uptime_secs,
        );
        counter(
            &mut output,
            "sliceio_broker_requests_routed_total",
            "Requests forwarded to a worker",
            load(&self.requests_routed),
        );
        counter(
            &mut output,
            "sliceio_broker_requests_rejected_total",
            "Requests answered with an error because no worker was available",
            load(&self.requests_rejected),
        );
        counter(
            &mut output,
            "sliceio_broker_responses_relayed_total",
            "Worker responses relayed to clients",
            load(&self.responses_relayed),
        );
        counter(
            &mut output,
            "sliceio_broker_heartbeats_sent_total",
            "Heartbeats sent to workers",
            load(&self.heartbeats_sent),
        );
        counter(
            &mut output,
            "sliceio_broker_workers_purged_total",
            "Workers removed after missing heartbeats",
            load(&self.workers_purged),
        );
        counter(
            &mut output,
            "sliceio_broker_client_connections_total",
            "Client connections accepted",
            load(&self.client_connections),
        );
        counter(
            &mut output,
            "sliceio_broker_worker_connections_total",
            "Worker connections accepted",
            load(&self.worker_connections),
        );
        output
    }
}

/// Shared state of the HTTP endpoint
pub struct HttpState {
    pub metrics: Arc<BrokerMetrics>,
    pub registry: Arc<WorkerRegistry>,
    pub start_time: Instant,
}

async fn metrics_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let output = state.metrics.export_prometheus(
        state.registry.len(),
        state.start_time.elapsed().as_secs(),
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

/// Healthy while at least one worker is registered
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    if state.registry.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "NO WORKERS")
    } else {
        (StatusCode::OK, "OK")
    }
}

/// Router serving `/metrics` and `/health`
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_format() {
        let metrics = BrokerMetrics::default();
        BrokerMetrics::incr(&metrics.requests_routed);
        BrokerMetrics::incr(&metrics.requests_routed);
        BrokerMetrics::incr(&metrics.requests_rejected);

        let output = metrics.export_prometheus(3, 12);
        assert!(output.contains("# TYPE sliceio_broker_workers_live gauge"));
        assert!(output.contains("sliceio_broker_workers_live 3\n"));
        assert!(output.contains("sliceio_broker_requests_routed_total 2\n"));
        assert!(output.contains("sliceio_broker_requests_rejected_total 1\n"));
        assert!(output.contains("sliceio_broker_uptime_seconds 12\n"));
    }
}
