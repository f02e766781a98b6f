//! Prometheus metrics for ADF ingestion.
//!
//! ## Metrics Exported
//!
//! - `adf_ingest_success_total{outcome}` - accepted leads
//! - `adf_parse_failure_total{outcome}` - rejected, failed or aborted submissions, by kind
//! - `adf_ingest_duration_seconds{outcome}` - wall-clock time per request

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

use crate::errors::IngestOutcome;

/// Owns its own registry so tests and multiple routers never collide.
#[derive(Clone)]
pub struct IngestMetrics {
    registry: Registry,
    success: IntCounterVec,
    failure: IntCounterVec,
    duration: HistogramVec,
}

impl IngestMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let success = IntCounterVec::new(
            Opts::new("adf_ingest_success_total", "ADF leads accepted and persisted"),
            &["outcome"],
        )?;
        let failure = IntCounterVec::new(
            Opts::new(
                "adf_parse_failure_total",
                "ADF submissions rejected or failed, by outcome",
            ),
            &["outcome"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "adf_ingest_duration_seconds",
                "Wall-clock time spent handling an ADF submission",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["outcome"],
        )?;

        registry.register(Box::new(success.clone()))?;
        registry.register(Box::new(failure.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        // Children are created up front so every series is exported at zero.
        for outcome in IngestOutcome::ALL {
            let label = outcome.as_label();
            if outcome.is_success() {
                success.with_label_values(&[label]);
            } else {
                failure.with_label_values(&[label]);
            }
            duration.with_label_values(&[label]);
        }

        Ok(Self {
            registry,
            success,
            failure,
            duration,
        })
    }

    pub fn observe(&self, outcome: IngestOutcome, elapsed_secs: f64) {
        let label = outcome.as_label();
        if outcome.is_success() {
            self.success.with_label_values(&[label]).inc();
        } else {
            self.failure.with_label_values(&[label]).inc();
        }
        self.duration
            .with_label_values(&[label])
            .observe(elapsed_secs);
    }

    pub fn success_count(&self, outcome: IngestOutcome) -> u64 {
        self.success.with_label_values(&[outcome.as_label()]).get()
    }

    pub fn failure_count(&self, outcome: IngestOutcome) -> u64 {
        self.failure.with_label_values(&[outcome.as_label()]).get()
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}

/// Records `Aborted` if dropped before the response was produced.
struct InFlight {
    metrics: Arc<IngestMetrics>,
    start: Instant,
    finished: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics
                .observe(IngestOutcome::Aborted, self.start.elapsed().as_secs_f64());
        }
    }
}

/// Middleware around the ingest route: every response is counted and timed.
///
/// Requests cut short by an outer timeout or a client disconnect are counted
/// as `aborted` when their future is dropped.
pub async fn track_ingest(
    State(metrics): State<Arc<IngestMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let mut in_flight = InFlight {
        metrics,
        start: Instant::now(),
        finished: false,
    };
    let response = next.run(request).await;
    in_flight.finished = true;

    let outcome = response
        .extensions()
        .get::<IngestOutcome>()
        .copied()
        .unwrap_or_else(|| IngestOutcome::from_status(response.status()));
    in_flight
        .metrics
        .observe(outcome, in_flight.start.elapsed().as_secs_f64());

    response
}
