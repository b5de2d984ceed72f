//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_session_opens_total` (counter): session opens by result
//!   (`created`, `resumed`, `missing`, `invalid`)
//! - `gateway_session_saves_total` (counter): saves by outcome
//!   (`written`, `renewed`, `skipped`, `failed`, `abandoned`)
//! - `gateway_envelope_faults_total` (counter): translated handler faults by kind
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so unit tests
//!   need no setup
//! - Exposition is a Prometheus scrape endpoint on its own address

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Instant;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

static DESCRIPTIONS: Once = Once::new();

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn describe_metrics() {
    DESCRIPTIONS.call_once(|| {
        describe_counter!("gateway_requests_total", Unit::Count, "Completed requests.");
        describe_histogram!(
            "gateway_request_duration_seconds",
            Unit::Seconds,
            "Time from dispatch to response completion."
        );
        describe_counter!(
            "gateway_session_opens_total",
            Unit::Count,
            "Session open attempts by result."
        );
        describe_counter!(
            "gateway_session_saves_total",
            Unit::Count,
            "Session persistence at request completion by outcome."
        );
        describe_counter!(
            "gateway_envelope_faults_total",
            Unit::Count,
            "Handler faults translated into envelopes."
        );
    });
}

pub fn record_request(method: &str, status: u16, started: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "method" => method.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn record_session_open(result: &'static str) {
    metrics::counter!("gateway_session_opens_total", "result" => result).increment(1);
}

pub fn record_session_save(outcome: &'static str) {
    metrics::counter!("gateway_session_saves_total", "outcome" => outcome).increment(1);
}

pub fn record_envelope_fault(kind: &'static str) {
    metrics::counter!("gateway_envelope_faults_total", "kind" => kind).increment(1);
}
