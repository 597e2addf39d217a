//! Prometheus metrics for the SFU controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `operation`: signaling operations (8 values)
//! - `code`: error codes (~17 values)
//! - `actor_type`: 3 values (registry, room, connection)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Request latency buckets cover fast in-memory replies up to the default
/// engine timeout.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

// ============================================================================
// Histograms
// ============================================================================

/// Record how long a signaling request took, including engine calls.
///
/// Metric: `sfu_request_latency_seconds`
/// Labels: `operation`
pub fn record_request_latency(operation: &'static str, duration: Duration) {
    histogram!("sfu_request_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `sfu_errors_total`
/// Labels: `operation`, `code`
pub fn record_error(operation: &'static str, code: &'static str) {
    counter!("sfu_errors_total", "operation" => operation, "code" => code).increment(1);
}

/// Record a pending-consumption flush and how many peers it released.
///
/// Metrics: `sfu_pending_flush_total`, `sfu_pending_flushed_peers_total`
pub fn record_pending_flush(peers: usize) {
    counter!("sfu_pending_flush_total").increment(1);
    counter!("sfu_pending_flushed_peers_total").increment(peers as u64);
}

/// Record an engine call that exceeded the request timeout.
///
/// Metric: `sfu_engine_timeouts_total`
/// Labels: `operation`
pub fn record_engine_timeout(operation: &'static str) {
    counter!("sfu_engine_timeouts_total", "operation" => operation).increment(1);
}

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without an installed recorder these are no-ops; they must not panic.
    #[test]
    fn test_record_without_recorder() {
        set_rooms_active(3);
        set_peers_active(7);
        set_actor_mailbox_depth("room", 12);
        record_request_latency("joinRoom", Duration::from_millis(12));
        record_error("consume", "INCOMPATIBLE_CAPABILITIES");
        record_pending_flush(2);
        record_engine_timeout("produce");
        record_actor_panic("connection");
    }

    #[test]
    fn test_error_counter_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_error("consume", "INCOMPATIBLE_CAPABILITIES");
            record_error("consume", "INCOMPATIBLE_CAPABILITIES");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let (key, _, _, value) = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "sfu_errors_total")
            .unwrap();
        let labels: Vec<_> = key
            .key()
            .labels()
            .map(|l| (l.key().to_string(), l.value().to_string()))
            .collect();
        assert!(labels.contains(&("operation".to_string(), "consume".to_string())));
        assert!(labels.contains(&("code".to_string(), "INCOMPATIBLE_CAPABILITIES".to_string())));
        assert_eq!(value, &DebugValue::Counter(2));
    }

    #[test]
    fn test_pending_flush_counts_peers() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_pending_flush(3);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let peers = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "sfu_pending_flushed_peers_total")
            .map(|(_, _, _, value)| value.clone())
            .unwrap();
        assert_eq!(*peers, DebugValue::Counter(3));
    }
}
