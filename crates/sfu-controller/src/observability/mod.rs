//! Observability for the SFU controller.
//!
//! Tracing uses `#[instrument(skip_all)]` with explicit fields and one target
//! per component (`sfu.actor.registry`, `sfu.actor.room`,
//! `sfu.actor.connection`, `sfu.signaling.ws`, `sfu.media.loopback`).
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Rooms with an allocated router |
//! | `sfu_peers_active` | Gauge | none | Joined peers across all rooms |
//! | `sfu_connections_active` | Gauge | none | Open signaling connections |
//! | `sfu_request_latency_seconds` | Histogram | `operation` | Signaling request latency |
//! | `sfu_errors_total` | Counter | `operation`, `code` | Error events sent to clients |
//! | `sfu_pending_flush_total` | Counter | none | Pending-consumption queue flushes |
//! | `sfu_engine_timeouts_total` | Counter | `operation` | Engine calls that timed out |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor panics (bugs) |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
