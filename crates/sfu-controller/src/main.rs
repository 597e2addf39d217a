//! SFU Controller
//!
//! WebSocket signaling and room orchestration for a selective forwarding unit.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3000, path `/ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Create the media engine adapter
//! 4. Initialize actor system (`RoomRegistryHandle`)
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling server
//! 7. Wait for shutdown signal, then drain

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_controller::actors::{ActorMetrics, ConnectionContext, RegistrySettings, RoomRegistryHandle};
use sfu_controller::config::Config;
use sfu_controller::media::{LoopbackEngine, SharedMediaEngine};
use sfu_controller::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_controller::signaling::{signaling_router, SignalingState};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bound on draining rooms at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        max_rooms = config.max_rooms,
        max_peers_per_room = config.max_peers_per_room,
        request_timeout_ms = config.request_timeout.as_millis(),
        empty_room_ttl_seconds = config.empty_room_ttl.as_secs(),
        consumers_start_paused = config.consumers_start_paused,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let engine: SharedMediaEngine = Arc::new(LoopbackEngine::new(config.loopback_settings()));
    info!(
        announced_ip = %config.announced_ip,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        "Media engine adapter initialized (loopback)"
    );

    // Initialize actor system
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        config.instance_id.clone(),
        Arc::clone(&engine),
        RegistrySettings::from(&config),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Cancelled after the registry drained, stops both servers
    let shutdown_token = registry.child_token();

    // Health server (liveness, readiness, /metrics)
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_addr = config.health_bind_address;
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let signaling_addr = config.signaling_bind_address;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let signaling_state = SignalingState {
        context: ConnectionContext {
            registry: registry.clone(),
            engine: Arc::clone(&engine),
            metrics: Arc::clone(&actor_metrics),
            request_timeout: config.request_timeout,
            consumers_start_paused: config.consumers_start_paused,
        },
        shutdown: shutdown_token.child_token(),
    };
    let connections_token = signaling_state.shutdown.clone();
    let signaling_app = signaling_router(signaling_state).layer(TraceLayer::new_for_http());

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_server = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU Controller running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop receiving traffic; new rooms are refused from here on
    health_state.set_draining();

    // Connections tear down their sessions before the rooms go away
    connections_token.cancel();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, registry.shutdown()).await {
        Ok(Ok(())) => info!("All rooms closed"),
        Ok(Err(e)) => warn!(error = %e, "Registry shutdown error"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Registry shutdown timed out"
        ),
    }

    registry.cancel();

    if tokio::time::timeout(Duration::from_secs(5), signaling_server)
        .await
        .is_err()
    {
        warn!("Signaling server did not stop in time");
    }

    info!("SFU Controller shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(clippy::expect_used, reason = "Signal handler failure is unrecoverable")]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(clippy::expect_used, reason = "Signal handler failure is unrecoverable")]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
