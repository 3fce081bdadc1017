//! Prometheus registry and `/metrics` HTTP endpoint. Carried regardless of
//! spec.md's Non-goals (spec.md names no metrics requirement, but the
//! ambient stack always exposes one — SPEC_FULL.md §2).

use crate::error::{AppError, AppResult};
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

/// The counters spec.md §4.8 requires the supervisor to print: active
/// sessions, total dedicated connections, connections executing or with a
/// nonempty queue, and partitions seen.
#[derive(Clone, Debug)]
pub struct ReplayMetrics {
    #[cfg(feature = "metrics")]
    registry: Registry,

    #[cfg(feature = "metrics")]
    pub active_sessions: IntGauge,
    #[cfg(feature = "metrics")]
    pub total_connections: IntGauge,
    #[cfg(feature = "metrics")]
    pub busy_connections: IntGauge,
    #[cfg(feature = "metrics")]
    pub partitions_seen: IntGauge,

    #[cfg(not(feature = "metrics"))]
    _noop: (),
}

impl ReplayMetrics {
    pub fn new() -> AppResult<Self> {
        #[cfg(feature = "metrics")]
        {
            let registry = Registry::new();

            let active_sessions = IntGauge::with_opts(Opts::new(
                "replay_active_sessions",
                "Number of session workers that have received an event and not terminated",
            ))?;
            let total_connections = IntGauge::with_opts(Opts::new(
                "replay_total_connections",
                "Total dedicated physical connections currently open",
            ))?;
            let busy_connections = IntGauge::with_opts(Opts::new(
                "replay_busy_connections",
                "Dedicated connections currently executing or with a nonempty queue",
            ))?;
            let partitions_seen = IntGauge::with_opts(Opts::new(
                "replay_partitions_seen",
                "Number of source partitions observed (0 for file-sourced replay)",
            ))?;

            registry.register(Box::new(active_sessions.clone()))?;
            registry.register(Box::new(total_connections.clone()))?;
            registry.register(Box::new(busy_connections.clone()))?;
            registry.register(Box::new(partitions_seen.clone()))?;

            Ok(Self {
                registry,
                active_sessions,
                total_connections,
                busy_connections,
                partitions_seen,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self { _noop: () })
        }
    }

    #[cfg(feature = "metrics")]
    pub fn encode_text(&self) -> AppResult<String> {
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    #[cfg(not(feature = "metrics"))]
    pub fn encode_text(&self) -> AppResult<String> {
        Ok(String::new())
    }

    #[inline]
    pub fn inc_total_connections(&self) {
        #[cfg(feature = "metrics")]
        self.total_connections.inc();
    }

    #[inline]
    pub fn dec_total_connections(&self) {
        #[cfg(feature = "metrics")]
        self.total_connections.dec();
    }

    #[inline]
    pub fn set_active_sessions(&self, _n: i64) {
        #[cfg(feature = "metrics")]
        self.active_sessions.set(_n);
    }

    #[inline]
    pub fn set_busy_connections(&self, _n: i64) {
        #[cfg(feature = "metrics")]
        self.busy_connections.set(_n);
    }

    #[inline]
    pub fn set_partitions_seen(&self, _n: i64) {
        #[cfg(feature = "metrics")]
        self.partitions_seen.set(_n);
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<ReplayMetrics>,
}

/// Serves the registry at `bind_addr:port/metrics` until `cancel` fires.
pub async fn run_metrics_server(
    bind_addr: &str,
    port: u16,
    metrics: Arc<ReplayMetrics>,
    cancel: tokio_util::sync::CancellationToken,
) -> AppResult<()> {
    let addr: SocketAddr = format!("{bind_addr}:{port}")
        .parse()
        .map_err(|e| AppError::InvalidConfig(format!("invalid metrics bind address: {e}")))?;

    let state = AppState { metrics };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Internal(format!("failed to bind metrics server: {e}")))?;

    tracing::info!(%addr, "metrics server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| AppError::Internal(format!("metrics server error: {e}")))?;
    Ok(())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode_text() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to gather metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "gather metrics failed\n").into_response()
        }
    }
}
