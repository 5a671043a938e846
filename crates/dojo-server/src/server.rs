//! `DojoServer`: the Axum router over the session engine.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use dojo_runtime::{SessionManager, WorkshopCatalog};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::events::session_events;
use crate::health::{self, HealthResponse};
use crate::metrics::{self as server_metrics, HTTP_REQUESTS_TOTAL};
use crate::sessions;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The session engine.
    pub manager: Arc<SessionManager>,
    /// Where workshop definitions come from.
    pub catalog: Arc<dyn WorkshopCatalog>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The dojo HTTP server.
pub struct DojoServer {
    state: AppState,
}

impl DojoServer {
    /// Create a server over `manager` and `catalog`.
    pub fn new(manager: Arc<SessionManager>, catalog: Arc<dyn WorkshopCatalog>) -> Self {
        Self {
            state: AppState {
                manager,
                catalog,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/sessions", post(sessions::create_session))
            .route(
                "/sessions/{id}",
                get(sessions::get_session).delete(sessions::end_session),
            )
            .route("/sessions/{id}/execute", post(sessions::execute))
            .route("/sessions/{id}/validate", post(sessions::validate))
            .route("/sessions/{id}/events", get(session_events))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until the shutdown coordinator fires.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "dojo server listening");
        let token = self.state.shutdown.token();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    }

    /// The session engine.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.state.manager
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    counter!(HTTP_REQUESTS_TOTAL, "route" => "health").increment(1);
    Json(health::health_check(
        state.start_time,
        state.manager.live_count(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => server_metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
