//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use foliopulse_core::config::GatewayConfig;
use foliopulse_engine::{FanoutEngine, ScheduleControl};
use foliopulse_store::MetricStore;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub store: Arc<MetricStore>,
    /// Fan-out engine — both the cron trigger and manual runs go through it.
    pub engine: Arc<FanoutEngine>,
    /// Schedule lifecycle operations (create, pause, resume).
    pub control: Arc<ScheduleControl>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        gateway_config: GatewayConfig,
        store: Arc<MetricStore>,
        engine: Arc<FanoutEngine>,
    ) -> Self {
        Self {
            gateway_config,
            control: Arc::new(ScheduleControl::new(store.clone())),
            store,
            engine,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Cron secret auth middleware — validates the X-Cron-Secret header.
/// Applied to the trigger routes only; schedule routes are scoped by
/// investor identity instead.
async fn require_cron_secret(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let expected = &state.gateway_config.cron_secret;
    if expected.is_empty() {
        // No secret configured: only acceptable in dev mode.
        if state.gateway_config.dev_mode {
            return next.run(req).await;
        }
        return unauthorized("cron secret not configured");
    }

    let from_header = req
        .headers()
        .get("X-Cron-Secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if from_header == expected {
        return next.run(req).await;
    }
    unauthorized("invalid or missing cron secret")
}

fn unauthorized(message: &str) -> axum::response::Response {
    let body = serde_json::json!({"ok": false, "error": message}).to_string();
    axum::response::Response::builder()
        .status(axum::http::StatusCode::UNAUTHORIZED)
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap_or_default()
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Trigger routes — require the cron secret
    let mut cron = Router::new().route("/api/v1/cron/sweep", post(super::routes::trigger_sweep));
    if shared.gateway_config.dev_mode {
        // GET fallback for dev tooling that cannot POST
        cron = cron.route("/api/v1/cron/sweep", get(super::routes::trigger_sweep));
    }
    let cron = cron.route_layer(axum::middleware::from_fn_with_state(
        shared.clone(),
        require_cron_secret,
    ));

    // Investor routes — scoped by the X-Investor-Id header
    let api = Router::new()
        .route("/api/v1/schedules", get(super::routes::list_schedules))
        .route("/api/v1/schedules", post(super::routes::create_schedule))
        .route("/api/v1/schedules/{id}", get(super::routes::get_schedule))
        .route("/api/v1/schedules/{id}/run", post(super::routes::run_schedule))
        .route("/api/v1/schedules/{id}/pause", post(super::routes::pause_schedule))
        .route("/api/v1/schedules/{id}/resume", post(super::routes::resume_schedule))
        .route("/api/v1/schedules/{id}/runs", get(super::routes::schedule_runs));

    // Public routes — no auth
    let public = Router::new().route("/health", get(super::routes::health_check));

    cron.merge(api)
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    if state.gateway_config.cron_secret.is_empty() && !state.gateway_config.dev_mode {
        tracing::warn!("⚠️ No cron secret configured — trigger endpoint will reject all calls");
    }
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
