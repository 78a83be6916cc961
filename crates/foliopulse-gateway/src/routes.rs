//! Route handlers for the gateway API.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;

use foliopulse_core::FolioError;
use foliopulse_core::model::{Cadence, RunRecord, Schedule};
use foliopulse_engine::{FanoutOutcome, NewSchedule, Trigger};

use crate::server::AppState;

/// Identity header carried by every investor-scoped request.
const INVESTOR_HEADER: &str = "X-Investor-Id";

fn investor_id(headers: &HeaderMap) -> Result<String, axum::response::Response> {
    headers
        .get(INVESTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"ok": false, "error": "missing X-Investor-Id header"})),
            )
                .into_response()
        })
}

fn error_response(e: &FolioError) -> axum::response::Response {
    let status = match e {
        FolioError::NotFound(_) => StatusCode::NOT_FOUND,
        FolioError::Forbidden(_) => StatusCode::FORBIDDEN,
        FolioError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"ok": false, "error": e.to_string()}))).into_response()
}

fn schedule_json(s: &Schedule) -> serde_json::Value {
    json!({
        "id": s.id,
        "templateId": s.template_id,
        "cadence": s.cadence.as_str(),
        "dayOfMonth": s.day_of_month,
        "companyIds": s.company_ids,
        "includeFutureCompanies": s.include_future_companies,
        "dueDaysOffset": s.due_days_offset,
        "remindersEnabled": s.reminders_enabled,
        "reminderDaysBefore": s.reminder_days_before,
        "isActive": s.is_active,
        "nextRunAt": s.next_run_at.map(|t| t.to_rfc3339()),
        "lastRunAt": s.last_run_at.map(|t| t.to_rfc3339()),
        "createdAt": s.created_at.to_rfc3339(),
    })
}

fn run_json(r: &RunRecord) -> serde_json::Value {
    json!({
        "id": r.id,
        "scheduleId": r.schedule_id,
        "periodStart": r.period_start.to_string(),
        "periodEnd": r.period_end.to_string(),
        "requestsCreated": r.requests_created,
        "emailsSent": r.emails_sent,
        "status": r.status.as_str(),
        "errors": r.errors,
        "companyIds": r.company_ids,
        "createdAt": r.created_at.to_rfc3339(),
    })
}

/// Public health check.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "service": "foliopulse",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Cron trigger: sweep all due schedules now. Safe to call repeatedly —
/// each schedule's fan-out is idempotent for its resolved period.
pub async fn trigger_sweep(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let outcomes = state.engine.sweep(Utc::now()).await;
    Json(json!({
        "ok": true,
        "swept": outcomes.len(),
        "outcomes": outcomes,
    }))
}

pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> axum::response::Response {
    let investor = match investor_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.list(&investor) {
        Ok(schedules) => {
            let items: Vec<_> = schedules.iter().map(schedule_json).collect();
            Json(json!({"ok": true, "schedules": items})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    let investor = match investor_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let Some(template_id) = body["templateId"].as_str().filter(|s| !s.is_empty()) else {
        return error_response(&FolioError::Invalid("templateId is required".into()));
    };
    let Some(cadence) = body["cadence"].as_str().and_then(Cadence::parse) else {
        return error_response(&FolioError::Invalid(
            "cadence must be monthly, quarterly, or annual".into(),
        ));
    };
    let Some(day_of_month) = body["dayOfMonth"].as_u64() else {
        return error_response(&FolioError::Invalid("dayOfMonth is required".into()));
    };
    if !(1..=28).contains(&day_of_month) {
        return error_response(&FolioError::Invalid("dayOfMonth must be 1-28".into()));
    }
    let Some(due_days_offset) = body["dueDaysOffset"].as_i64() else {
        return error_response(&FolioError::Invalid("dueDaysOffset is required".into()));
    };
    let company_ids = body["companyIds"].as_array().map(|arr| {
        arr.iter().filter_map(|v| v.as_str().map(String::from)).collect::<Vec<_>>()
    });
    let reminder_days_before = body["reminderDaysBefore"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect::<Vec<_>>())
        .unwrap_or_default();

    let input = NewSchedule {
        template_id: template_id.to_string(),
        cadence,
        day_of_month: day_of_month as u8,
        company_ids,
        include_future_companies: body["includeFutureCompanies"].as_bool().unwrap_or(true),
        due_days_offset,
        reminders_enabled: body["remindersEnabled"].as_bool().unwrap_or(false),
        reminder_days_before,
    };

    match state.control.create_schedule(&investor, input, Utc::now()) {
        Ok(schedule) => {
            Json(json!({"ok": true, "schedule": schedule_json(&schedule)})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let investor = match investor_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.owned_schedule(&investor, &id) {
        Ok(schedule) => {
            Json(json!({"ok": true, "schedule": schedule_json(&schedule)})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Manual trigger: run one schedule now, regardless of next_run_at or
/// active state. Runs the same engine path as the sweep.
pub async fn run_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let investor = match investor_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let schedule = match state.control.owned_schedule(&investor, &id) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match state.engine.run_schedule(&schedule, Utc::now(), Trigger::Manual).await {
        Ok(FanoutOutcome::Ran(record)) => {
            Json(json!({"ok": true, "run": run_json(&record)})).into_response()
        }
        Ok(FanoutOutcome::Skipped(reason)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"ok": false, "error": format!("schedule skipped: {}", reason.as_str())})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn pause_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let investor = match investor_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.pause(&investor, &id) {
        Ok(schedule) => {
            Json(json!({"ok": true, "schedule": schedule_json(&schedule)})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn resume_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let investor = match investor_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.resume(&investor, &id, Utc::now()) {
        Ok(schedule) => {
            Json(json!({"ok": true, "schedule": schedule_json(&schedule)})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Most recent runs first, capped at 50.
pub async fn schedule_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> axum::response::Response {
    let investor = match investor_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(e) = state.control.owned_schedule(&investor, &id) {
        return error_response(&e);
    }
    match state.store.runs_for_schedule(&id, 50) {
        Ok(runs) => {
            let items: Vec<_> = runs.iter().map(run_json).collect();
            Json(json!({"ok": true, "runs": items})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AppState, build_router};
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use foliopulse_core::config::GatewayConfig;
    use foliopulse_core::model::{DataType, PeriodType, Template, TemplateItem, new_id};
    use foliopulse_engine::FanoutEngine;
    use foliopulse_notify::{Dispatcher, DryRunMailer};
    use foliopulse_store::MetricStore;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(dev_mode: bool, secret: &str) -> (Arc<MetricStore>, Router) {
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        let dispatcher =
            Dispatcher::new(Arc::new(DryRunMailer), 100, 0, Duration::from_millis(1));
        let engine = Arc::new(FanoutEngine::new(store.clone(), dispatcher));
        let config = GatewayConfig {
            cron_secret: secret.into(),
            dev_mode,
            ..GatewayConfig::default()
        };
        let router = build_router(AppState::new(config, store.clone(), engine));
        (store, router)
    }

    fn sweep_request(method: &str, secret: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri("/api/v1/cron/sweep");
        if let Some(secret) = secret {
            builder = builder.header("X-Cron-Secret", secret);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn authoring_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/schedules")
            .header("X-Investor-Id", "inv-1")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn seed_template(store: &MetricStore) -> String {
        let template = Template {
            id: new_id(),
            investor_id: Some("inv-1".into()),
            name: "Basics".into(),
            items: vec![TemplateItem {
                metric_name: "Revenue".into(),
                period_type: PeriodType::Quarterly,
                data_type: DataType::Currency,
            }],
        };
        store.insert_template(&template).unwrap();
        template.id
    }

    #[tokio::test]
    async fn sweep_rejects_missing_or_bad_secret() {
        let (_store, router) = test_router(false, "s3cret");

        let resp = router.clone().oneshot(sweep_request("POST", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = router.clone().oneshot(sweep_request("POST", Some("wrong"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = router.oneshot(sweep_request("POST", Some("s3cret"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sweep_get_registered_only_in_dev_mode() {
        // production: POST only
        let (_store, router) = test_router(false, "s3cret");
        let resp = router.oneshot(sweep_request("GET", Some("s3cret"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let (_store, router) = test_router(true, "s3cret");
        let resp = router.oneshot(sweep_request("GET", Some("s3cret"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unset_secret_locks_trigger_outside_dev_mode() {
        let (_store, router) = test_router(false, "");
        let resp = router.oneshot(sweep_request("POST", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // dev mode without a secret stays open for local poking
        let (_store, router) = test_router(true, "");
        let resp = router.oneshot(sweep_request("POST", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn investor_routes_require_identity_header() {
        let (_store, router) = test_router(false, "s3cret");

        let req = Request::builder()
            .method("GET")
            .uri("/api/v1/schedules")
            .body(Body::empty())
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method("GET")
            .uri("/api/v1/schedules")
            .header("X-Investor-Id", "inv-1")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn authoring_requires_day_and_offset() {
        let (store, router) = test_router(false, "s3cret");
        let template_id = seed_template(&store);

        let resp = router
            .clone()
            .oneshot(authoring_request(json!({
                "templateId": template_id,
                "cadence": "quarterly",
                "dueDaysOffset": 14,
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .clone()
            .oneshot(authoring_request(json!({
                "templateId": template_id,
                "cadence": "quarterly",
                "dayOfMonth": 5,
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .oneshot(authoring_request(json!({
                "templateId": template_id,
                "cadence": "quarterly",
                "dayOfMonth": 5,
                "dueDaysOffset": 14,
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_store, router) = test_router(false, "s3cret");
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
