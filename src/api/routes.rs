//! API route definitions.

use axum::extract::{Path, Query as QueryParams, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::health::{persisted_status, SCHEDULER_SERVICE};
use crate::scheduler::{ExecutionId, TriggerKind};
use crate::storage::blocking;
use crate::storage::catalog::QueryId;
use crate::tracker::BugId;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

type ApiResult = Result<Json<Value>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/service-status", get(list_service_status))
        .route("/service-status/{service}", get(service_status))
        .route("/queries", get(list_queries))
        .route("/queries/test", post(test_filter))
        .route("/queries/{id}/execute", post(execute_query))
        .route("/queries/{id}/executions", get(list_executions))
        .route("/queries/{id}/snapshots/latest", get(latest_snapshot))
        .route("/queries/{id}/snapshots/{execution_id}", get(get_snapshot))
        .route("/executions/{execution_id}", get(get_execution))
        .route("/bugs/{bug_id}/history/{field}", get(field_history))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

/// Process liveness, plus this process's own scheduling loop as seen in memory.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "scheduler": state.scheduler.health().status()
        },
        "meta": meta()
    }))
}

async fn status_of(state: &AppState, service: String) -> Result<Value, ApiError> {
    let pool = state.pool.clone();
    let window = state.heartbeat_window;
    let name = service.clone();
    let status = blocking(move || persisted_status(&pool, &name, window, Utc::now())).await?;
    Ok(json!({ "service": service, "status": status }))
}

async fn list_service_status(State(state): State<AppState>) -> ApiResult {
    let scheduler = status_of(&state, SCHEDULER_SERVICE.to_string()).await?;
    Ok(Json(json!({ "data": [scheduler], "meta": meta() })))
}

async fn service_status(State(state): State<AppState>, Path(service): Path<String>) -> ApiResult {
    let status = status_of(&state, service).await?;
    Ok(Json(json!({ "data": status, "meta": meta() })))
}

async fn list_queries(State(state): State<AppState>) -> ApiResult {
    state.scheduler.sync_queries().await?;
    let queries = state.scheduler.query_states();
    Ok(Json(json!({ "data": queries, "meta": { "total": queries.len() } })))
}

#[derive(Debug, Deserialize)]
struct TestFilterRequest {
    filter: String,
}

async fn test_filter(State(state): State<AppState>, Json(req): Json<TestFilterRequest>) -> ApiResult {
    if req.filter.trim().is_empty() {
        return Err(ApiError::BadRequest("filter must not be empty".into()));
    }
    let ids = state.scheduler.test_filter(&req.filter).await?;
    Ok(Json(json!({ "data": { "bug_ids": ids }, "meta": { "total": ids.len() } })))
}

async fn execute_query(
    State(state): State<AppState>,
    Path(id): Path<QueryId>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ack = state.scheduler.trigger(id, TriggerKind::Manual).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "data": ack, "meta": meta() }))))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<QueryId>,
    QueryParams(params): QueryParams<ListParams>,
) -> ApiResult {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let records = state.scheduler.executions(id, limit).await?;
    Ok(Json(json!({ "data": records, "meta": { "total": records.len(), "limit": limit } })))
}

async fn latest_snapshot(State(state): State<AppState>, Path(id): Path<QueryId>) -> ApiResult {
    let snapshot = state
        .scheduler
        .latest_snapshot(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("snapshot for query {}", id)))?;
    Ok(Json(json!({ "data": snapshot, "meta": meta() })))
}

async fn get_execution(State(state): State<AppState>, Path(execution_id): Path<ExecutionId>) -> ApiResult {
    let record = state
        .scheduler
        .execution(execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {}", execution_id)))?;
    Ok(Json(json!({ "data": record, "meta": meta() })))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((id, execution_id)): Path<(QueryId, ExecutionId)>,
) -> ApiResult {
    let snapshot = state
        .scheduler
        .snapshot(execution_id)
        .await?
        .filter(|s| s.query_id == id)
        .ok_or_else(|| ApiError::NotFound(format!("snapshot {} of query {}", execution_id, id)))?;
    Ok(Json(json!({ "data": snapshot, "meta": meta() })))
}

async fn field_history(
    State(state): State<AppState>,
    Path((bug_id, field)): Path<(BugId, String)>,
) -> ApiResult {
    let history = state.scheduler.field_history(bug_id, &field).await?;
    Ok(Json(json!({ "data": history, "meta": { "total": history.len() } })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt; // for `oneshot`

    use crate::api::router;
    use crate::api::state::AppState;
    use crate::config::SchedulerConfig;
    use crate::health::HealthMonitor;
    use crate::scheduler::Scheduler;
    use crate::storage::catalog::{Catalog, NewQuery};
    use crate::storage::schema::DEFAULT_WORKPLACE;
    use crate::storage::temp_pool;
    use crate::tracker::scripted::ScriptedTracker;
    use crate::tracker::BugRecord;

    struct Fixture {
        _dir: tempfile::TempDir,
        state: AppState,
        tracker: Arc<ScriptedTracker>,
        query_id: i64,
    }

    fn fixture(enabled: bool) -> Fixture {
        let (dir, pool) = temp_pool();
        let catalog = Catalog::new(pool.clone());
        let query_id = catalog
            .add_query(&NewQuery {
                name: "regressions".into(),
                workplace: DEFAULT_WORKPLACE.into(),
                tracker_filter: "keywords=regression".into(),
                details: None,
                schedule_interval_secs: None,
            })
            .unwrap();
        if !enabled {
            catalog.set_enabled(query_id, false).unwrap();
        }
        let tracker = Arc::new(ScriptedTracker::new());
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(15)));
        let config = SchedulerConfig { backoff_initial_ms: 1, backoff_jitter_ms: 0, ..SchedulerConfig::default() };
        let scheduler = Scheduler::new(pool.clone(), tracker.clone(), config, health);
        let state = AppState { pool, scheduler, heartbeat_window: Duration::from_secs(15) };
        Fixture { _dir: dir, state, tracker, query_id }
    }

    async fn send(state: &AppState, method: &str, uri: &str, body: Body) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1_000_000).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let f = fixture(true);
        let (status, json) = send(&f.state, "GET", "/api/v1/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["scheduler"], "offline");
        assert!(json["meta"]["version"].is_string());

        f.state.scheduler.tick().await;
        let (_, json) = send(&f.state, "GET", "/api/v1/health", Body::empty()).await;
        assert_eq!(json["data"]["scheduler"], "online");
    }

    #[tokio::test]
    async fn test_scheduler_offline_without_heartbeat() {
        let f = fixture(true);
        let (status, json) = send(&f.state, "GET", "/api/v1/service-status/scheduler", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "offline");

        f.state.scheduler.tick().await;
        let (_, json) = send(&f.state, "GET", "/api/v1/service-status", Body::empty()).await;
        assert_eq!(json["data"][0]["service"], "scheduler");
        assert_eq!(json["data"][0]["status"], "online");
    }

    #[tokio::test]
    async fn test_execute_then_read_back() {
        let f = fixture(true);
        f.tracker.push(
            "keywords=regression",
            Ok(vec![BugRecord::new(101).with_field("status", "NEW")]),
        );

        let uri = format!("/api/v1/queries/{}/execute", f.query_id);
        let (status, json) = send(&f.state, "POST", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let execution_id: uuid::Uuid = json["data"]["execution_id"].as_str().unwrap().parse().unwrap();
        f.state.scheduler.wait(execution_id).await.unwrap();

        let (status, json) =
            send(&f.state, "GET", &format!("/api/v1/executions/{}", execution_id), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["outcome"], "success");
        assert_eq!(json["data"]["trigger"], "manual");

        let uri = format!("/api/v1/queries/{}/snapshots/latest", f.query_id);
        let (status, json) = send(&f.state, "GET", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["records"][0]["bug_id"], 101);

        let uri = format!("/api/v1/queries/{}/snapshots/{}", f.query_id, execution_id);
        let (status, _) = send(&f.state, "GET", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let uri = format!("/api/v1/queries/{}/snapshots/{}", f.query_id + 1, execution_id);
        let (status, _) = send(&f.state, "GET", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/api/v1/queries/{}/executions?limit=5", f.query_id);
        let (_, json) = send(&f.state, "GET", &uri, Body::empty()).await;
        assert_eq!(json["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn test_execute_disabled_query_conflicts() {
        let f = fixture(false);
        let uri = format!("/api/v1/queries/{}/execute", f.query_id);
        let (status, json) = send(&f.state, "POST", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "QUERY_DISABLED");
    }

    #[tokio::test]
    async fn test_unknown_query_and_missing_snapshot_are_404() {
        let f = fixture(true);
        let (status, _) = send(&f.state, "POST", "/api/v1/queries/9999/execute", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/api/v1/queries/{}/snapshots/latest", f.query_id);
        let (status, json) = send(&f.state, "GET", &uri, Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_query_listing_includes_state() {
        let f = fixture(true);
        let (status, json) = send(&f.state, "GET", "/api/v1/queries", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["meta"]["total"], 1);
        assert_eq!(json["data"][0]["state"], "idle");
        assert_eq!(json["data"][0]["query"]["name"], "regressions");
    }

    #[tokio::test]
    async fn test_filter_endpoint() {
        let f = fixture(true);
        f.tracker.push("product=Core", Ok(vec![BugRecord::new(3), BugRecord::new(4)]));

        let body = Body::from(r#"{"filter":"product=Core"}"#);
        let (status, json) = send(&f.state, "POST", "/api/v1/queries/test", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["bug_ids"], serde_json::json!([3, 4]));

        let body = Body::from(r#"{"filter":"  "}"#);
        let (status, _) = send(&f.state, "POST", "/api/v1/queries/test", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_history_for_unknown_bug() {
        let f = fixture(true);
        let (status, json) = send(&f.state, "GET", "/api/v1/bugs/42/history/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], serde_json::json!([]));
    }
}
