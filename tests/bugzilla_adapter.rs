//! Bugzilla adapter against an in-process fake of the `/rest/bug` endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use bugtriage::config::TrackerConfig;
use bugtriage::tracker::bugzilla::BugzillaTracker;
use bugtriage::tracker::{FetchError, FieldValue, TrackerAdapter};

async fn rest_bug(Query(params): Query<HashMap<String, String>>) -> axum::response::Response {
    if let Some(ids) = params.get("id") {
        // Detail pages: bugs 3 and 4 sit on a page the server cannot serve.
        if ids.contains('3') {
            return (StatusCode::SERVICE_UNAVAILABLE, "upstream busy").into_response();
        }
        let bugs: Vec<_> = ids
            .split(',')
            .map(|id| {
                json!({
                    "id": id.parse::<i64>().unwrap(),
                    "status": "NEW",
                    "priority": "P2",
                    "resolution": null
                })
            })
            .collect();
        return Json(json!({ "bugs": bugs })).into_response();
    }

    match params.get("product").map(String::as_str) {
        Some("Core") => Json(json!({ "bugs": [{"id": 1}, {"id": 2}] })).into_response(),
        Some("Big") => Json(json!({ "bugs": [{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}] })).into_response(),
        Some("Throttled") => (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": true, "message": "The product does not exist" })),
        )
            .into_response(),
    }
}

async fn spawn_fake_bugzilla() -> SocketAddr {
    let app = Router::new().route("/rest/bug", get(rest_bug));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn tracker(addr: SocketAddr) -> BugzillaTracker {
    let config = TrackerConfig {
        base_url: format!("http://{}/", addr),
        page_size: 2,
        request_timeout_secs: 5,
        ..TrackerConfig::default()
    };
    BugzillaTracker::new(&config).unwrap()
}

#[tokio::test]
async fn fetch_returns_requested_fields_only() {
    let addr = spawn_fake_bugzilla().await;
    let records = tracker(addr)
        .fetch(
            "https://bugzilla.example.org/buglist.cgi?product=Core",
            &["status".to_string(), "resolution".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].bug_id, 1);
    assert_eq!(records[0].fields["status"], FieldValue::from("NEW"));
    assert_eq!(records[0].fields["resolution"], FieldValue::Unset);
    assert!(!records[0].fields.contains_key("priority"));
}

#[tokio::test]
async fn failure_after_first_page_is_partial() {
    let addr = spawn_fake_bugzilla().await;
    let err = tracker(addr)
        .fetch("product=Big", &["status".to_string()])
        .await
        .unwrap_err();

    match err {
        FetchError::Partial { records, source } => {
            assert_eq!(records.iter().map(|r| r.bug_id).collect::<Vec<_>>(), vec![1, 2]);
            assert!(source.is_transient());
        }
        other => panic!("expected partial, got {:?}", other),
    }
}

#[tokio::test]
async fn tracker_rejection_is_permanent() {
    let addr = spawn_fake_bugzilla().await;
    let err = tracker(addr).fetch("product=Nope", &[]).await.unwrap_err();
    match err {
        FetchError::Permanent(message) => assert!(message.contains("does not exist")),
        other => panic!("expected permanent, got {:?}", other),
    }
}

#[tokio::test]
async fn rate_limit_is_transient() {
    let addr = spawn_fake_bugzilla().await;
    let err = tracker(addr).test_filter("product=Throttled").await.unwrap_err();
    assert!(matches!(err, FetchError::Transient(_)));
}

#[tokio::test]
async fn unreachable_tracker_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = tracker(addr).fetch("product=Core", &[]).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_filter_lists_matching_ids() {
    let addr = spawn_fake_bugzilla().await;
    let ids = tracker(addr).test_filter("product=Big").await.unwrap();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}
