//! HTTP surface tests against the assembled router

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use helpers::{harness, martian_catalog, martian_ratings, Mode, ScriptedProvider};
use http_body_util::BodyExt;
use libris_agg::config::ImportConfig;
use libris_agg::import::{HttpListSources, JobRunner};
use libris_agg::AppState;
use libris_agg::types::ProviderId;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

struct TestApp {
    router: Router,
    catalog: Arc<ScriptedProvider>,
}

async fn create_test_app() -> TestApp {
    let catalog = Arc::new(ScriptedProvider::new(ProviderId::Catalog, vec![martian_catalog()]));
    let ratings = Arc::new(ScriptedProvider::new(ProviderId::Ratings, vec![martian_ratings()]));
    let h = harness(vec![catalog.clone(), ratings]).await;

    let sources = HttpListSources::new(&ImportConfig::default(), &Default::default()).unwrap();
    let jobs = Arc::new(JobRunner::new(
        h.pool.clone(),
        h.orchestrator.clone(),
        Arc::new(sources),
        ImportConfig::default(),
        h.events.clone(),
    ));
    let state = AppState::new(h.pool, h.orchestrator, jobs, h.events);

    TestApp {
        router: libris_agg::build_router(state),
        catalog,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_reports_closed_circuits() {
    let app = create_test_app().await;
    let (status, body) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "libris-agg");
    assert_eq!(body["providers"]["catalog"], "closed");
    assert_eq!(body["providers"]["ratings"], "closed");
}

#[tokio::test]
async fn test_search_returns_merged_books() {
    let app = create_test_app().await;
    let (status, body) = send(&app.router, get("/search?title=The%20Martian&author=Andy%20Weir")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["books"][0]["title"], "The Martian");
    assert_eq!(body["books"][0]["rating"], 4.41);
}

#[tokio::test]
async fn test_search_without_terms_is_bad_request() {
    let app = create_test_app().await;
    let (status, body) = send(&app.router, get("/search?language=en")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_search_with_no_match_is_not_found() {
    let app = create_test_app().await;
    app.catalog.set_mode(Mode::Empty);
    let (status, _) = send(&app.router, get("/search?title=Nothing&providers=catalog")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_search_with_every_provider_down_is_unavailable() {
    let app = create_test_app().await;
    app.catalog.set_mode(Mode::Fail);
    let (status, body) = send(&app.router, get("/search?title=Dune&providers=catalog")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "UNAVAILABLE");
}

#[tokio::test]
async fn test_book_by_identifier_and_invalidate() {
    let app = create_test_app().await;

    let (status, body) = send(&app.router, get("/book/catalog:B00B5HZGUG")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "The Martian");

    // Bare ASIN resolves to the same record without another provider call
    let (status, _) = send(&app.router, get("/book/B00B5HZGUG")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.catalog.calls(), 1);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/cache/catalog:B00B5HZGUG")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["durable_removed"], 1);

    let (status, _) = send(&app.router, get("/book/not-an-id")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_fast_cache_listing_and_clear() {
    let app = create_test_app().await;
    send(&app.router, get("/search?title=The%20Martian")).await;

    let (status, body) = send(&app.router, get("/cache/fast")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(|a| a.len()), Some(1));
    assert_eq!(body[0]["titles"][0], "The Martian");

    let clear = Request::builder()
        .method("DELETE")
        .uri("/cache")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, clear).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "all");

    let (_, body) = send(&app.router, get("/cache/fast")).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_import_of_unsupported_url_is_rejected() {
    let app = create_test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/lists/import")
        .header("content-type", "application/json")
        .body(Body::from(json!({"url": "https://example.org/list/1"}).to_string()))
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("unsupported"));

    let (status, body) = send(&app.router, get("/lists/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = create_test_app().await;
    let uri = format!("/lists/jobs/{}", uuid::Uuid::new_v4());
    let (status, _) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_provider_stats_after_lookup() {
    let app = create_test_app().await;
    send(&app.router, get("/search?title=The%20Martian")).await;

    // The recorder is not running in tests, so the table is empty but served
    let (status, body) = send(&app.router, get("/stats/providers")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_array());
}
