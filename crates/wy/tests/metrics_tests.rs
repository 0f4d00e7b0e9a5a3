mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::{Body, Method, Request, StatusCode};
use wy::server::{Route, FOUND_HANDLER};
use wy::App;
use wy_common::TimingProfile;

use common::{app, duration_samples, request_count};

async fn call(app: &App, method: Method, path: &str) -> (StatusCode, Bytes) {
    let req = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let response = app.handle(req).await;
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, body)
}

#[test]
fn routes_are_matched_by_path() {
    assert_eq!(Route::from_path("/"), Route::Found);
    assert_eq!(Route::from_path("/anything/else"), Route::Found);
    assert_eq!(Route::from_path("/404"), Route::NotFound);
    assert_eq!(Route::from_path("/500"), Route::ServerError);
    assert_eq!(Route::from_path("/metrics"), Route::Metrics);
}

#[tokio::test]
async fn success_route_counts_and_times_every_request() {
    let app = app(TimingProfile::default());

    for expected_id in 1..=7u64 {
        let (status, body) = call(&app, Method::GET, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with(format!(": {}", expected_id).as_bytes()));
    }

    assert_eq!(request_count(app.metrics(), "200", "GET"), 7);
    let (count, _) = duration_samples(app.metrics(), "200", FOUND_HANDLER, "GET");
    assert_eq!(count, 7);
}

#[tokio::test]
async fn duration_covers_all_phases() {
    let profile = TimingProfile::new(
        Duration::from_millis(10),
        Duration::from_millis(10),
        Duration::from_millis(10),
    );
    let app = app(profile);

    call(&app, Method::GET, "/").await;

    let (count, sum) = duration_samples(app.metrics(), "200", FOUND_HANDLER, "GET");
    assert_eq!(count, 1);
    assert!(sum >= profile.time_to_last_byte().as_secs_f64());
}

#[tokio::test]
async fn error_routes_are_counted_by_written_status() {
    let app = app(TimingProfile::default());

    for _ in 0..2 {
        let (status, body) = call(&app, Method::GET, "/404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(&body[..], b"Not Found");
    }
    for _ in 0..3 {
        let (status, body) = call(&app, Method::GET, "/500").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(&body[..], b"Internal Server Error");
    }

    assert_eq!(request_count(app.metrics(), "404", "GET"), 2);
    assert_eq!(request_count(app.metrics(), "500", "GET"), 3);
    assert_eq!(request_count(app.metrics(), "200", "GET"), 0);
    assert_eq!(duration_samples(app.metrics(), "404", FOUND_HANDLER, "GET").0, 0);
    assert_eq!(app.engine().counter().issued(), 0);
}

#[tokio::test]
async fn method_is_part_of_the_attribution() {
    let app = app(TimingProfile::default());

    call(&app, Method::POST, "/").await;
    call(&app, Method::GET, "/").await;

    assert_eq!(request_count(app.metrics(), "200", "POST"), 1);
    assert_eq!(request_count(app.metrics(), "200", "GET"), 1);
    assert_eq!(duration_samples(app.metrics(), "200", FOUND_HANDLER, "POST").0, 1);
}

#[tokio::test]
async fn abandoned_body_is_still_observed() {
    let app = app(TimingProfile::new(
        Duration::ZERO,
        Duration::from_millis(50),
        Duration::ZERO,
    ));

    let req = Request::get("/").body(Body::empty()).unwrap();
    let response = app.handle(req).await;
    drop(response);

    assert_eq!(duration_samples(app.metrics(), "200", FOUND_HANDLER, "GET").0, 1);
}

#[tokio::test]
async fn concurrent_requests_lose_no_updates() {
    let app = Arc::new(app(TimingProfile::new(
        Duration::from_millis(5),
        Duration::ZERO,
        Duration::from_millis(5),
    )));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let app = Arc::clone(&app);
            tokio::spawn(async move { call(&app, Method::GET, "/").await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().0, StatusCode::OK);
    }

    assert_eq!(request_count(app.metrics(), "200", "GET"), 32);
    assert_eq!(duration_samples(app.metrics(), "200", FOUND_HANDLER, "GET").0, 32);
}

#[tokio::test]
async fn metrics_route_exposes_aggregates_and_version() {
    let app = app(TimingProfile::default());
    call(&app, Method::GET, "/").await;
    call(&app, Method::GET, "/404").await;

    let (status, body) = call(&app, Method::GET, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("http_request_duration_seconds_bucket"));
    assert!(text.contains(r#"version{version="test"} 1"#));

    // Scraping is not itself a counted request.
    assert_eq!(request_count(app.metrics(), "200", "GET"), 1);
}
