//! HTTP API tests. Requests go straight to the router; nothing binds a port.


use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use job_orchestrator::api::{router, ApiState};
use test_harness::{job, Harness};

fn app(h: &Harness) -> Router {
    router(ApiState {
        scheduler: h.scheduler.clone(),
        metrics: h.metrics.clone(),
    })
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn definition(id: &str) -> Value {
    json!({
        "job_id": id,
        "name": format!("{id} training"),
        "image": "trainer:latest",
        "command": ["python", "train.py"],
        "schedule": "0 3 * * *",
        "priority": "high",
        "max_retries": 2,
        "enabled": false
    })
}

#[tokio::test]
async fn test_health() {
    let h = Harness::builder().build();
    let (status, body) = send(app(&h), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["scheduler_running"], false);
}

#[tokio::test]
async fn test_create_and_fetch_job() {
    let h = Harness::builder().build();

    let (status, body) = send(app(&h), "POST", "/jobs", Some(definition("bert"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["job"]["job_id"], "bert");
    assert_eq!(body["priority"], "high");
    assert_eq!(body["job"]["max_retries"], 2);
    assert_eq!(body["job"]["status"], "pending");

    let (status, body) = send(app(&h), "GET", "/jobs/bert", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["name"], "bert training");
    assert_eq!(body["next_fire"], Value::Null);

    let (status, body) = send(app(&h), "POST", "/jobs", Some(definition("bert"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("bert"));
}

#[tokio::test]
async fn test_invalid_definitions_are_bad_requests() {
    let h = Harness::builder().build();

    let mut bad_cron = definition("bad");
    bad_cron["schedule"] = json!("whenever");
    let (status, _) = send(app(&h), "POST", "/jobs", Some(bad_cron)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut orphan = definition("orphan");
    orphan["dependencies"] = json!(["ghost"]);
    let (status, body) = send(app(&h), "POST", "/jobs", Some(orphan)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn test_missing_job_is_not_found() {
    let h = Harness::builder().build();
    for (method, uri) in [
        ("GET", "/jobs/nope"),
        ("DELETE", "/jobs/nope"),
        ("POST", "/jobs/nope/retry"),
        ("POST", "/jobs/nope/trigger"),
    ] {
        let (status, body) = send(app(&h), method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn test_list_filters_and_paginates() {
    let h = Harness::builder().build();
    for id in ["a", "b", "c"] {
        h.scheduler.register(job(id)).await.unwrap();
    }

    let (status, body) = send(app(&h), "GET", "/jobs?limit=2&offset=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    let ids: Vec<&str> = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["job"]["job_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["b", "c"]);

    let (status, body) = send(app(&h), "GET", "/jobs?status=completed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);

    let (status, _) = send(app(&h), "GET", "/jobs?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_and_delete() {
    let h = Harness::builder().build();
    h.scheduler.register(job("tune")).await.unwrap();

    let (status, body) = send(
        app(&h),
        "PUT",
        "/jobs/tune",
        Some(json!({ "image": "trainer:v2", "max_concurrent": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["image"], "trainer:v2");
    assert_eq!(body["max_concurrent"], 2);

    let (status, body) = send(app(&h), "DELETE", "/jobs/tune", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], "tune");
    assert!(h.scheduler.get("tune").await.is_none());
}

#[tokio::test]
async fn test_trigger_and_retry_report_decision() {
    let h = Harness::builder().build();
    h.scheduler.register(job("kick")).await.unwrap();

    let (status, body) = send(app(&h), "POST", "/jobs/kick/trigger", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job_id"], "kick");
    assert_eq!(body["decision"], "enqueued");

    // Pending is not a terminal state.
    let (status, _) = send(app(&h), "POST", "/jobs/kick/retry", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_shutting_down_is_unavailable() {
    let h = Harness::builder().build();
    h.scheduler.shutdown().await;

    let (status, _) = send(app(&h), "POST", "/jobs", Some(definition("late"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stats_status_and_metrics() {
    let h = Harness::builder().build();
    h.scheduler.register(job("one")).await.unwrap();
    h.scheduler.trigger_now("one").await.unwrap();

    let (status, body) = send(app(&h), "GET", "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["pending"], 1);

    let (status, body) = send(app(&h), "GET", "/scheduler/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance_id"], "test-instance");
    assert_eq!(body["queue_depth"], 1);
    assert_eq!(body["executor_backend"], "scripted");

    let (status, body) = send(app(&h), "GET", "/metrics.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs_registered"], 1);
    assert_eq!(body["enqueued"], 1);
}

#[tokio::test]
async fn test_metrics_use_prometheus_text_format() {
    let h = Harness::builder().build();
    h.scheduler.register(job("one")).await.unwrap();
    h.scheduler.register(job("two")).await.unwrap();

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4; charset=utf-8"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("# TYPE training_jobs_registered_total counter\n"));
    assert!(text.contains("training_jobs_registered_total 2\n"));
    assert!(text.contains("training_jobs{status=\"pending\"} 2\n"));
    assert!(text.contains("training_jobs{status=\"failed\"} 0\n"));
}
