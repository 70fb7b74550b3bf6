use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use flow_runner::web;
use flow_runner::worker::{Worker, WorkerOptions};

fn options() -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(20),
    }
}

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn eventually_running(app: &Router, want: bool) -> bool {
    for _ in 0..250 {
        let (_, body) = call(app, "GET", "/status").await;
        if body == json!({ "running": want }) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Worker whose task blocks until the returned sender fires.
fn gated_worker() -> (Worker, mpsc::Sender<()>) {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let worker = Worker::spawn(
        move || {
            if let Ok(rx) = release_rx.lock() {
                let _ = rx.recv_timeout(Duration::from_secs(5));
            }
        },
        options(),
    )
    .expect("spawn worker");
    (worker, release_tx)
}

#[tokio::test]
async fn status_of_a_fresh_worker_is_not_running() {
    let (worker, _release) = gated_worker();
    let app = web::app(worker.clone());

    let (status, body) = call(&app, "GET", "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "running": false }));

    worker.request_exit();
}

#[tokio::test]
async fn start_is_accepted_once_and_refused_while_busy() {
    let (worker, release) = gated_worker();
    let app = web::app(worker.clone());

    let (status, body) = call(&app, "GET", "/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "result": true }));
    assert!(eventually_running(&app, true).await);

    let (_, body) = call(&app, "GET", "/start").await;
    assert_eq!(body, json!({ "result": false }));

    release.send(()).expect("release task");
    assert!(eventually_running(&app, false).await);

    let (_, body) = call(&app, "GET", "/start").await;
    assert_eq!(body, json!({ "result": true }));

    worker.request_exit();
    release.send(()).ok();
}

#[tokio::test]
async fn exit_is_accepted_and_stops_the_worker() {
    let (worker, _release) = gated_worker();
    let app = web::app(worker.clone());

    let (status, body) = call(&app, "POST", "/exit").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, Value::Null);
    assert!(worker.exit_requested());

    let worker_for_join = worker.clone();
    tokio::task::spawn_blocking(move || worker_for_join.join())
        .await
        .expect("join task")
        .expect("worker join");
    assert!(worker.is_finished());
}

#[tokio::test]
async fn exit_requires_post() {
    let (worker, _release) = gated_worker();
    let app = web::app(worker.clone());

    let (status, _) = call(&app, "GET", "/exit").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(!worker.exit_requested());

    worker.request_exit();
}

#[tokio::test]
async fn serve_shuts_down_on_cancel() {
    let (worker, _release) = gated_worker();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let cancel = tokio_util::sync::CancellationToken::new();
    let server = tokio::spawn(web::serve(listener, worker.clone(), cancel.clone()));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops after cancel")
        .expect("server task")
        .expect("serve result");

    worker.request_exit();
}
