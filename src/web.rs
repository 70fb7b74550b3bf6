use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::worker::Worker;

#[derive(Clone)]
struct AppState {
    worker: Worker,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    result: bool,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
}

/// Control surface over the worker: `GET /start`, `GET /status`, `POST /exit`.
pub fn app(worker: Worker) -> Router {
    Router::new()
        .route("/start", get(start))
        .route("/status", get(status))
        .route("/exit", post(exit))
        .with_state(AppState { worker })
}

/// Serves the control surface until `cancel` fires.
pub async fn serve(listener: TcpListener, worker: Worker, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("reading listener address")?;
    info!(%addr, "control surface listening");
    axum::serve(listener, app(worker))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("control surface exited")?;
    Ok(())
}

async fn start(State(state): State<AppState>) -> Json<StartResponse> {
    let result = state.worker.request_start();
    info!(accepted = result, "start requested over http");
    Json(StartResponse { result })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: state.worker.is_running(),
    })
}

async fn exit(State(state): State<AppState>) -> StatusCode {
    state.worker.request_exit();
    StatusCode::ACCEPTED
}
