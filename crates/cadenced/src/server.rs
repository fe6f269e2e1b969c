//! HTTP control plane: wake, inspect, and watch runs.
//!
//! All endpoints except `/healthz` require bearer auth. The events endpoint is
//! a poll-and-diff SSE view over the store; change detection uses content
//! fingerprints, not notifications.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use cadence_core::events::{run_fingerprint, step_fingerprint, StreamEvent};
use cadence_core::{Run, RunStatus, Step};

use crate::runner::{Runner, RunnerError};
use crate::storage::Storage;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub runner: Arc<Runner>,
    pub token: String,
    pub workspace_dir: PathBuf,
    pub stream_poll_interval: Duration,
    pub stream_heartbeat_interval: Duration,
    pub started_at: Instant,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/wake", post(wake))
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/{run_id}", get(get_run))
        .route("/v1/runs/{run_id}/workspace", get(run_workspace))
        .route("/v1/runs/{run_id}/events", get(run_events))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            bearer_auth,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

/// Bearer token auth: constant-time comparison, empty tokens never match.
async fn bearer_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let auth = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth) = auth else {
        return error_response(StatusCode::UNAUTHORIZED, "missing Authorization header");
    };
    let Some(token) = auth.strip_prefix("Bearer ") else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "invalid Authorization header format",
        );
    };
    let token = token.trim();
    if token.is_empty() {
        return error_response(StatusCode::UNAUTHORIZED, "missing token");
    }
    if !constant_time_equal(token, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid token");
    }

    next.run(request).await
}

fn constant_time_equal(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// --- Request/response types ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct WakeRequest {
    #[serde(default)]
    pub wake_id: Option<String>,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub constraints: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct WakeResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub existing: bool,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub goal: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<Step>,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceFileEntry {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceInventoryResponse {
    pub run_id: String,
    pub file_count: usize,
    pub total_size_bytes: u64,
    pub files: Vec<WorkspaceFileEntry>,
}

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
}

// --- Handlers ---

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthzResponse {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// POST /v1/wake: create or rejoin a run, then enqueue it.
async fn wake(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WakeRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "invalid JSON body");
    };
    if req.goal.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "goal is required");
    }

    let created = state
        .storage
        .create_run(
            &req.goal,
            req.wake_id.as_deref(),
            req.context.as_ref(),
            req.constraints.as_ref(),
        )
        .await;
    let (run, existing) = match created {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to create run");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create run");
        }
    };

    // Always try to enqueue queued runs so a retry can re-enqueue a run whose
    // earlier wake hit backpressure.
    if run.status == RunStatus::Queued {
        if let Err(e) = state.runner.enqueue(run.id.as_ref()).await {
            warn!(run_id = %run.id, existing, error = %e, "failed to enqueue run");
            let message = match e {
                RunnerError::QueueFull => "runner queue is full; retry later",
                _ => "runner unavailable",
            };
            return error_response(StatusCode::SERVICE_UNAVAILABLE, message);
        }
    }

    info!(run_id = %run.id, existing, goal = %req.goal, "wake request processed");

    let status = if existing {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (
        status,
        Json(WakeResponse {
            run_id: run.id.to_string(),
            status: run.status,
            existing,
        }),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

/// GET /v1/runs?status=<status>; status defaults to `running`.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    let status = query.status.as_deref().unwrap_or("running");
    let runs = match state.storage.list_runs_by_status(status).await {
        Ok(runs) => runs,
        Err(e) => {
            error!(status = %status, error = %e, "failed to list runs");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to list runs");
        }
    };

    let out: Vec<RunSummary> = runs
        .into_iter()
        .map(|run| RunSummary {
            id: run.id.to_string(),
            goal: run.goal,
            status: run.status,
            created_at: run.created_at,
        })
        .collect();
    Json(out).into_response()
}

/// GET /v1/runs/{run_id}: the full run plus its ordered steps.
async fn get_run(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> Response {
    let run = match state.storage.get_run(&run_id).await {
        Ok(run) => run,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "run not found"),
    };

    let steps = match state.storage.steps_by_run(&run_id).await {
        Ok(steps) => steps,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "failed to get steps");
            Vec::new()
        }
    };

    Json(RunDetailResponse { run, steps }).into_response()
}

/// GET /v1/runs/{run_id}/workspace: file inventory of the run's workspace.
async fn run_workspace(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    if state.storage.get_run(&run_id).await.is_err() {
        return error_response(StatusCode::NOT_FOUND, "run not found");
    }

    let root = state.workspace_dir.join(&run_id);
    let mut files = Vec::new();
    let mut total_size = 0u64;

    if root.is_dir() {
        for entry in walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            total_size += size;
            files.push(WorkspaceFileEntry {
                path: rel,
                size_bytes: size,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
    }

    Json(WorkspaceInventoryResponse {
        run_id,
        file_count: files.len(),
        total_size_bytes: total_size,
        files,
    })
    .into_response()
}

/// GET /v1/runs/{run_id}/events: SSE stream of run/step changes.
async fn run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, Response> {
    let run = match state.storage.get_run(&run_id).await {
        Ok(run) => run,
        Err(_) => return Err(error_response(StatusCode::NOT_FOUND, "run not found")),
    };

    let steps = match state.storage.steps_by_run(&run_id).await {
        Ok(steps) => steps,
        Err(e) => {
            error!(run_id = %run_id, error = %e, "failed to get steps for stream snapshot");
            Vec::new()
        }
    };

    let run_fp = run_fingerprint(&run);
    let step_fps: HashMap<String, String> = steps
        .iter()
        .map(|s| (s.id.to_string(), step_fingerprint(s)))
        .collect();

    let terminal = run.status.is_terminal();
    let mut initial = vec![StreamEvent::snapshot(run.clone(), steps)];
    if terminal {
        initial.push(StreamEvent::stream_closed(&run_id, run.status));
    }

    let poll_interval = state.stream_poll_interval;
    let poll = PollState {
        storage: Arc::clone(&state.storage),
        run_id,
        run_fp,
        step_fps,
        done: terminal,
    };

    let updates = stream::unfold(poll, move |mut st| async move {
        if st.done {
            return None;
        }
        tokio::time::sleep(poll_interval).await;

        let mut events = Vec::new();
        let current = match st.storage.get_run(&st.run_id).await {
            Ok(run) => run,
            Err(_) => {
                events.push(StreamEvent::error(&st.run_id, "run not found"));
                st.done = true;
                return Some((events, st));
            }
        };

        let fp = run_fingerprint(&current);
        if fp != st.run_fp {
            st.run_fp = fp;
            events.push(StreamEvent::run_updated(current.clone()));
        }

        match st.storage.steps_by_run(&st.run_id).await {
            Ok(steps) => {
                for step in steps {
                    let fp = step_fingerprint(&step);
                    let id = step.id.to_string();
                    match st.step_fps.get(&id).cloned() {
                        None => {
                            st.step_fps.insert(id, fp);
                            events.push(StreamEvent::step_created(&st.run_id, step));
                        }
                        Some(prev) if prev != fp => {
                            st.step_fps.insert(id, fp);
                            events.push(StreamEvent::step_updated(&st.run_id, step));
                        }
                        Some(_) => {}
                    }
                }
            }
            Err(e) => {
                error!(run_id = %st.run_id, error = %e, "failed to get steps for stream update");
            }
        }

        if current.status.is_terminal() {
            events.push(StreamEvent::stream_closed(&st.run_id, current.status));
            st.done = true;
        }

        Some((events, st))
    });

    let stream = stream::iter(initial)
        .chain(updates.flat_map(stream::iter))
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok(SseEvent::default().event(event.name()).data(data))
        });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.stream_heartbeat_interval)
            .text("keepalive"),
    ))
}

struct PollState {
    storage: Arc<Storage>,
    run_id: String,
    run_fp: String,
    step_fps: HashMap<String, String>,
    done: bool,
}
