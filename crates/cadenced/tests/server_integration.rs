//! End-to-end tests: HTTP wake through the serial worker to a terminal run,
//! driven by a scripted stub chat model.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

use cadence_core::config::{AgentConfig, AgentPrompts};
use cadenced::llm::{ChatModel, LlmError, Message, ToolCall, ToolSpec};
use cadenced::runner::{spawn_worker, Runner};
use cadenced::server::{create_router, AppState};
use cadenced::storage::Storage;
use cadenced::tools::report::ReportSuccessTool;
use cadenced::tools::Tool;

const TOKEN: &str = "integration-token";

// --- scripted stub model ---

struct StubState {
    script: Mutex<VecDeque<Result<Message, String>>>,
    delay: Duration,
}

#[derive(Clone)]
struct StubModel {
    state: Arc<StubState>,
}

impl StubModel {
    fn new(script: Vec<Result<Message, String>>) -> Self {
        Self::with_delay(script, Duration::ZERO)
    }

    fn with_delay(script: Vec<Result<Message, String>>, delay: Duration) -> Self {
        Self {
            state: Arc::new(StubState {
                script: Mutex::new(script.into_iter().collect()),
                delay,
            }),
        }
    }
}

#[async_trait]
impl ChatModel for StubModel {
    async fn generate(&self, _messages: &[Message]) -> Result<Message, LlmError> {
        if !self.state.delay.is_zero() {
            tokio::time::sleep(self.state.delay).await;
        }
        match self.state.script.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(reason)) => Err(LlmError::Request {
                provider: "stub".to_string(),
                reason,
            }),
            None => Ok(Message::assistant("script exhausted")),
        }
    }

    fn with_tools(&self, _tools: &[ToolSpec]) -> Arc<dyn ChatModel> {
        Arc::new(self.clone())
    }
}

fn assistant(content: &str) -> Result<Message, String> {
    Ok(Message::assistant(content))
}

fn report_success_call() -> Result<Message, String> {
    let mut message = Message::assistant("");
    message.tool_calls = vec![ToolCall {
        id: "call-1".to_string(),
        name: "report_success".to_string(),
        arguments: r#"{"summary":"done","evidence":"logged"}"#.to_string(),
    }];
    Ok(message)
}

/// Script for one full successful iteration:
/// frame, plan, act round with report_success, act summary round, reflect done.
fn happy_script() -> Vec<Result<Message, String>> {
    vec![
        assistant(r#"{"todo":[],"evidence":[],"notes":["framed"]}"#),
        assistant("the plan"),
        report_success_call(),
        assistant("done"),
        assistant(r#"{"next_stage":"done","summary":"done"}"#),
    ]
}

// --- harness ---

struct TestDaemon {
    router: Router,
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    worker: Option<tokio::task::JoinHandle<()>>,
    _dir: TempDir,
}

impl TestDaemon {
    async fn shutdown(mut self) {
        self.shutdown_tx.send(true).ok();
        if let Some(worker) = self.worker.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
        }
    }
}

fn agent_config(dir: &std::path::Path, max_loops: u32, queue_capacity: usize) -> AgentConfig {
    AgentConfig {
        default_max_loops: max_loops,
        default_deadline: Duration::from_secs(30),
        step_timeout: Duration::from_secs(10),
        max_retry_per_step: 1,
        max_act_rounds: 4,
        queue_capacity,
        enqueue_timeout: Duration::ZERO,
        workspace_dir: dir.join("workspaces"),
        save_loop_memory: false,
        prompts: AgentPrompts {
            frame: "frame for {{ goal }}".to_string(),
            plan: "plan".to_string(),
            act: "act; tools:\n{{ available_tools }}".to_string(),
            reflect: "reflect".to_string(),
        },
    }
}

async fn start_daemon(model: StubModel, max_loops: u32, queue_capacity: usize) -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let storage = Arc::new(storage);
    let cfg = agent_config(dir.path(), max_loops, queue_capacity);

    let base_tools: Vec<Arc<dyn Tool>> = vec![Arc::new(ReportSuccessTool)];
    let runner = Arc::new(Runner::new(
        Arc::clone(&storage),
        Arc::new(model),
        base_tools,
        None,
        cfg.clone(),
        None,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = spawn_worker(Arc::clone(&runner), shutdown_rx);

    let state = Arc::new(AppState {
        storage,
        runner,
        token: TOKEN.to_string(),
        workspace_dir: cfg.workspace_dir.clone(),
        stream_poll_interval: Duration::from_millis(30),
        stream_heartbeat_interval: Duration::from_secs(15),
        started_at: Instant::now(),
    });

    TestDaemon {
        router: create_router(Arc::clone(&state)),
        state,
        shutdown_tx,
        worker: Some(worker),
        _dir: dir,
    }
}

fn wake_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/wake")
        .header("authorization", format!("Bearer {TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll the run until it reaches a terminal status.
async fn wait_for_terminal(daemon: &TestDaemon, run_id: &str) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let response = daemon
            .router
            .clone()
            .oneshot(get_request(&format!("/v1/runs/{run_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let status = body["status"].as_str().unwrap_or_default().to_string();
        if status == "done" || status == "failed" {
            return body;
        }
        assert!(
            Instant::now() < deadline,
            "run {run_id} did not reach a terminal status"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// --- scenarios ---

#[tokio::test]
async fn wake_to_done_happy_path() {
    let daemon = start_daemon(StubModel::new(happy_script()), 3, 10).await;

    let response = daemon
        .router
        .clone()
        .oneshot(wake_request(
            serde_json::json!({"goal": "echo hello", "wake_id": "w1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let wake = body_json(response).await;
    assert_eq!(wake["status"], "queued");
    assert_eq!(wake["existing"], false);
    let run_id = wake["run_id"].as_str().unwrap().to_string();

    let run = wait_for_terminal(&daemon, &run_id).await;
    assert_eq!(run["status"], "done");
    assert_eq!(run["summary"], "done");

    let phases: Vec<&str> = run["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["phase"].as_str().unwrap())
        .collect();
    assert_eq!(phases, vec!["frame", "plan", "act", "reflect", "done"]);
    for (i, step) in run["steps"].as_array().unwrap().iter().enumerate() {
        assert_eq!(step["step_num"], (i + 1) as i64);
        assert_eq!(step["status"], "ok");
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn concurrent_wakes_share_one_run() {
    let daemon = start_daemon(StubModel::new(happy_script()), 3, 50).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let router = daemon.router.clone();
        handles.push(tokio::spawn(async move {
            let response = router
                .oneshot(wake_request(
                    serde_json::json!({"goal": "same goal", "wake_id": "w2"}),
                ))
                .await
                .unwrap();
            let status = response.status();
            (status, body_json(response).await)
        }));
    }

    let mut created = 0;
    let mut run_ids = Vec::new();
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert!(
            status == StatusCode::ACCEPTED || status == StatusCode::OK,
            "unexpected status {status}"
        );
        if body["existing"] == false {
            created += 1;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        run_ids.push(body["run_id"].as_str().unwrap().to_string());
    }

    assert_eq!(created, 1, "exactly one wake must create the run");
    assert!(run_ids.windows(2).all(|w| w[0] == w[1]));

    daemon.shutdown().await;
}

#[tokio::test]
async fn queue_backpressure_returns_503() {
    // Keep the worker busy so the queue stays full: the model sleeps long
    // enough for a second wake to hit a capacity-1 queue.
    let slow = StubModel::with_delay(happy_script(), Duration::from_millis(300));
    let daemon = start_daemon(slow, 3, 1).await;

    let first = daemon
        .router
        .clone()
        .oneshot(wake_request(serde_json::json!({"goal": "a", "wake_id": "a"})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    // Fill the queue slot while the worker chews on run A.
    let second = daemon
        .router
        .clone()
        .oneshot(wake_request(serde_json::json!({"goal": "b", "wake_id": "b"})))
        .await
        .unwrap();
    let third = daemon
        .router
        .clone()
        .oneshot(wake_request(serde_json::json!({"goal": "c", "wake_id": "c"})))
        .await
        .unwrap();

    // One of the follow-ups must hit backpressure.
    let statuses = [second.status(), third.status()];
    assert!(
        statuses.contains(&StatusCode::SERVICE_UNAVAILABLE),
        "expected one 503, got {statuses:?}"
    );
    if second.status() == StatusCode::SERVICE_UNAVAILABLE {
        let body = body_json(second).await;
        assert_eq!(body["error"], "runner queue is full; retry later");
    }

    daemon.shutdown().await;
}

#[tokio::test]
async fn completion_gate_failure_is_reported() {
    // Reflect claims done but report_success is never called; with two loops
    // the run must fail with the gate-specific reason.
    let script = vec![
        assistant("{}"),
        assistant("plan 1"),
        assistant("acted 1"),
        assistant(r#"{"next_stage":"done","summary":"x"}"#),
        assistant("plan 2"),
        assistant("acted 2"),
        assistant(r#"{"next_stage":"done","summary":"x"}"#),
    ];
    let daemon = start_daemon(StubModel::new(script), 2, 10).await;

    let response = daemon
        .router
        .clone()
        .oneshot(wake_request(serde_json::json!({"goal": "never reports"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let run_id = body_json(response).await["run_id"]
        .as_str()
        .unwrap()
        .to_string();

    let run = wait_for_terminal(&daemon, &run_id).await;
    assert_eq!(run["status"], "failed");
    assert!(run["error"]
        .as_str()
        .unwrap()
        .contains("without required report_success call"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn sse_stream_reports_steps_and_closes() {
    // Slow the model slightly so the subscription sees the run in flight.
    let slow = StubModel::with_delay(happy_script(), Duration::from_millis(60));
    let daemon = start_daemon(slow, 3, 10).await;

    let response = daemon
        .router
        .clone()
        .oneshot(wake_request(serde_json::json!({"goal": "streamed"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let run_id = body_json(response).await["run_id"]
        .as_str()
        .unwrap()
        .to_string();

    let stream_response = daemon
        .router
        .clone()
        .oneshot(get_request(&format!("/v1/runs/{run_id}/events")))
        .await
        .unwrap();
    assert_eq!(stream_response.status(), StatusCode::OK);
    assert_eq!(
        stream_response
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap_or("")),
        Some("text/event-stream")
    );

    // The stream ends at the terminal status, so the whole body is readable.
    let body = tokio::time::timeout(
        Duration::from_secs(10),
        stream_response.into_body().collect(),
    )
    .await
    .expect("stream must close when the run finishes")
    .unwrap()
    .to_bytes();
    let text = String::from_utf8_lossy(&body);

    assert!(text.contains("event: snapshot"));
    assert!(text.contains("event: step.created"));
    assert!(text.contains("event: stream.closed"));
    assert!(text.contains("\"phase\":\"frame\""));
    assert!(text.contains("\"phase\":\"done\""));

    // The run itself finished cleanly.
    let run = wait_for_terminal(&daemon, &run_id).await;
    assert_eq!(run["status"], "done");

    daemon.shutdown().await;
}

#[tokio::test]
async fn recovery_reenqueues_interrupted_runs() {
    let daemon = start_daemon(StubModel::new(happy_script()), 3, 10).await;

    // Simulate a run orphaned by a crash: inserted and marked running with no
    // worker having touched it.
    let (orphan, _) = daemon
        .state
        .storage
        .create_run("orphan", None, None, None)
        .await
        .unwrap();
    daemon
        .state
        .storage
        .update_run_status(
            orphan.id.as_ref(),
            cadence_core::RunStatus::Running,
            None,
            None,
        )
        .await
        .unwrap();

    daemon.state.runner.recover_runs().await.unwrap();

    let run = wait_for_terminal(&daemon, orphan.id.as_ref()).await;
    assert_eq!(run["status"], "done");

    daemon.shutdown().await;
}
