//! Integration tests for the submit / status / stream HTTP contract.
//!
//! Each test spins up an Axum server on a random port, drives it with
//! reqwest, and reads the SSE stream as raw frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::timeout;

use taskrelay::bus::NotificationBus;
use taskrelay::config::RelayConfig;
use taskrelay::gateway::router;
use taskrelay::runtime::TaskRuntime;
use taskrelay::task::builtin::{EchoTask, SendEmailTask};
use taskrelay::task::{Outcome, TaskHandler, TaskRegistry};
use taskrelay::worker::ProgressReporter;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocks until the test opens the gate.
struct Gated {
    gate: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn run(&self, _input: Value, _progress: ProgressReporter) -> Outcome {
        self.gate.notified().await;
        Outcome::Success(json!("released"))
    }
}

struct Server {
    base: String,
    bus: Arc<NotificationBus>,
    gate: Arc<Notify>,
    _runtime: TaskRuntime,
}

/// Start a runtime plus Axum server on a random port.
async fn start_server() -> Server {
    let gate = Arc::new(Notify::new());
    let registry = Arc::new(TaskRegistry::new());
    registry.register(Arc::new(EchoTask));
    registry.register(Arc::new(SendEmailTask::new(Duration::from_millis(20))));
    registry.register(Arc::new(Gated { gate: gate.clone() }));

    let config = RelayConfig {
        ping_interval: Duration::from_millis(100),
        ..RelayConfig::default()
    };
    let mut runtime = TaskRuntime::new(config, registry).await.unwrap();
    runtime.start();
    let app = router(runtime.app_state());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        bus: runtime.bus().clone(),
        gate,
        _runtime: runtime,
    }
}

async fn submit(base: &str, task: &str, input: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{base}/submit"))
        .json(&json!({ "task": task, "input": input }))
        .send()
        .await
        .unwrap()
}

async fn submit_ok(base: &str, task: &str, input: Value) -> String {
    let resp = submit(base, task, input).await;
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    body["taskId"].as_str().unwrap().to_string()
}

async fn status(base: &str, id: &str) -> (u16, Value) {
    let resp = reqwest::get(format!("{base}/status/{id}")).await.unwrap();
    let code = resp.status().as_u16();
    (code, resp.json().await.unwrap())
}

/// One parsed SSE frame.
#[derive(Debug)]
struct Frame {
    event: String,
    data: Value,
}

/// Incremental SSE reader over a reqwest body.
struct SseReader {
    body: futures_util::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: String,
}

impl SseReader {
    fn new(resp: reqwest::Response) -> Self {
        Self {
            body: resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed(),
            buf: String::new(),
        }
    }

    /// Next frame, or `None` when the server closed the stream.
    async fn next(&mut self) -> Option<Frame> {
        loop {
            if let Some(end) = self.buf.find("\n\n") {
                let raw: String = self.buf.drain(..end + 2).collect();
                let mut event = String::from("message");
                let mut data = String::new();
                for line in raw.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        event = v.trim().to_string();
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data.push_str(v.trim_start());
                    }
                }
                if data.is_empty() {
                    continue;
                }
                return Some(Frame {
                    event,
                    data: serde_json::from_str(&data).unwrap(),
                });
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.push_str(&String::from_utf8_lossy(&chunk)),
                _ => return None,
            }
        }
    }
}

async fn open_stream(base: &str, id: &str) -> SseReader {
    let resp = reqwest::get(format!("{base}/stream/{id}")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    SseReader::new(resp)
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let body: Value = reqwest::get(format!("{}/health", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "taskrelay");
        assert!(body["queue"]["pending"].is_number());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn immediate_success_is_visible_by_polling() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let id = submit_ok(&server.base, "echo", json!({"greeting": "hi"})).await;

        // Known immediately, never "unknown".
        let (code, _) = status(&server.base, &id).await;
        assert_eq!(code, 200);

        loop {
            let (code, body) = status(&server.base, &id).await;
            assert_eq!(code, 200);
            if body["phase"] == "SUCCESS" {
                assert_eq!(body["result"], json!({"greeting": "hi"}));
                assert_eq!(body["percent"], 100);
                assert_eq!(body["taskId"], id.as_str());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let missing = uuid::Uuid::new_v4().to_string();

        let (code, body) = status(&server.base, &missing).await;
        assert_eq!(code, 404);
        assert!(body["error"].as_str().unwrap().contains(&missing));

        let (code, _) = status(&server.base, "not-a-task-id").await;
        assert_eq!(code, 400);

        let resp = reqwest::get(format!("{}/stream/{missing}", server.base)).await.unwrap();
        assert_eq!(resp.status(), 404);
        let id = missing.parse().unwrap();
        assert_eq!(server.bus.subscriber_count(&id), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_task_name_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = submit(&server.base, "launch_rockets", json!({})).await;
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("launch_rockets"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stream_reports_progress_until_terminal() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let id = submit_ok(&server.base, "send_email", json!({"emailAddress": "ada@example.com"})).await;
        let mut sse = open_stream(&server.base, &id).await;

        let mut percents = Vec::new();
        let mut last = None;
        while let Some(frame) = sse.next().await {
            if frame.event == "ping" {
                continue;
            }
            percents.push(frame.data["percent"].as_u64().unwrap());
            let terminal = frame.event == "terminal";
            last = Some(frame);
            if terminal {
                break;
            }
        }

        let last = last.unwrap();
        assert_eq!(last.event, "terminal");
        assert_eq!(last.data["phase"], "SUCCESS");
        assert_eq!(last.data["result"], "Email sent to ada@example.com");
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(*percents.last().unwrap(), 100);

        // Server closes after the terminal event.
        assert!(sse.next().await.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_email_fails_without_retry() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let id = submit_ok(&server.base, "send_email", json!({"emailAddress": "nobody"})).await;
        let mut sse = open_stream(&server.base, &id).await;

        let terminal = loop {
            let frame = sse.next().await.unwrap();
            if frame.event == "terminal" {
                break frame;
            }
        };
        assert_eq!(terminal.data["phase"], "FAILURE");
        assert_eq!(terminal.data["retries"], 0);
        assert!(terminal.data["error"].as_str().unwrap().contains("nobody"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn quiet_stream_gets_pings_before_next_phase_change() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let id = submit_ok(&server.base, "gated", json!({})).await;
        let mut sse = open_stream(&server.base, &id).await;

        let mut pings = 0;
        while pings < 2 {
            let frame = sse.next().await.unwrap();
            match frame.event.as_str() {
                "ping" => {
                    assert_eq!(frame.data["taskId"], id.as_str());
                    assert!(frame.data["timestamp"].is_string());
                    pings += 1;
                }
                "phase-changed" => {
                    assert_eq!(pings, 0, "no phase change expected while gated");
                }
                other => panic!("unexpected event {other}"),
            }
        }

        server.gate.notify_one();
        let terminal = loop {
            let frame = sse.next().await.unwrap();
            if frame.event == "terminal" {
                break frame;
            }
        };
        assert_eq!(terminal.data["result"], "released");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn disconnect_releases_subscription() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let id = submit_ok(&server.base, "gated", json!({})).await;
        let task_id = id.parse().unwrap();

        let mut sse = open_stream(&server.base, &id).await;
        sse.next().await.unwrap();
        assert_eq!(server.bus.subscriber_count(&task_id), 1);

        drop(sse);
        // Noticed on the next write, at the latest one ping interval later.
        while server.bus.subscriber_count(&task_id) != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The task itself is unaffected.
        server.gate.notify_one();
        loop {
            let (_, body) = status(&server.base, &id).await;
            if body["phase"] == "SUCCESS" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("test timed out");
}
