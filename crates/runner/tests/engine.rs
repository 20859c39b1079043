//! End-to-end engine tests against an in-process counting server

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use apiprobe_common::{DiskFs, Report, ReportResult};
use apiprobe_runner::{run_suite, RunConfig};

/// Counter fixture: every request to `/values` returns
/// `[{"ID": n}, {"ID": n+1}]` for the n-th request (1-based).
struct CounterServer {
    url: String,
    hits: Arc<AtomicU64>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CounterServer {
    async fn start() -> CounterServer {
        let hits = Arc::new(AtomicU64::new(0));

        async fn values(State(hits): State<Arc<AtomicU64>>) -> Json<Value> {
            let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!([{ "ID": n }, { "ID": n + 1 }]))
        }

        async fn state(State(hits): State<Arc<AtomicU64>>) -> Json<Value> {
            Json(json!({ "state": "error", "hits": hits.load(Ordering::SeqCst) }))
        }

        let app = Router::new()
            .route("/values", get(values).post(values))
            .route("/state", get(state))
            .with_state(Arc::clone(&hits));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        CounterServer {
            url,
            hits,
            shutdown: Some(tx),
        }
    }
}

impl Drop for CounterServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn write_manifest(dir: &Path, name: &str, content: &Value) {
    fs::write(dir.join(name), serde_json::to_string_pretty(content).unwrap()).unwrap();
}

async fn run_manifest(dir: &Path, server_url: &str) -> (bool, Report) {
    let config = RunConfig {
        server_url: Some(server_url.to_string()),
        ..RunConfig::default()
    };
    let report = Report::new(true);
    let root = report.root();
    let result = run_suite(&dir.join("manifest.json"), Arc::new(DiskFs), &config, &root).await;
    let success = result.map(|o| o.success).unwrap_or(false);
    (success, report)
}

fn find_logs(result: &ReportResult) -> Vec<String> {
    let mut logs = result.log.clone();
    for sub in &result.sub_tests {
        logs.extend(find_logs(sub));
    }
    logs
}

#[tokio::test]
async fn collect_responses_in_any_order() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "name": "collect any order",
            "tests": [{
                "name": "collect",
                "request": { "endpoint": "/values" },
                "collect_response": [
                    { "body": [{ "ID": 5 }] },
                    { "body": [{ "ID": 2 }] }
                ],
                "timeout_ms": 3000,
                "delay_ms": 5
            }]
        }),
    );

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(success, "logs: {:?}", find_logs(&report.aggregate()));
    assert_eq!(report.aggregate().failures, 0);
    assert!(server.hits.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn collect_timeout_logs_unmatched_entries() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [{
                "request": { "endpoint": "/values" },
                "collect_response": [{ "body": [{ "ID": 9999 }] }],
                "timeout_ms": 30,
                "delay_ms": 10
            }]
        }),
    );

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(!success);
    let logs = find_logs(&report.aggregate());
    let timeout_pos = logs
        .iter()
        .position(|l| l == "Pull Timeout '30ms' exceeded")
        .expect("timeout log line");
    let collect_pos = logs
        .iter()
        .position(|l| l == "Collect response not found: {\"body\":[{\"ID\":9999}]}")
        .expect("collect log line");
    assert!(timeout_pos < collect_pos);
}

#[tokio::test]
async fn collect_responses_from_file_reference() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [{
                "request": { "endpoint": "/values" },
                "collect_response": "@collect.json",
                "timeout_ms": 3000,
                "delay_ms": 5
            }]
        }),
    );
    write_manifest(
        dir.path(),
        "collect.json",
        &json!([
            { "body": [{ "ID": 3 }] },
            { "body": [{ "ID": 1 }] }
        ]),
    );

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(success, "logs: {:?}", find_logs(&report.aggregate()));
    assert_eq!(report.aggregate().failures, 0);
}

#[tokio::test]
async fn collect_reference_must_not_fan_out() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [{
                "request": { "endpoint": "/values" },
                "collect_response": "5@collect.json",
                "timeout_ms": 3000
            }]
        }),
    );
    write_manifest(dir.path(), "collect.json", &json!([{ "body": [{ "ID": 1 }] }]));

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(!success);
    assert!(find_logs(&report.aggregate())
        .iter()
        .any(|l| l.contains("collect_response '5@collect.json'")));
}

#[tokio::test]
async fn poll_timeout_bounds_duration() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [{
                "request": { "endpoint": "/values" },
                "response": { "body": { "never": true } },
                "timeout_ms": 30,
                "delay_ms": 10
            }]
        }),
    );

    let start = Instant::now();
    let (success, report) = run_manifest(dir.path(), &server.url).await;
    let elapsed = start.elapsed().as_millis();
    assert!(!success);
    assert!(elapsed >= 30, "finished too early: {}ms", elapsed);
    assert!(elapsed < 3000, "ran far past the budget: {}ms", elapsed);
    assert!(find_logs(&report.aggregate())
        .iter()
        .any(|l| l == "Pull Timeout '30ms' exceeded"));
}

#[tokio::test]
async fn parallel_runs_fan_out() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({ "tests": [{ "5@child.json": "" }] }),
    );
    write_manifest(
        dir.path(),
        "child.json",
        &json!([
            { "request": { "endpoint": "/values" }, "timeout_ms": -1 },
            { "request": { "endpoint": "/values" }, "timeout_ms": -1 }
        ]),
    );

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(success, "logs: {:?}", find_logs(&report.aggregate()));

    let aggregated = report.aggregate();
    assert_eq!(aggregated.test_count, 10);
    assert_eq!(server.hits.load(Ordering::SeqCst), 10);

    // One report child per worker under the suite element.
    let suite = &aggregated.sub_tests[0];
    assert_eq!(suite.sub_tests.len(), 5);
    assert!(suite.sub_tests.iter().all(|s| s.sub_tests.len() == 2));
}

#[tokio::test]
async fn nested_parallelism_is_rejected() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({ "tests": ["2@outer.json"] }),
    );
    write_manifest(dir.path(), "outer.json", &json!(["3@inner.json"]));
    write_manifest(
        dir.path(),
        "inner.json",
        &json!([{ "request": { "endpoint": "/values" } }]),
    );

    let config = RunConfig {
        server_url: Some(server.url.clone()),
        ..RunConfig::default()
    };
    let report = Report::new(true);
    let root = report.root();
    let result = run_suite(
        &dir.path().join("manifest.json"),
        Arc::new(DiskFs),
        &config,
        &root,
    )
    .await;
    let err = result.expect_err("nested parallel must be a hard error");
    assert!(err.to_string().contains("parallel"));
}

#[tokio::test]
async fn break_response_aborts_polling() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [{
                "request": { "endpoint": "/state" },
                "response": { "body": { "state": "ok" } },
                "break_response": [{ "body": { "state": "error" } }],
                "timeout_ms": 3000,
                "delay_ms": 10
            }]
        }),
    );

    let start = Instant::now();
    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(!success);
    assert!(start.elapsed().as_millis() < 2000, "break did not abort early");
    assert!(find_logs(&report.aggregate())
        .iter()
        .any(|l| l == "Break response matched"));
}

#[tokio::test]
async fn failed_case_stops_siblings() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [
                {
                    "request": { "endpoint": "/values" },
                    "response": { "statuscode": 500 },
                    "timeout_ms": -1
                },
                { "request": { "endpoint": "/values" }, "timeout_ms": -1 }
            ]
        }),
    );

    let (success, _) = run_manifest(dir.path(), &server.url).await;
    assert!(!success);
    assert_eq!(server.hits.load(Ordering::SeqCst), 1, "sibling case still ran");
}

#[tokio::test]
async fn continue_on_failure_keeps_going() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [
                {
                    "request": { "endpoint": "/values" },
                    "response": { "statuscode": 500 },
                    "timeout_ms": -1,
                    "continue_on_failure": true
                },
                { "request": { "endpoint": "/values" }, "timeout_ms": -1 }
            ]
        }),
    );

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(!success);
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    assert_eq!(report.aggregate().failures, 1);
}

#[tokio::test]
async fn store_round_trips_between_cases() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    // Case 1 records the first ID; case 2 sends it back and the
    // counter server's response proves the value flowed through.
    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "tests": [
                {
                    "request": { "endpoint": "/values" },
                    "store_response_qjson": { "firstID": "body.0.ID" },
                    "timeout_ms": -1
                },
                {
                    "request": {
                        "endpoint": "/values",
                        "query_params_from_store": { "last": "firstID" }
                    },
                    "response": { "body": [{ "ID": 2 }, { "ID": 3 }] },
                    "timeout_ms": -1
                }
            ]
        }),
    );

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(success, "logs: {:?}", find_logs(&report.aggregate()));
}

#[tokio::test]
async fn manifest_with_comments_and_templates() {
    let server = CounterServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    fs::write(
        dir.path().join("manifest.json"),
        r#"{
    # expected IDs for the very first request
    "tests": [{
        "request": { "endpoint": "/values" },
        "response": { "body": [{ "ID": {{ add 1 0 }} }, { "ID": 2 }] },
        "timeout_ms": -1,
    }],
}"#,
    )
    .unwrap();

    let (success, report) = run_manifest(dir.path(), &server.url).await;
    assert!(success, "logs: {:?}", find_logs(&report.aggregate()));
}

#[tokio::test]
async fn fixture_server_scoped_to_suite() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("static")).unwrap();
    fs::write(dir.path().join("static/data.json"), "{\"from\": \"disk\"}").unwrap();

    write_manifest(
        dir.path(),
        "manifest.json",
        &json!({
            "http_server": { "addr": "", "dir": "static" },
            "tests": [{
                "request": { "endpoint": "/data.json" },
                "response": { "body": { "from": "disk" } },
                "timeout_ms": -1
            }]
        }),
    );

    // No --server override: the suite binds to its own fixture.
    let config = RunConfig::default();
    let report = Report::new(true);
    let root = report.root();
    let outcome = run_suite(
        &dir.path().join("manifest.json"),
        Arc::new(DiskFs),
        &config,
        &root,
    )
    .await
    .unwrap();
    assert!(outcome.success, "logs: {:?}", find_logs(&report.aggregate()));
}
