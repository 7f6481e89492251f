//! Server lifecycle: readiness, failed starts, and guaranteed teardown

#![cfg(unix)]

mod common;

use common::{FakeDecisionServer, ServerBehavior};
use gauntlet_core::decision::{Decision, Outcome};
use gauntlet_core::error::{FailureKind, HarnessError};
use gauntlet_core::server::{ServerManager, ServerSettings, ServerState};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn settings(engine: &Path, port: u16) -> ServerSettings {
    ServerSettings {
        binary: engine.to_path_buf(),
        extra_args: Vec::new(),
        host: "127.0.0.1".to_string(),
        port,
        probe_attempts: 5,
        probe_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(200),
        grace_period: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        decision_path: "/decision".to_string(),
    }
}

#[tokio::test]
async fn test_probe_exhaustion_fails_and_kills_process() {
    common::init_test_logging();
    let dir = TempDir::new().unwrap();
    let engine = common::fake_engine(dir.path());
    let bundle = common::bundle(dir.path(), "consolidated.yml");
    let port = common::unused_port().await;

    let manager = ServerManager::new(settings(&engine, port)).unwrap();
    let err = manager.start(&bundle).await.unwrap_err();

    match &err {
        HarnessError::ServerFailedToStart { timed_out, .. } => assert!(*timed_out),
        other => panic!("expected ServerFailedToStart, got {other:?}"),
    }
    assert_eq!(err.kind(), FailureKind::Timeout);

    let pid = common::wait_for_pid(&bundle).await;
    assert!(!common::process_alive(pid), "server process {pid} leaked");
}

#[tokio::test]
async fn test_early_exit_reports_stderr() {
    common::init_test_logging();
    let dir = TempDir::new().unwrap();
    let engine = common::fake_engine(dir.path());
    let bundle = common::bundle(dir.path(), "crash.yml");
    let port = common::unused_port().await;

    let manager = ServerManager::new(settings(&engine, port)).unwrap();
    let err = manager.start(&bundle).await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::ProcessFailure);
    match err {
        HarnessError::ServerFailedToStart {
            reason, timed_out, ..
        } => {
            assert!(!timed_out);
            assert!(reason.contains("rego compilation failed"), "{reason}");
        }
        other => panic!("expected ServerFailedToStart, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ready_server_answers_and_tears_down_once() {
    common::init_test_logging();
    let dir = TempDir::new().unwrap();
    let engine = common::fake_engine(dir.path());
    let bundle = common::bundle(dir.path(), "consolidated.yml");
    let fake = FakeDecisionServer::start(ServerBehavior::Stateless).await;

    let manager = ServerManager::new(settings(&engine, fake.port)).unwrap();
    let mut handle = manager.start(&bundle).await.unwrap();
    assert_eq!(handle.state(), ServerState::Ready);
    assert_eq!(handle.base_url(), format!("http://127.0.0.1:{}", fake.port));

    let result = handle
        .client()
        .decide(&json!({"principal": "admin"}))
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(
        Decision::parse(&result.stdout).unwrap().outcome,
        Outcome::Grant
    );

    let pid = handle.pid().unwrap() as i32;
    handle.shutdown().await.unwrap();
    handle.shutdown().await.unwrap();
    assert_eq!(handle.state(), ServerState::Terminated);
    assert_eq!(handle.teardown_count(), 1);
    assert!(!common::process_alive(pid));
}

#[tokio::test]
async fn test_stubborn_server_is_force_killed_after_grace() {
    common::init_test_logging();
    let dir = TempDir::new().unwrap();
    let engine = common::fake_engine(dir.path());
    let bundle = common::bundle(dir.path(), "stubborn.yml");
    let fake = FakeDecisionServer::start(ServerBehavior::Stateless).await;

    let mut settings = settings(&engine, fake.port);
    settings.grace_period = Duration::from_millis(300);
    let manager = ServerManager::new(settings).unwrap();
    let mut handle = manager.start(&bundle).await.unwrap();
    let pid = handle.pid().unwrap() as i32;

    // Give the script time to install its TERM trap
    common::wait_for_pid(&bundle).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    handle.shutdown().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(handle.state(), ServerState::Terminated);
    assert!(!common::process_alive(pid));
}

#[tokio::test]
async fn test_scoped_tears_down_when_body_fails() {
    common::init_test_logging();
    let dir = TempDir::new().unwrap();
    let engine = common::fake_engine(dir.path());
    let bundle = common::bundle(dir.path(), "consolidated.yml");
    let fake = FakeDecisionServer::start(ServerBehavior::Stateless).await;
    let manager = ServerManager::new(settings(&engine, fake.port)).unwrap();

    let seen_pid = Arc::new(Mutex::new(None));
    let recorder = seen_pid.clone();
    let err = manager
        .scoped(&bundle, fake.port, |client| async move {
            *recorder.lock().unwrap() = client.pid();
            Err::<(), _>(HarnessError::ExpectationMismatch {
                explanation: "scenario failed".to_string(),
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::ExpectationMismatch);
    let pid = seen_pid.lock().unwrap().unwrap() as i32;
    assert!(!common::process_alive(pid));
}

#[tokio::test]
async fn test_scoped_tears_down_when_body_panics() {
    common::init_test_logging();
    let dir = TempDir::new().unwrap();
    let engine = common::fake_engine(dir.path());
    let bundle = common::bundle(dir.path(), "consolidated.yml");
    let fake = FakeDecisionServer::start(ServerBehavior::Stateless).await;
    let manager = ServerManager::new(settings(&engine, fake.port)).unwrap();

    let seen_pid = Arc::new(Mutex::new(None));
    let recorder = seen_pid.clone();
    let port = fake.port;
    let joined = tokio::spawn(async move {
        manager
            .scoped(&bundle, port, |client| async move {
                *recorder.lock().unwrap() = client.pid();
                let explode = true;
                if explode {
                    panic!("scenario body panicked");
                }
                Ok::<(), HarnessError>(())
            })
            .await
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    let pid = seen_pid.lock().unwrap().unwrap() as i32;
    assert!(!common::process_alive(pid));
}

#[tokio::test]
async fn test_scoped_returns_body_value() {
    let dir = TempDir::new().unwrap();
    let engine = common::fake_engine(dir.path());
    let bundle = common::bundle(dir.path(), "consolidated.yml");
    let fake = FakeDecisionServer::start(ServerBehavior::Stateless).await;
    let manager = ServerManager::new(settings(&engine, fake.port)).unwrap();

    let status = manager
        .scoped(&bundle, fake.port, |client| async move {
            client.health(Duration::from_secs(1)).await
        })
        .await
        .unwrap();
    assert_eq!(status, 200);
}
