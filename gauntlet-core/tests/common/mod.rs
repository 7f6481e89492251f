//! Shared helpers for the integration tests
//!
//! The engine-under-test is replaced by a `/bin/sh` script whose behavior is
//! keyed on the bundle file name, and server mode is backed by an in-process
//! HTTP listener, so no real engine is needed.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

/// `test decision` behavior by bundle name; `serve` records its pid beside
/// the bundle, then idles.
pub const FAKE_ENGINE: &str = r#"#!/bin/sh
case "$1" in
  version)
    echo "mpe version 0.9.1 (fake)"
    exit 0
    ;;
  --help)
    echo "mpe - policy decision engine"
    echo
    echo "Available Commands:"
    echo "  test        Run decision tests"
    echo "  serve       Start the HTTP server"
    echo "  lint        Lint a bundle"
    exit 0
    ;;
  lint)
    if [ ! -f "$3" ]; then
      echo "open $3: no such file or directory" >&2
      exit 2
    fi
    if grep -q warn "$3"; then
      echo "warning: unused library" >&2
      exit 1
    fi
    exit 0
    ;;
  serve)
    echo $$ > "$3.pid"
    case "$(basename "$3")" in
      *crash*)
        echo "Error: rego compilation failed in policy mrn:iam:policy:broken" >&2
        exit 1
        ;;
      *stubborn*)
        trap '' TERM
        while true; do sleep 1; done
        ;;
      *graceful*)
        trap 'echo terminated > "$3.term"; exit 0' TERM
        while true; do sleep 1; done
        ;;
    esac
    exec sleep 60
    ;;
  test)
    bundle="$4"
    if [ ! -f "$bundle" ]; then
      cat > /dev/null
      echo "Error: open $bundle: no such file or directory" >&2
      exit 1
    fi
    input=$(cat)
    case "$(basename "$bundle")" in
      *cycle*)
        echo "Error: validation failed: dependency cycle detected: mrn:iam:library:a -> mrn:iam:library:b -> mrn:iam:library:a" >&2
        exit 1
        ;;
      *malformed*)
        echo "Error: failed to load bundle: yaml: line 3: could not find expected ':'" >&2
        exit 1
        ;;
      *garbage*)
        echo "Decision: maybe"
        exit 0
        ;;
      *partial*)
        echo '{"decision":"GRANT","references":[{"decision":"ALLOW","policy":"p1"},{"decision":"DENY","policy":"p2"}]}'
        exit 0
        ;;
      *hang*)
        exec sleep 30
        ;;
      *missing_ref*)
        echo '{"decision":"DENY"}'
        exit 0
        ;;
    esac
    case "$input" in
      *admin*) echo '{"decision":"ALLOW","references":[{"decision":"PERMIT"}]}' ;;
      *) echo '{"decision":"REJECT"}' ;;
    esac
    exit 0
    ;;
esac
echo "unknown command: $1" >&2
exit 64
"#;

/// Write an executable script into `dir`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

pub fn fake_engine(dir: &Path) -> PathBuf {
    write_script(dir, "mpe", FAKE_ENGINE)
}

/// Create a bundle file; its name selects the fake engine's behavior
pub fn bundle(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "domain: iam\nlibraries: []\n").unwrap();
    path
}

pub fn read_pid(bundle: &Path) -> Option<i32> {
    let pid_file = PathBuf::from(format!("{}.pid", bundle.display()));
    fs::read_to_string(pid_file).ok()?.trim().parse().ok()
}

/// Poll until the fake `serve` has written its pid file
pub async fn wait_for_pid(bundle: &Path) -> i32 {
    for _ in 0..100 {
        if let Some(pid) = read_pid(bundle) {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("fake engine never wrote a pid file for {bundle:?}");
}

#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// A port nothing listens on
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// How the in-process decision server answers
#[derive(Debug, Clone, Copy)]
pub enum ServerBehavior {
    /// Payloads mentioning `admin` get GRANT, everything else DENY
    Stateless,
    /// GRANT for the first decision request, DENY afterwards
    DriftsAfterFirst,
    /// Decision requests never complete
    Hangs,
}

#[derive(Clone)]
struct StubState {
    behavior: ServerBehavior,
    decisions: Arc<AtomicUsize>,
    health_checks: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

/// In-process stand-in for `<engine> serve`: `/health` and `/decision`
pub struct FakeDecisionServer {
    pub port: u16,
    state: StubState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeDecisionServer {
    pub async fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = StubState {
            behavior,
            decisions: Arc::new(AtomicUsize::new(0)),
            health_checks: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/decision", post(decision_handler))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Self {
            port,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn decision_count(&self) -> usize {
        self.state.decisions.load(Ordering::SeqCst)
    }

    /// Every server start probes `/health` until the first 200, so with this
    /// listener up from the beginning this counts server starts.
    pub fn health_count(&self) -> usize {
        self.state.health_checks.load(Ordering::SeqCst)
    }

    /// Most decision requests ever handled at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for FakeDecisionServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn health_handler(State(state): State<StubState>) -> impl IntoResponse {
    state.health_checks.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, "ok")
}

async fn decision_handler(State(state): State<StubState>, body: String) -> impl IntoResponse {
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);
    let seen = state.decisions.fetch_add(1, Ordering::SeqCst);

    let grant = match state.behavior {
        ServerBehavior::Stateless => {
            // Long enough for overlapping requests to be observed
            tokio::time::sleep(Duration::from_millis(25)).await;
            body.contains("admin")
        }
        ServerBehavior::DriftsAfterFirst => seen == 0,
        ServerBehavior::Hangs => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            false
        }
    };
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let decision = if grant { "GRANT" } else { "DENY" };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        format!(r#"{{"decision":"{decision}","references":[]}}"#),
    )
}
