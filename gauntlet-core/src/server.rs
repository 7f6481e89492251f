//! Server lifecycle manager
//!
//! Runs the engine in long-lived HTTP mode and owns the process for its whole
//! life:
//!
//! ```text
//! Starting ──probe 200──▶ Ready ──shutdown──▶ Terminating ──▶ Terminated
//!    │
//!    └──attempts exhausted / early exit──▶ FailedToStart (process killed)
//! ```
//!
//! Teardown sends a graceful termination request, waits a bounded grace
//! period, then force-kills. [`ServerManager::scoped`] runs teardown on every
//! exit path of the body, including errors and panics.

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::invoker::{InvocationResult, InvocationStatus};

/// Keep at most this much of each server output stream for diagnostics
const OUTPUT_CAPTURE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Starting,
    Ready,
    Terminating,
    Terminated,
    FailedToStart,
}

/// Everything needed to launch and talk to an engine server
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub request_timeout: Duration,
    pub decision_path: String,
}

/// Cheap, cloneable view of a running server for issuing requests
#[derive(Debug, Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    decision_path: String,
    request_timeout: Duration,
    pid: Option<u32>,
}

impl ServerClient {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `GET /health`, returning the status code
    pub async fn health(&self, timeout: Duration) -> HarnessResult<u16> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| HarnessError::Http { url, source })?;
        Ok(response.status().as_u16())
    }

    /// POST a decision request; the body becomes the result's stdout
    pub async fn decide(&self, payload: &Value) -> HarnessResult<InvocationResult> {
        let url = format!("{}{}", self.base_url, self.decision_path);
        let start = Instant::now();

        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|source| self.request_error(&url, source))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|source| self.request_error(&url, source))?;

        let result = InvocationResult {
            status: InvocationStatus::Http(status),
            stdout: body.to_vec(),
            stderr: Vec::new(),
            elapsed: start.elapsed(),
        };
        debug!(
            "Decision request to {} returned {} in {}ms",
            url,
            status,
            result.elapsed.as_millis()
        );
        Ok(result)
    }

    fn request_error(&self, url: &str, source: reqwest::Error) -> HarnessError {
        if source.is_timeout() {
            HarnessError::Timeout {
                operation: format!("HTTP request to {url}"),
                after: self.request_timeout,
            }
        } else {
            HarnessError::Http {
                url: url.to_string(),
                source,
            }
        }
    }
}

/// Captured server output, drained in the background so the pipes never fill
#[derive(Debug, Clone, Default)]
struct CapturedOutput {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CapturedOutput {
    fn drain(&self, child: &mut Child) {
        let mut spawned = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            spawned.push(tokio::spawn(drain_into(stdout, self.stdout.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            spawned.push(tokio::spawn(drain_into(stderr, self.stderr.clone())));
        }
        if let Ok(mut readers) = self.readers.lock() {
            readers.extend(spawned);
        }
    }

    /// Wait for the readers to hit EOF after the process has exited
    async fn settle(&self, within: Duration) {
        let readers = match self.readers.lock() {
            Ok(mut readers) => std::mem::take(&mut *readers),
            Err(_) => return,
        };
        let _ = tokio::time::timeout(within, futures::future::join_all(readers)).await;
    }

    fn stderr_text(&self) -> String {
        self.stderr
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

async fn drain_into<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = sink.lock() {
                    let room = OUTPUT_CAPTURE_LIMIT.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
    }
}

/// Exclusive owner of one engine server process
#[derive(Debug)]
pub struct ServerHandle {
    child: Option<Child>,
    pid: Option<u32>,
    state: ServerState,
    teardowns: u32,
    grace_period: Duration,
    client: ServerClient,
    output: CapturedOutput,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn client(&self) -> ServerClient {
        self.client.clone()
    }

    /// Number of teardowns actually performed (0 or 1)
    pub fn teardown_count(&self) -> u32 {
        self.teardowns
    }

    /// Captured server stderr so far
    pub fn stderr(&self) -> String {
        self.output.stderr_text()
    }

    /// Gracefully stop the server, force-killing after the grace period.
    ///
    /// Idempotent: only the first call on a live server does any work.
    pub async fn shutdown(&mut self) -> HarnessResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        self.state = ServerState::Terminating;
        self.teardowns += 1;
        info!("Stopping engine server at {}", self.client.base_url);

        request_termination(&mut child);

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Engine server exited with {:?}", status);
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for engine server: {}", e);
                force_kill(&mut child).await?;
            }
            Err(_) => {
                warn!(
                    "Engine server did not exit within {:?}; killing",
                    self.grace_period
                );
                force_kill(&mut child).await?;
            }
        }

        self.state = ServerState::Terminated;
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            error!(
                "Engine server at {} dropped without shutdown; killing",
                self.client.base_url
            );
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we own and have not reaped yet
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!("SIGTERM to pid {} failed: {}", pid, std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

async fn force_kill(child: &mut Child) -> HarnessResult<()> {
    if let Err(e) = child.start_kill() {
        // Already exited between the check and the kill
        debug!("Kill request failed: {}", e);
    }
    child
        .wait()
        .await
        .map_err(|e| HarnessError::io("reaping killed engine server", e))?;
    Ok(())
}

/// Starts engine servers and guarantees their teardown
#[derive(Debug, Clone)]
pub struct ServerManager {
    settings: ServerSettings,
    http: reqwest::Client,
}

impl ServerManager {
    pub fn new(settings: ServerSettings) -> HarnessResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|source| HarnessError::Http {
                url: format!("http://{}:{}", settings.host, settings.port),
                source,
            })?;
        Ok(Self { settings, http })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Start a server for `bundle` on the configured port
    pub async fn start(&self, bundle: &Path) -> HarnessResult<ServerHandle> {
        self.start_on(bundle, self.settings.port).await
    }

    /// Start a server for `bundle` on `port` and wait until it is ready
    pub async fn start_on(&self, bundle: &Path, port: u16) -> HarnessResult<ServerHandle> {
        let base_url = format!("http://{}:{}", self.settings.host, port);
        info!("Starting engine server for {:?} at {}", bundle, base_url);

        let mut child = Command::new(&self.settings.binary)
            .arg("serve")
            .arg("--bundle")
            .arg(bundle)
            .arg("--http-port")
            .arg(port.to_string())
            .args(&self.settings.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::io(
                    format!("spawning engine server {}", self.settings.binary.display()),
                    e,
                )
            })?;

        let output = CapturedOutput::default();
        output.drain(&mut child);

        let pid = child.id();
        let mut handle = ServerHandle {
            child: Some(child),
            pid,
            state: ServerState::Starting,
            teardowns: 0,
            grace_period: self.settings.grace_period,
            client: ServerClient {
                http: self.http.clone(),
                base_url,
                decision_path: self.settings.decision_path.clone(),
                request_timeout: self.settings.request_timeout,
                pid,
            },
            output,
        };

        match self.await_ready(&mut handle).await {
            Ok(()) => Ok(handle),
            Err(err) => {
                handle.state = ServerState::FailedToStart;
                if let Some(mut child) = handle.child.take() {
                    if let Err(kill_err) = force_kill(&mut child).await {
                        warn!("Failed to reap engine server after failed start: {}", kill_err);
                    }
                }
                Err(err)
            }
        }
    }

    async fn await_ready(&self, handle: &mut ServerHandle) -> HarnessResult<()> {
        let attempts = self.settings.probe_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(child) = handle.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    handle.output.settle(self.settings.probe_timeout).await;
                    return Err(HarnessError::ServerFailedToStart {
                        base_url: handle.client.base_url.clone(),
                        reason: format!(
                            "process exited with {:?} before becoming ready\n{}",
                            status.code(),
                            handle.stderr()
                        ),
                        timed_out: false,
                    });
                }
            }

            match handle.client.health(self.settings.probe_timeout).await {
                Ok(200) => {
                    info!(
                        "Engine server ready at {} after {} attempt(s)",
                        handle.client.base_url, attempt
                    );
                    handle.state = ServerState::Ready;
                    return Ok(());
                }
                Ok(status) => debug!("Health probe {} returned {}", attempt, status),
                Err(e) => debug!("Health probe {} failed: {}", attempt, e),
            }

            tokio::time::sleep(self.settings.probe_interval).await;
        }

        Err(HarnessError::ServerFailedToStart {
            base_url: handle.client.base_url.clone(),
            reason: format!(
                "no healthy probe after {} attempts at {:?} intervals",
                attempts, self.settings.probe_interval
            ),
            timed_out: true,
        })
    }

    /// Run `body` against a fresh server for `bundle`, tearing it down afterwards.
    ///
    /// Teardown runs whether `body` succeeds, fails or panics. A body error
    /// takes precedence over a teardown error.
    pub async fn scoped<F, Fut, T>(&self, bundle: &Path, port: u16, body: F) -> HarnessResult<T>
    where
        F: FnOnce(ServerClient) -> Fut,
        Fut: Future<Output = HarnessResult<T>>,
    {
        let mut handle = self.start_on(bundle, port).await?;
        let outcome = AssertUnwindSafe(body(handle.client())).catch_unwind().await;
        let teardown = handle.shutdown().await;

        match outcome {
            Ok(Ok(value)) => teardown.map(|_| value),
            Ok(Err(err)) => {
                if let Err(teardown_err) = teardown {
                    warn!("Server teardown failed after scenario error: {}", teardown_err);
                }
                Err(err)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
