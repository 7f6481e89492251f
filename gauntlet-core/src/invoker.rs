//! CLI invoker - runs the engine as a one-shot subprocess
//!
//! Each call spawns an isolated process: the bundle goes on the command line,
//! the request payload is written to stdin as JSON, and stdout/stderr/exit
//! status are captured into a fresh [`InvocationResult`]. A hung engine is
//! killed when the hard timeout expires.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::taxonomy::combined_diagnostics;

/// How the engine finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "code")]
pub enum InvocationStatus {
    /// Process exit code; `None` when terminated by a signal
    Exit(Option<i32>),
    /// HTTP status code of a server-mode request
    Http(u16),
}

impl InvocationStatus {
    pub fn success(&self) -> bool {
        match self {
            InvocationStatus::Exit(code) => *code == Some(0),
            InvocationStatus::Http(code) => (200..300).contains(code),
        }
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationStatus::Exit(Some(code)) => write!(f, "exit code {code}"),
            InvocationStatus::Exit(None) => write!(f, "termination by signal"),
            InvocationStatus::Http(code) => write!(f, "HTTP status {code}"),
        }
    }
}

/// Everything captured from one invocation
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    #[serde(serialize_with = "serialize_lossy")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "serialize_lossy")]
    pub stderr: Vec<u8>,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stderr then stdout, newline-joined, for the taxonomy matcher
    pub fn combined_output(&self) -> String {
        combined_diagnostics(&self.stderr_lossy(), &self.stdout_lossy())
    }
}

fn serialize_lossy<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

pub(crate) mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Whether a non-zero exit is an error or just data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Non-zero exit becomes [`HarnessError::ProcessFailure`] carrying the result
    Strict,
    /// Always return the result; the caller interprets the status
    AllowError,
}

impl ErrorMode {
    /// Turn an unsuccessful result into an error under `Strict`
    pub fn apply(self, result: InvocationResult) -> HarnessResult<InvocationResult> {
        match self {
            ErrorMode::Strict if !result.success() => Err(HarnessError::ProcessFailure { result }),
            _ => Ok(result),
        }
    }
}

/// One-shot decision invoker for a resolved engine binary
#[derive(Debug, Clone)]
pub struct CliInvoker {
    binary: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl CliInvoker {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            timeout,
        }
    }

    /// Arguments appended to every decision invocation
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run `<engine> test decision --bundle <bundle>` with `payload` on stdin
    pub async fn decide(
        &self,
        bundle: &Path,
        payload: &Value,
        mode: ErrorMode,
    ) -> HarnessResult<InvocationResult> {
        let input = serde_json::to_vec(payload).map_err(|e| HarnessError::MalformedOutput {
            reason: format!("request payload could not be serialized: {e}"),
            output: String::new(),
        })?;

        let mut args = vec![
            "test".to_string(),
            "decision".to_string(),
            "--bundle".to_string(),
            bundle.display().to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());

        let result = self.run(&args, Some(&input)).await?;
        if !result.success() {
            debug!(
                "Decision for bundle {:?} failed with {}",
                bundle, result.status
            );
        }
        mode.apply(result)
    }

    /// Run an auxiliary command (`version`, `--help`, `lint -f <path>`) without stdin
    pub async fn run_auxiliary(&self, args: &[&str]) -> HarnessResult<InvocationResult> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run(&args, None).await
    }

    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> HarnessResult<InvocationResult> {
        debug!("Invoking engine: {:?} {:?}", self.binary, args);
        let start = Instant::now();

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::io(format!("spawning engine {}", self.binary.display()), e)
            })?;

        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(bytes), Some(mut pipe)) = (stdin, pipe) {
                // The engine may exit before reading stdin; its exit status tells the story
                if let Err(e) = pipe.write_all(bytes).await {
                    warn!("Failed to write request payload to engine stdin: {}", e);
                }
                let _ = pipe.shutdown().await;
                // Drop closes stdin so the engine sees EOF
            }
        };

        // The payload is fed while the output is collected, under one bound.
        // Dropping the pending work on timeout kills the child (kill_on_drop).
        let work = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };
        let output = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| HarnessError::Timeout {
                operation: format!("engine invocation `{}`", args.join(" ")),
                after: self.timeout,
            })?
            .map_err(|e| HarnessError::io("waiting for engine output", e))?;

        let result = InvocationResult {
            status: InvocationStatus::Exit(output.status.code()),
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed: start.elapsed(),
        };
        debug!(
            "Engine finished with {} in {}ms ({} bytes stdout, {} bytes stderr)",
            result.status,
            result.elapsed.as_millis(),
            result.stdout.len(),
            result.stderr.len()
        );
        Ok(result)
    }
}
