//! Harness error types with clear, actionable messages

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::invoker::InvocationResult;

/// Failure category carried by a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SetupFailure,
    ProcessFailure,
    Timeout,
    MalformedOutput,
    NormalizationMismatch,
    ExpectationMismatch,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::SetupFailure => "SetupFailure",
            FailureKind::ProcessFailure => "ProcessFailure",
            FailureKind::Timeout => "Timeout",
            FailureKind::MalformedOutput => "MalformedOutput",
            FailureKind::NormalizationMismatch => "NormalizationMismatch",
            FailureKind::ExpectationMismatch => "ExpectationMismatch",
        };
        f.write_str(name)
    }
}

/// Errors raised while driving the engine-under-test
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The engine binary (or another prerequisite) could not be resolved
    #[error("Harness setup failed: {reason}\n\nSet `engine_path` in the harness config, pass --engine, or export GAUNTLET_ENGINE_PATH.")]
    SetupFailure { reason: String },

    /// The engine exited non-zero where success was required
    #[error("Engine exited with {status} where success was required\n\nstderr:\n{stderr}", status = .result.status, stderr = .result.stderr_lossy())]
    ProcessFailure { result: InvocationResult },

    /// An invocation, probe or scenario exceeded its bound
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Engine output did not parse as a decision document
    #[error("Engine output is not a valid decision document: {reason}")]
    MalformedOutput { reason: String, output: String },

    /// A decision token outside the recognized vocabulary
    #[error("Unrecognized decision token {token:?} at {location}")]
    NormalizationMismatch { token: String, location: String },

    /// The observed result does not match the scenario's expectation
    #[error("Expectation not met: {explanation}")]
    ExpectationMismatch { explanation: String },

    /// The server never became ready, or exited while starting
    #[error("Engine server failed to start on {base_url}: {reason}")]
    ServerFailedToStart {
        base_url: String,
        reason: String,
        timed_out: bool,
    },

    /// Harness configuration or fixture could not be loaded
    #[error("Invalid harness configuration in {path}: {reason}", path = .path.display())]
    Config { path: PathBuf, reason: String },

    #[error("I/O error while {action}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    pub(crate) fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        HarnessError::Io {
            action: action.into(),
            source,
        }
    }

    /// Map this error onto the verdict failure taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            HarnessError::SetupFailure { .. } | HarnessError::Config { .. } => {
                FailureKind::SetupFailure
            }
            HarnessError::ProcessFailure { .. } | HarnessError::Io { .. } => {
                FailureKind::ProcessFailure
            }
            HarnessError::ServerFailedToStart { timed_out, .. } => {
                if *timed_out {
                    FailureKind::Timeout
                } else {
                    FailureKind::ProcessFailure
                }
            }
            HarnessError::Timeout { .. } => FailureKind::Timeout,
            HarnessError::Http { source, .. } => {
                if source.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::ProcessFailure
                }
            }
            HarnessError::MalformedOutput { .. } => FailureKind::MalformedOutput,
            HarnessError::NormalizationMismatch { .. } => FailureKind::NormalizationMismatch,
            HarnessError::ExpectationMismatch { .. } => FailureKind::ExpectationMismatch,
        }
    }

    /// Setup failures abort the whole run instead of failing one scenario
    pub fn is_fatal(&self) -> bool {
        self.kind() == FailureKind::SetupFailure
    }
}
