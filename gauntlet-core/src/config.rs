//! Harness configuration and engine binary resolution.
//!
//! One explicit [`HarnessConfig`] value is built per run and passed into the
//! orchestrator. Sources, lowest precedence first: built-in defaults, an
//! optional YAML file, environment (`GAUNTLET_ENGINE_PATH`, `GAUNTLET_PORT`),
//! then whatever the caller sets on the value (CLI flags).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult};
use crate::invoker::CliInvoker;
use crate::server::ServerSettings;

pub const ENGINE_PATH_ENV: &str = "GAUNTLET_ENGINE_PATH";
pub const PORT_ENV: &str = "GAUNTLET_PORT";

/// Which interface a scenario drives the engine through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// One-shot `test decision` subprocess per scenario
    Cli,
    /// HTTP requests against `serve`
    Server,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Cli => f.write_str("cli"),
            Channel::Server => f.write_str("server"),
        }
    }
}

/// Lifetime of engine servers in server mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerScope {
    /// A fresh server per scenario
    Function,
    /// One server per bundle for the whole run, once validated as stateless
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Explicit engine binary; wins over every other lookup
    #[serde(default)]
    pub engine_path: Option<PathBuf>,

    /// Binary name looked up next to the harness and on PATH
    #[serde(default = "default_engine_name")]
    pub engine_name: String,

    /// Extra arguments appended to every decision and serve invocation
    #[serde(default)]
    pub engine_args: Vec<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Channel for scenarios that do not pick one
    #[serde(default = "default_channel")]
    pub channel: Channel,

    #[serde(default = "default_server_scope")]
    pub server_scope: ServerScope,

    /// Maximum scenarios in flight
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Time between the graceful stop request and the kill
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Hard bound on one `test decision` subprocess
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,

    /// Hard bound on a whole scenario, server startup included
    #[serde(default = "default_scenario_deadline_secs")]
    pub scenario_deadline_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Server-mode decision endpoint
    #[serde(default = "default_decision_path")]
    pub decision_path: String,

    /// Where per-scenario diagnostic artifacts go; none when unset
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
}

fn default_engine_name() -> String {
    "mpe".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_channel() -> Channel {
    Channel::Cli
}

fn default_server_scope() -> ServerScope {
    ServerScope::Function
}

fn default_jobs() -> usize {
    1
}

fn default_probe_attempts() -> u32 {
    30
}

fn default_probe_interval_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_invocation_timeout_secs() -> u64 {
    30
}

fn default_scenario_deadline_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_decision_path() -> String {
    "/decision".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            engine_path: None,
            engine_name: default_engine_name(),
            engine_args: Vec::new(),
            host: default_host(),
            port: default_port(),
            channel: default_channel(),
            server_scope: default_server_scope(),
            jobs: default_jobs(),
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            grace_period_secs: default_grace_period_secs(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            scenario_deadline_secs: default_scenario_deadline_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            decision_path: default_decision_path(),
            artifacts_dir: None,
        }
    }
}

impl HarnessConfig {
    /// Load a YAML config file. Relative paths inside it resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        info!("Loading harness config from: {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            reason: format!("cannot read file: {e}"),
        })?;
        let mut config: HarnessConfig =
            serde_yaml_ng::from_str(&content).map_err(|e| HarnessError::Config {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.engine_path = config.engine_path.map(|p| resolve_relative(base, p));
        config.artifacts_dir = config.artifacts_dir.map(|p| resolve_relative(base, p));

        config.validate().map_err(|reason| HarnessError::Config {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Apply `GAUNTLET_PORT` if set
    pub fn apply_env(&mut self) -> HarnessResult<()> {
        if let Ok(raw) = std::env::var(PORT_ENV) {
            let port = raw.trim().parse::<u16>().map_err(|_| HarnessError::Config {
                path: PathBuf::from(format!("${PORT_ENV}")),
                reason: format!("{raw:?} is not a valid port"),
            })?;
            debug!("Using port {} from {}", port, PORT_ENV);
            self.port = port;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jobs == 0 {
            return Err("jobs must be at least 1".to_string());
        }
        if self.probe_attempts == 0 {
            return Err("probe_attempts must be at least 1".to_string());
        }
        if !self.decision_path.starts_with('/') {
            return Err(format!(
                "decision_path must start with '/', got {:?}",
                self.decision_path
            ));
        }
        // Any suite may pick the server channel, so the pool range always has to fit
        if usize::from(self.port) + self.jobs > usize::from(u16::MAX) + 1 {
            return Err(format!(
                "port range {}..{} does not fit in u16",
                self.port,
                usize::from(self.port) + self.jobs
            ));
        }
        Ok(())
    }

    /// Resolve the engine binary or fail the run before any scenario executes.
    ///
    /// Order: explicit `engine_path`, `GAUNTLET_ENGINE_PATH`, a binary named
    /// `engine_name` beside the current executable, then `engine_name` on PATH.
    pub fn resolve_engine_binary(&self) -> HarnessResult<PathBuf> {
        if let Some(path) = &self.engine_path {
            return existing_file(path, "configured engine_path");
        }

        if let Ok(raw) = std::env::var(ENGINE_PATH_ENV) {
            if !raw.trim().is_empty() {
                return existing_file(Path::new(raw.trim()), ENGINE_PATH_ENV);
            }
        }

        let file_name = if cfg!(windows) {
            format!("{}.exe", self.engine_name)
        } else {
            self.engine_name.clone()
        };

        if let Ok(current_exe) = std::env::current_exe() {
            if let Some(exe_dir) = current_exe.parent() {
                let bundled = exe_dir.join(&file_name);
                if bundled.is_file() {
                    debug!("Using bundled engine at: {:?}", bundled);
                    return Ok(bundled);
                }
            }
        }

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let candidate = dir.join(&file_name);
                if candidate.is_file() {
                    debug!("Using engine from PATH: {:?}", candidate);
                    return Ok(candidate);
                }
            }
        }

        Err(HarnessError::SetupFailure {
            reason: format!(
                "engine binary '{}' not found beside the harness or on PATH",
                self.engine_name
            ),
        })
    }

    pub fn invoker(&self, binary: &Path) -> CliInvoker {
        CliInvoker::new(binary, Duration::from_secs(self.invocation_timeout_secs))
            .with_extra_args(self.engine_args.clone())
    }

    pub fn server_settings(&self, binary: &Path) -> ServerSettings {
        ServerSettings {
            binary: binary.to_path_buf(),
            extra_args: self.engine_args.clone(),
            host: self.host.clone(),
            port: self.port,
            probe_attempts: self.probe_attempts,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            grace_period: Duration::from_secs(self.grace_period_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            decision_path: self.decision_path.clone(),
        }
    }

    pub fn scenario_deadline(&self) -> Duration {
        Duration::from_secs(self.scenario_deadline_secs)
    }
}

fn resolve_relative(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn existing_file(path: &Path, source: &str) -> HarnessResult<PathBuf> {
    if path.is_file() {
        debug!("Using engine from {}: {:?}", source, path);
        Ok(path.to_path_buf())
    } else {
        Err(HarnessError::SetupFailure {
            reason: format!("{source} points to {} which does not exist", path.display()),
        })
    }
}
