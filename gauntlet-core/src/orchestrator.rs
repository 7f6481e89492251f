//! Harness orchestrator
//!
//! Drives every scenario through its invocation channel and turns the raw
//! response into a [`Verdict`]. Success and failure responses go through the
//! same [`evaluate`] function, which branches on the expectation kind only.
//!
//! Scenarios are independent. They are fanned out over a bounded worker pool,
//! each under its own deadline, and the verdicts are returned in registry order.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{Channel, HarnessConfig, ServerScope};
use crate::decision::{Decision, Outcome};
use crate::error::{FailureKind, HarnessError, HarnessResult};
use crate::invoker::{duration_millis, CliInvoker, ErrorMode, InvocationResult, InvocationStatus};
use crate::report::{ArtifactWriter, ProbeOutcome, RunReport};
use crate::scenario::{Expectation, Scenario, ScenarioRegistry};
use crate::server::{ServerClient, ServerManager};
use crate::taxonomy::{match_fragments, ErrorCategory};

/// What the engine actually produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Observed {
    /// A well-formed, normalized decision
    Decision(Decision),
    /// Combined diagnostics of a failed run, or the harness error text
    Failure(String),
    /// Successful output that is not a usable decision
    Output(String),
    Nothing,
}

/// Result of comparing one response against one expectation
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub passed: bool,
    pub failure: Option<FailureKind>,
    pub observed: Observed,
    pub explanation: Option<String>,
    pub categories: Vec<ErrorCategory>,
}

impl Assessment {
    fn pass(observed: Observed, categories: Vec<ErrorCategory>) -> Self {
        Self {
            passed: true,
            failure: None,
            observed,
            explanation: None,
            categories,
        }
    }

    fn fail(
        kind: FailureKind,
        observed: Observed,
        explanation: String,
        categories: Vec<ErrorCategory>,
    ) -> Self {
        Self {
            passed: false,
            failure: Some(kind),
            observed,
            explanation: Some(explanation),
            categories,
        }
    }
}

/// Compare a scenario response against its expectation.
///
/// `ProcessFailure` errors are unwrapped to the result they carry, so strict
/// and lenient invocations evaluate identically. A server that exited while
/// starting is treated as a failed run whose diagnostics are its stderr.
pub fn evaluate(expectation: &Expectation, response: &HarnessResult<InvocationResult>) -> Assessment {
    let result = match response {
        Ok(result) | Err(HarnessError::ProcessFailure { result }) => result,
        Err(HarnessError::ServerFailedToStart {
            reason,
            timed_out: false,
            ..
        }) if expectation.accepts_process_failure() => {
            return assess_failure(expectation, reason.clone(), None);
        }
        Err(err) => {
            return Assessment::fail(
                err.kind(),
                Observed::Failure(err.to_string()),
                err.to_string(),
                Vec::new(),
            )
        }
    };

    if !result.success() {
        return assess_failure(expectation, result.combined_output(), Some(result.status));
    }

    let decision = match Decision::parse(&result.stdout) {
        Ok(decision) => decision,
        Err(_) if !expectation.accepts_decision() => {
            return Assessment::fail(
                FailureKind::ExpectationMismatch,
                Observed::Output(result.stdout_lossy()),
                format!("expected {expectation}, but the engine succeeded"),
                Vec::new(),
            )
        }
        Err(err) => {
            return Assessment::fail(
                err.kind(),
                Observed::Output(result.stdout_lossy()),
                err.to_string(),
                Vec::new(),
            )
        }
    };

    let mismatch = match expectation {
        Expectation::ExactDecision(expected) => (decision.outcome != *expected)
            .then(|| format!("expected decision {expected}, got {}", decision.outcome)),
        Expectation::DecisionAndNoDenyReferences(expected) => {
            let denies = decision.deny_references();
            if decision.outcome != *expected {
                Some(format!(
                    "expected decision {expected}, got {}",
                    decision.outcome
                ))
            } else if !denies.is_empty() {
                let listed = denies
                    .iter()
                    .map(|r| r.raw.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(format!(
                    "decision is {expected} but {} reference decision(s) normalized to DENY: {listed}",
                    denies.len()
                ))
            } else {
                None
            }
        }
        Expectation::NotDecision(excluded) => (decision.outcome == *excluded)
            .then(|| format!("expected any decision but {excluded}, got {excluded}")),
        Expectation::DenyOrErrorContains(_) => (decision.outcome != Outcome::Deny).then(|| {
            format!(
                "expected DENY or a failing run, got decision {}",
                decision.outcome
            )
        }),
        Expectation::ErrorContains(_) => Some(format!(
            "expected {expectation}, but the engine returned decision {}",
            decision.outcome
        )),
    };

    let observed = Observed::Decision(decision);
    match mismatch {
        None => Assessment::pass(observed, Vec::new()),
        Some(explanation) => Assessment::fail(
            FailureKind::ExpectationMismatch,
            observed,
            explanation,
            Vec::new(),
        ),
    }
}

fn assess_failure(
    expectation: &Expectation,
    diagnostics: String,
    status: Option<InvocationStatus>,
) -> Assessment {
    let categories = ErrorCategory::classify(&diagnostics);
    match expectation {
        Expectation::ErrorContains(fragments) | Expectation::DenyOrErrorContains(fragments) => {
            let report = match_fragments(&diagnostics, fragments);
            match report.explain() {
                None => Assessment::pass(Observed::Failure(diagnostics), categories),
                Some(explanation) => Assessment::fail(
                    FailureKind::ExpectationMismatch,
                    Observed::Failure(diagnostics),
                    explanation,
                    categories,
                ),
            }
        }
        _ => {
            let how = status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "a startup failure".to_string());
            Assessment::fail(
                FailureKind::ProcessFailure,
                Observed::Failure(diagnostics),
                format!("engine failed with {how} where {expectation} was expected"),
                categories,
            )
        }
    }
}

/// The outcome of one scenario. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub scenario_id: String,
    pub passed: bool,
    pub channel: Channel,
    pub expectation: Expectation,
    pub failure: Option<FailureKind>,
    pub observed: Observed,
    pub explanation: Option<String>,
    /// Error categories recognized in the diagnostics of a failed run
    pub categories: Vec<ErrorCategory>,
    pub status: Option<InvocationStatus>,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl Verdict {
    pub fn from_response(
        scenario: &Scenario,
        channel: Channel,
        response: HarnessResult<InvocationResult>,
        elapsed: Duration,
    ) -> Self {
        let assessment = evaluate(&scenario.expectation, &response);
        let raw = match &response {
            Ok(result) | Err(HarnessError::ProcessFailure { result }) => Some(result),
            Err(_) => None,
        };

        let verdict = Verdict {
            scenario_id: scenario.id.clone(),
            passed: assessment.passed,
            channel,
            expectation: scenario.expectation.clone(),
            failure: assessment.failure,
            observed: assessment.observed,
            explanation: assessment.explanation,
            categories: assessment.categories,
            status: raw.map(|r| r.status),
            stdout: raw.map(|r| r.stdout_lossy()).unwrap_or_default(),
            stderr: raw.map(|r| r.stderr_lossy()).unwrap_or_default(),
            elapsed,
        };

        if verdict.passed {
            info!("PASS {} ({}ms)", verdict.scenario_id, elapsed.as_millis());
        } else {
            warn!(
                "FAIL {} [{}]: {}",
                verdict.scenario_id,
                verdict
                    .failure
                    .map(|k| k.to_string())
                    .unwrap_or_default(),
                verdict.explanation.as_deref().unwrap_or_default()
            );
        }
        verdict
    }
}

/// Strict unless a failing run is itself an acceptable outcome
fn error_mode(expectation: &Expectation) -> ErrorMode {
    match expectation {
        Expectation::DenyOrErrorContains(_) => ErrorMode::AllowError,
        _ => ErrorMode::Strict,
    }
}

/// Ports for concurrently running function-scoped servers
#[derive(Debug, Clone)]
struct PortPool {
    permits: Arc<Semaphore>,
    free: Arc<Mutex<Vec<u16>>>,
}

struct PortLease {
    port: u16,
    free: Arc<Mutex<Vec<u16>>>,
    _permit: OwnedSemaphorePermit,
}

impl PortPool {
    fn new(first: u16, size: usize) -> Self {
        let ports: Vec<u16> = (0..size)
            .filter_map(|offset| u16::try_from(usize::from(first) + offset).ok())
            .rev()
            .collect();
        Self {
            permits: Arc::new(Semaphore::new(ports.len())),
            free: Arc::new(Mutex::new(ports)),
        }
    }

    async fn acquire(&self) -> HarnessResult<PortLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HarnessError::SetupFailure {
                reason: "server port pool closed".to_string(),
            })?;
        let port = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .ok_or_else(|| HarnessError::SetupFailure {
                reason: "server port pool exhausted".to_string(),
            })?;
        Ok(PortLease {
            port,
            free: self.free.clone(),
            _permit: permit,
        })
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(self.port);
    }
}

/// Runs scenarios against one resolved engine binary
#[derive(Debug, Clone)]
pub struct Harness {
    config: HarnessConfig,
    invoker: CliInvoker,
    servers: ServerManager,
    ports: PortPool,
}

impl Harness {
    /// Resolve the engine binary and build a harness; fails before any scenario runs
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        let binary = config.resolve_engine_binary()?;
        Self::with_binary(config, binary)
    }

    pub fn with_binary(config: HarnessConfig, binary: impl Into<PathBuf>) -> HarnessResult<Self> {
        config.validate().map_err(|reason| HarnessError::Config {
            path: PathBuf::from("<harness config>"),
            reason,
        })?;

        let binary = binary.into();
        info!("Using engine binary: {:?}", binary);
        let invoker = config.invoker(&binary);
        let servers = ServerManager::new(config.server_settings(&binary))?;
        let ports = PortPool::new(config.port, config.jobs);
        Ok(Self {
            config,
            invoker,
            servers,
            ports,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn invoker(&self) -> &CliInvoker {
        &self.invoker
    }

    /// Run every scenario and collect the verdicts in registry order
    pub async fn run(&self, registry: &ScenarioRegistry) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let scenarios = registry.scenarios();
        info!(
            "Starting run {} with {} scenario(s), {} worker(s)",
            run_id,
            scenarios.len(),
            self.config.jobs
        );

        let mut isolated = Vec::new();
        let mut shared: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
        for (index, scenario) in scenarios.iter().enumerate() {
            let channel = scenario.resolve_channel(self.config.channel);
            if channel == Channel::Server && self.config.server_scope == ServerScope::Session {
                shared.entry(scenario.bundle.clone()).or_default().push(index);
            } else {
                isolated.push((index, channel));
            }
        }

        let mut verdicts: Vec<(usize, Verdict)> = stream::iter(isolated)
            .map(|(index, channel)| async move {
                (index, self.run_scenario(&scenarios[index], channel).await)
            })
            .buffer_unordered(self.config.jobs)
            .collect()
            .await;

        for (bundle, indices) in shared {
            verdicts.extend(self.run_shared(&bundle, &indices, scenarios).await);
        }

        verdicts.sort_by_key(|(index, _)| *index);
        let verdicts = verdicts.into_iter().map(|(_, v)| v).collect();
        let report = RunReport::new(run_id, started_at, Utc::now(), verdicts);
        info!("Run {}: {}", report.run_id, report.summary());

        if let Some(dir) = &self.config.artifacts_dir {
            ArtifactWriter::new(dir).write_if_possible(&report, scenarios);
        }
        report
    }

    /// Run one scenario in isolation: its own subprocess, or its own server
    #[instrument(skip(self, scenario, channel), fields(scenario = %scenario.id, channel = %channel))]
    pub async fn run_scenario(&self, scenario: &Scenario, channel: Channel) -> Verdict {
        let start = Instant::now();
        let response = self.execute(scenario, channel, start).await;
        Verdict::from_response(scenario, channel, response, start.elapsed())
    }

    /// The deadline wraps the work inside a server's scope so that a timed-out
    /// scenario still goes through the graceful teardown.
    async fn execute(
        &self,
        scenario: &Scenario,
        channel: Channel,
        start: Instant,
    ) -> HarnessResult<InvocationResult> {
        let mode = error_mode(&scenario.expectation);
        let deadline = self.config.scenario_deadline();
        match channel {
            Channel::Cli => {
                within_deadline(
                    &scenario.id,
                    deadline,
                    start,
                    self.invoker.decide(&scenario.bundle, &scenario.payload, mode),
                )
                .await
            }
            Channel::Server => {
                let lease = self.ports.acquire().await?;
                let payload = &scenario.payload;
                let id = scenario.id.as_str();
                self.servers
                    .scoped(&scenario.bundle, lease.port, |client| async move {
                        within_deadline(id, deadline, start, async {
                            mode.apply(client.decide(payload).await?)
                        })
                        .await
                    })
                    .await
            }
        }
    }

    /// Share one server across every scenario of a bundle, once it has been
    /// shown to answer the same request identically twice.
    async fn run_shared(
        &self,
        bundle: &Path,
        indices: &[usize],
        scenarios: &[Scenario],
    ) -> Vec<(usize, Verdict)> {
        let Some(&first) = indices.first() else {
            return Vec::new();
        };

        let mut handle = match self.servers.start(bundle).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "Shared server for {:?} did not start ({}); running scenarios in isolation",
                    bundle, e
                );
                return self.run_isolated(indices, scenarios).await;
            }
        };

        let client = handle.client();
        if let Err(reason) = check_stateless(&client, &scenarios[first].payload).await {
            warn!(
                "Server for {:?} failed the statelessness check ({}); running scenarios in isolation",
                bundle, reason
            );
            if let Err(e) = handle.shutdown().await {
                warn!("Shared server teardown failed: {}", e);
            }
            return self.run_isolated(indices, scenarios).await;
        }
        debug!("Sharing server {} for {:?}", client.base_url(), bundle);

        // One engine instance gives no isolation between concurrent
        // evaluations, so requests against it go one at a time.
        let deadline = self.config.scenario_deadline();
        let mut verdicts = Vec::with_capacity(indices.len());
        for &index in indices {
            let scenario = &scenarios[index];
            let start = Instant::now();
            let mode = error_mode(&scenario.expectation);
            let response = within_deadline(&scenario.id, deadline, start, async {
                mode.apply(client.decide(&scenario.payload).await?)
            })
            .await;
            verdicts.push((
                index,
                Verdict::from_response(scenario, Channel::Server, response, start.elapsed()),
            ));
        }

        if let Err(e) = handle.shutdown().await {
            warn!("Shared server teardown failed: {}", e);
        }
        verdicts
    }

    async fn run_isolated(&self, indices: &[usize], scenarios: &[Scenario]) -> Vec<(usize, Verdict)> {
        stream::iter(indices.iter().copied())
            .map(|index| async move {
                (index, self.run_scenario(&scenarios[index], Channel::Server).await)
            })
            .buffer_unordered(self.config.jobs)
            .collect()
            .await
    }

    /// Check the auxiliary commands for presence and well-formed output
    pub async fn probe(&self, lint_bundle: Option<&Path>) -> Vec<ProbeOutcome> {
        let mut outcomes = vec![self.probe_version().await, self.probe_help().await];
        if let Some(bundle) = lint_bundle {
            outcomes.push(self.probe_lint(bundle).await);
        }
        outcomes
    }

    async fn probe_version(&self) -> ProbeOutcome {
        let (passed, detail) = match self.invoker.run_auxiliary(&["version"]).await {
            Ok(result) if !result.success() => (false, format!("exited with {}", result.status)),
            Ok(result) if result.stdout_lossy().trim().is_empty() => {
                (false, "printed nothing".to_string())
            }
            Ok(result) => (true, result.stdout_lossy().trim().to_string()),
            Err(e) => (false, e.to_string()),
        };
        probe_outcome("version", passed, detail)
    }

    async fn probe_help(&self) -> ProbeOutcome {
        let (passed, detail) = match self.invoker.run_auxiliary(&["--help"]).await {
            Ok(result) if !result.success() => (false, format!("exited with {}", result.status)),
            Ok(result) => {
                let expected = [
                    self.config.engine_name.as_str(),
                    "commands",
                    "test",
                    "serve",
                    "lint",
                ];
                let report = match_fragments(&result.stdout_lossy(), &expected);
                match report.explain() {
                    None => (true, "lists the expected commands".to_string()),
                    Some(explanation) => (false, explanation),
                }
            }
            Err(e) => (false, e.to_string()),
        };
        probe_outcome("help", passed, detail)
    }

    async fn probe_lint(&self, bundle: &Path) -> ProbeOutcome {
        let path = bundle.display().to_string();
        let (passed, detail) = match self.invoker.run_auxiliary(&["lint", "-f", path.as_str()]).await {
            Ok(result) => match result.status {
                InvocationStatus::Exit(Some(0)) => (true, "no findings".to_string()),
                InvocationStatus::Exit(Some(1)) => (true, "reported warnings".to_string()),
                status => (
                    false,
                    format!("exited with {status}: {}", result.stderr_lossy().trim()),
                ),
            },
            Err(e) => (false, e.to_string()),
        };
        probe_outcome("lint", passed, detail)
    }
}

/// Run `work` in whatever is left of a deadline that started at `start`.
///
/// Dropping the timed-out future kills whatever process it owned.
async fn within_deadline<F>(
    id: &str,
    deadline: Duration,
    start: Instant,
    work: F,
) -> HarnessResult<InvocationResult>
where
    F: std::future::Future<Output = HarnessResult<InvocationResult>>,
{
    let remaining = deadline.saturating_sub(start.elapsed());
    match tokio::time::timeout(remaining, work).await {
        Ok(response) => response,
        Err(_) => Err(HarnessError::Timeout {
            operation: format!("scenario {id}"),
            after: deadline,
        }),
    }
}

fn probe_outcome(name: &str, passed: bool, detail: String) -> ProbeOutcome {
    debug!("Probe {}: passed={} ({})", name, passed, detail);
    ProbeOutcome {
        name: name.to_string(),
        passed,
        detail,
    }
}

/// Send the same payload twice; both answers must normalize identically
async fn check_stateless(client: &ServerClient, payload: &Value) -> Result<(), String> {
    let first = normalized_answer(client, payload).await?;
    let second = normalized_answer(client, payload).await?;
    if first == second {
        Ok(())
    } else {
        Err(format!(
            "repeated request answered {:?} then {:?}",
            first, second
        ))
    }
}

async fn normalized_answer(
    client: &ServerClient,
    payload: &Value,
) -> Result<(Outcome, Vec<Outcome>), String> {
    let result = ErrorMode::Strict
        .apply(client.decide(payload).await.map_err(|e| e.to_string())?)
        .map_err(|e| e.to_string())?;
    let decision = Decision::parse(&result.stdout).map_err(|e| e.to_string())?;
    Ok((
        decision.outcome,
        decision.references.iter().map(|r| r.outcome).collect(),
    ))
}
