//! Gauntlet - black-box regression harness for policy decision engines
//!
//! Exit codes: 0 when every scenario or probe passed, 1 when any failed,
//! 2 when the run could not be set up (config, manifest, engine binary).

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use gauntlet_core::config::{Channel, HarnessConfig, ServerScope};
use gauntlet_core::orchestrator::Harness;
use gauntlet_core::report::{ProbeOutcome, RunReport};
use gauntlet_core::scenario::ScenarioRegistry;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChannelArg {
    Cli,
    Server,
}

impl From<ChannelArg> for Channel {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Cli => Channel::Cli,
            ChannelArg::Server => Channel::Server,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Function,
    Session,
}

impl From<ScopeArg> for ServerScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Function => ServerScope::Function,
            ScopeArg::Session => ServerScope::Session,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "gauntlet",
    about = "Drive a policy decision engine through a scenario matrix and report verdicts",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Set log level
    #[clap(long, default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON (always on stderr)
    #[clap(long, global = true)]
    log_json: bool,

    /// Harness config file (YAML)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Engine binary; overrides the config file and GAUNTLET_ENGINE_PATH
    #[clap(long, global = true)]
    engine: Option<PathBuf>,

    /// Base port for engine servers
    #[clap(long, global = true)]
    port: Option<u16>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run scenarios from a suite manifest
    Run {
        /// Suite manifest (YAML)
        manifest: PathBuf,

        /// Only run scenarios whose id matches this glob (repeatable)
        #[clap(long = "test", short = 't')]
        tests: Vec<String>,

        /// Maximum scenarios in flight
        #[clap(long, short = 'j')]
        jobs: Option<usize>,

        /// Channel for scenarios that do not choose one
        #[clap(long, value_enum)]
        channel: Option<ChannelArg>,

        /// Server lifetime in server mode
        #[clap(long, value_enum)]
        server_scope: Option<ScopeArg>,

        /// Write per-scenario diagnostics under this directory
        #[clap(long)]
        artifacts: Option<PathBuf>,

        /// Print the full report as JSON
        #[clap(long)]
        json: bool,
    },

    /// List scenarios without running them
    List {
        /// Suite manifest (YAML)
        manifest: PathBuf,

        #[clap(long = "test", short = 't')]
        tests: Vec<String>,

        #[clap(long)]
        json: bool,
    },

    /// Check the engine's auxiliary commands (version, --help, lint)
    Probe {
        /// Bundle to lint
        #[clap(long)]
        lint: Option<PathBuf>,

        #[clap(long)]
        json: bool,
    },
}

/// Initialize tracing from CLI flags. Logs always go to stderr so stdout
/// carries only tables and JSON reports.
fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::new(log_level.to_filter_directive());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    initialize_tracing(&cli.log_level, cli.log_json);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = base_config(&cli)?;

    match cli.command {
        Command::Run {
            manifest,
            tests,
            jobs,
            channel,
            server_scope,
            artifacts,
            json,
        } => {
            if let Some(jobs) = jobs {
                config.jobs = jobs;
            }
            if let Some(channel) = channel {
                config.channel = channel.into();
            }
            if let Some(scope) = server_scope {
                config.server_scope = scope.into();
            }
            if artifacts.is_some() {
                config.artifacts_dir = artifacts;
            }

            let registry = load_registry(&manifest, &tests)?;
            let harness = Harness::new(config).context("Failed to set up the harness")?;
            let report = harness.run(&registry).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(exit_code(report.all_passed()))
        }

        Command::List {
            manifest,
            tests,
            json,
        } => {
            let registry = load_registry(&manifest, &tests)?;
            if json {
                println!("{}", serde_json::to_string_pretty(registry.scenarios())?);
            } else {
                let rows: Vec<ScenarioRow> = registry
                    .scenarios()
                    .iter()
                    .map(|s| ScenarioRow {
                        id: s.id.clone(),
                        bundle: s.bundle.display().to_string(),
                        channel: s.resolve_channel(config.channel).to_string(),
                        expectation: s.expectation.to_string(),
                    })
                    .collect();
                println!("{}", render(&rows));
                println!("{} scenario(s)", registry.len());
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Probe { lint, json } => {
            let harness = Harness::new(config).context("Failed to set up the harness")?;
            let outcomes = harness.probe(lint.as_deref()).await;
            let all_passed = outcomes.iter().all(|o| o.passed);

            if json {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            } else {
                print_probes(&outcomes);
            }
            Ok(exit_code(all_passed))
        }
    }
}

/// Defaults, then the config file, then environment, then global flags
fn base_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid harness environment")?;

    if let Some(engine) = &cli.engine {
        config.engine_path = Some(engine.clone());
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    debug!("Harness config: {:?}", config);
    Ok(config)
}

fn load_registry(manifest: &Path, tests: &[String]) -> Result<ScenarioRegistry> {
    let registry = ScenarioRegistry::load(manifest)
        .with_context(|| format!("Failed to load scenarios from {}", manifest.display()))?;
    registry
        .select(tests)
        .context("Scenario filter selected nothing")
}

fn exit_code(passed: bool) -> ExitCode {
    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

#[derive(Tabled)]
struct ScenarioRow {
    #[tabled(rename = "Scenario")]
    id: String,
    #[tabled(rename = "Bundle")]
    bundle: String,
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Expectation")]
    expectation: String,
}

#[derive(Tabled)]
struct VerdictRow {
    #[tabled(rename = "Scenario")]
    id: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Failure")]
    failure: String,
    #[tabled(rename = "Time")]
    elapsed: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Tabled)]
struct ProbeRow {
    #[tabled(rename = "Probe")]
    name: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn render<T: Tabled>(rows: &[T]) -> String {
    Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string()
}

fn pass_fail(passed: bool) -> String {
    let label = if passed { "PASS" } else { "FAIL" };
    label.to_string()
}

fn first_line(text: &str, limit: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > limit {
        let cut: String = line.chars().take(limit).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn print_report(report: &RunReport) {
    let rows: Vec<VerdictRow> = report
        .verdicts
        .iter()
        .map(|v| VerdictRow {
            id: v.scenario_id.clone(),
            result: pass_fail(v.passed),
            failure: v.failure.map(|k| k.to_string()).unwrap_or_default(),
            elapsed: format!("{}ms", v.elapsed.as_millis()),
            detail: first_line(v.explanation.as_deref().unwrap_or_default(), 80),
        })
        .collect();
    println!("{}", render(&rows));

    for verdict in report.failures() {
        println!();
        println!("--- {} ---", verdict.scenario_id);
        println!("expected: {}", verdict.expectation);
        if let Some(explanation) = &verdict.explanation {
            println!("{explanation}");
        }
        if !verdict.stderr.trim().is_empty() {
            println!("stderr:\n{}", verdict.stderr.trim_end());
        }
    }

    println!();
    println!("{}", report.summary());
}

fn print_probes(outcomes: &[ProbeOutcome]) {
    let rows: Vec<ProbeRow> = outcomes
        .iter()
        .map(|o| ProbeRow {
            name: o.name.clone(),
            result: pass_fail(o.passed),
            detail: first_line(&o.detail, 80),
        })
        .collect();
    println!("{}", render(&rows));
}
