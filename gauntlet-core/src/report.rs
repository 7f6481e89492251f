//! Run reports and per-scenario diagnostic artifacts.
//!
//! Artifacts are only written when an artifacts directory is configured. A
//! failure to write them is logged and never changes a verdict.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::orchestrator::Verdict;
use crate::scenario::Scenario;

/// Outcome of one auxiliary-command check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// All verdicts of one harness run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: usize,
    pub failed: usize,
    pub verdicts: Vec<Verdict>,
}

impl RunReport {
    pub fn new(
        run_id: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        verdicts: Vec<Verdict>,
    ) -> Self {
        let passed = verdicts.iter().filter(|v| v.passed).count();
        Self {
            run_id,
            started_at,
            finished_at,
            passed,
            failed: verdicts.len() - passed,
            verdicts,
        }
    }

    pub fn total(&self) -> usize {
        self.verdicts.len()
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// `"<passed>/<total> scenarios passed"`
    pub fn summary(&self) -> String {
        format!("{}/{} scenarios passed", self.passed, self.total())
    }

    pub fn failures(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| !v.passed)
    }
}

/// Writes `<root>/<run_id>/...` diagnostic trees
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Write everything, logging instead of failing
    pub fn write_if_possible(&self, report: &RunReport, scenarios: &[Scenario]) {
        if let Err(e) = self.write(report, scenarios) {
            warn!("Failed to write run artifacts: {:#}", e);
        }
    }

    pub fn write(&self, report: &RunReport, scenarios: &[Scenario]) -> Result<PathBuf> {
        let run_dir = self.run_dir(&report.run_id);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating artifacts directory {}", run_dir.display()))?;

        for verdict in &report.verdicts {
            let scenario = scenarios.iter().find(|s| s.id == verdict.scenario_id);
            self.write_scenario(&run_dir, verdict, scenario)?;
        }

        let report_path = run_dir.join("report.json");
        fs::write(&report_path, serde_json::to_vec_pretty(report)?)
            .with_context(|| format!("writing {}", report_path.display()))?;
        debug!("Wrote run artifacts to {:?}", run_dir);
        Ok(run_dir)
    }

    fn write_scenario(
        &self,
        run_dir: &Path,
        verdict: &Verdict,
        scenario: Option<&Scenario>,
    ) -> Result<()> {
        let dir = run_dir.join(sanitize_id(&verdict.scenario_id));
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        if let Some(scenario) = scenario {
            fs::write(
                dir.join("payload.json"),
                serde_json::to_vec_pretty(&scenario.payload)?,
            )?;
            // Missing or unreadable bundles are often the point of the scenario
            if let Ok(bundle) = fs::read(&scenario.bundle) {
                fs::write(dir.join("bundle.yml"), bundle)?;
            }
        }

        fs::write(dir.join("stdout.txt"), &verdict.stdout)?;
        fs::write(dir.join("stderr.txt"), &verdict.stderr)?;
        fs::write(dir.join("verdict.json"), serde_json::to_vec_pretty(verdict)?)?;
        Ok(())
    }
}

/// Directory-safe form of a scenario identity
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
