//! Scenario registry: the (bundle, payload, expectation) matrix under test.
//!
//! Scenarios come from a YAML suite manifest. Each suite names one bundle and
//! either explicit `cases` or a `payloads` list that shares the suite's
//! expectation. Payload files are read at load time; bundles are not, since a
//! missing bundle is itself something a scenario can assert on.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Channel;
use crate::decision::Outcome;
use crate::error::{HarnessError, HarnessResult};
use crate::taxonomy::ErrorCategory;

/// What a scenario requires of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// Successful run whose top-level decision normalizes to the value
    ExactDecision(Outcome),
    /// Non-zero exit whose diagnostics contain every fragment
    ErrorContains(Vec<String>),
    /// Successful run with the given decision and no reference normalizing to `DENY`
    DecisionAndNoDenyReferences(Outcome),
    /// Successful run whose top-level decision is anything but the value
    NotDecision(Outcome),
    /// Either a successful `DENY` or a non-zero exit containing every fragment
    DenyOrErrorContains(Vec<String>),
}

impl Expectation {
    /// Whether a non-zero exit can satisfy this expectation
    pub fn accepts_process_failure(&self) -> bool {
        matches!(
            self,
            Expectation::ErrorContains(_) | Expectation::DenyOrErrorContains(_)
        )
    }

    /// Whether a successful decision can satisfy this expectation
    pub fn accepts_decision(&self) -> bool {
        !matches!(self, Expectation::ErrorContains(_))
    }

    /// Channel this kind runs on when neither scenario nor suite picks one
    pub fn preferred_channel(&self) -> Option<Channel> {
        match self {
            Expectation::ErrorContains(_) => Some(Channel::Cli),
            _ => None,
        }
    }
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expectation::ExactDecision(outcome) => write!(f, "decision {outcome}"),
            Expectation::ErrorContains(fragments) => {
                write!(f, "error containing {}", quote_all(fragments))
            }
            Expectation::DecisionAndNoDenyReferences(outcome) => {
                write!(f, "decision {outcome} with no DENY references")
            }
            Expectation::NotDecision(outcome) => write!(f, "any decision but {outcome}"),
            Expectation::DenyOrErrorContains(fragments) => {
                write!(f, "DENY or error containing {}", quote_all(fragments))
            }
        }
    }
}

fn quote_all(fragments: &[String]) -> String {
    fragments
        .iter()
        .map(|f| format!("'{f}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One unit of harness work. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    /// `<suite>::<case>`
    pub id: String,
    pub bundle: PathBuf,
    pub payload: Value,
    pub expectation: Expectation,
    /// Channel requested by the manifest, if any
    pub channel: Option<Channel>,
}

impl Scenario {
    /// Channel to use given the run-wide default
    pub fn resolve_channel(&self, default: Channel) -> Channel {
        self.channel
            .or_else(|| self.expectation.preferred_channel())
            .unwrap_or(default)
    }
}

/// Manifest spelling of an expectation; categories expand to their fragments
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExpectationEntry {
    ExactDecision(Outcome),
    ErrorContains(Vec<String>),
    ErrorCategory(ErrorCategory),
    DecisionAndNoDenyReferences(Outcome),
    NotDecision(Outcome),
    DenyOrErrorContains(Vec<String>),
    DenyOrErrorCategory(ErrorCategory),
}

impl From<ExpectationEntry> for Expectation {
    fn from(entry: ExpectationEntry) -> Self {
        match entry {
            ExpectationEntry::ExactDecision(o) => Expectation::ExactDecision(o),
            ExpectationEntry::ErrorContains(f) => Expectation::ErrorContains(f),
            ExpectationEntry::ErrorCategory(c) => Expectation::ErrorContains(c.fragment_strings()),
            ExpectationEntry::DecisionAndNoDenyReferences(o) => {
                Expectation::DecisionAndNoDenyReferences(o)
            }
            ExpectationEntry::NotDecision(o) => Expectation::NotDecision(o),
            ExpectationEntry::DenyOrErrorContains(f) => Expectation::DenyOrErrorContains(f),
            ExpectationEntry::DenyOrErrorCategory(c) => {
                Expectation::DenyOrErrorContains(c.fragment_strings())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default)]
    bundle_dir: Option<PathBuf>,
    #[serde(default)]
    payload_dir: Option<PathBuf>,
    suites: Vec<SuiteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SuiteEntry {
    name: String,
    bundle: PathBuf,
    #[serde(default)]
    channel: Option<Channel>,
    /// Shared by `payloads` and by cases without their own `expect`
    #[serde(default)]
    expect: Option<ExpectationEntry>,
    #[serde(default)]
    payloads: Vec<PathBuf>,
    #[serde(default)]
    cases: Vec<CaseEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaseEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    payload: Option<PathBuf>,
    #[serde(default)]
    payload_inline: Option<Value>,
    #[serde(default)]
    expect: Option<ExpectationEntry>,
    #[serde(default)]
    channel: Option<Channel>,
}

/// Ordered, identity-unique set of scenarios
#[derive(Debug, Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: Vec<Scenario>,
}

impl ScenarioRegistry {
    /// Build a registry from already-constructed scenarios
    pub fn new(scenarios: Vec<Scenario>) -> HarnessResult<Self> {
        let mut seen = HashSet::new();
        for scenario in &scenarios {
            if !seen.insert(scenario.id.as_str()) {
                return Err(HarnessError::Config {
                    path: PathBuf::new(),
                    reason: format!("duplicate scenario '{}'", scenario.id),
                });
            }
        }
        Ok(Self { scenarios })
    }

    /// Load a suite manifest from disk
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        info!("Loading scenario manifest from: {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            reason: format!("cannot read manifest: {e}"),
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_manifest_str(&content, base).map_err(|e| match e {
            HarnessError::Config { reason, .. } => HarnessError::Config {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse a manifest; relative paths resolve against `base`
    pub fn from_manifest_str(content: &str, base: &Path) -> HarnessResult<Self> {
        let config_error = |reason: String| HarnessError::Config {
            path: base.to_path_buf(),
            reason,
        };

        // Expectations are written as one-entry maps (`{ exact_decision: GRANT }`)
        // rather than YAML tags
        let manifest: Manifest = serde_yaml_ng::with::singleton_map_recursive::deserialize(
            serde_yaml_ng::Deserializer::from_str(content),
        )
        .map_err(|e| config_error(e.to_string()))?;
        let bundle_dir = join(base, manifest.bundle_dir.as_deref());
        let payload_dir = join(base, manifest.payload_dir.as_deref());

        let mut scenarios = Vec::new();
        for suite in manifest.suites {
            if suite.payloads.is_empty() && suite.cases.is_empty() {
                return Err(config_error(format!(
                    "suite '{}' has neither cases nor payloads",
                    suite.name
                )));
            }

            let bundle = join(&bundle_dir, Some(&suite.bundle));

            for payload in &suite.payloads {
                let expect = suite.expect.clone().ok_or_else(|| {
                    config_error(format!(
                        "suite '{}' lists payloads but has no suite-level expect",
                        suite.name
                    ))
                })?;
                let payload_path = join(&payload_dir, Some(payload));
                scenarios.push(Scenario {
                    id: format!("{}::{}", suite.name, file_stem(payload)),
                    bundle: bundle.clone(),
                    payload: read_payload(&payload_path).map_err(config_error)?,
                    expectation: expect.into(),
                    channel: suite.channel,
                });
            }

            for (index, case) in suite.cases.into_iter().enumerate() {
                let expect = case.expect.or_else(|| suite.expect.clone()).ok_or_else(|| {
                    config_error(format!(
                        "case {} of suite '{}' has no expect",
                        index, suite.name
                    ))
                })?;

                let (case_name, payload) = match (case.payload, case.payload_inline) {
                    (Some(file), None) => {
                        let payload_path = join(&payload_dir, Some(&file));
                        let payload = read_payload(&payload_path).map_err(config_error)?;
                        (case.name.unwrap_or_else(|| file_stem(&file)), payload)
                    }
                    (None, Some(inline)) => (
                        case.name.unwrap_or_else(|| format!("inline-{index}")),
                        inline,
                    ),
                    _ => {
                        return Err(config_error(format!(
                            "case {} of suite '{}' needs exactly one of payload or payload_inline",
                            index, suite.name
                        )))
                    }
                };

                scenarios.push(Scenario {
                    id: format!("{}::{}", suite.name, case_name),
                    bundle: bundle.clone(),
                    payload,
                    expectation: expect.into(),
                    channel: case.channel.or(suite.channel),
                });
            }
        }

        debug!("Loaded {} scenarios", scenarios.len());
        Self::new(scenarios).map_err(|e| match e {
            HarnessError::Config { reason, .. } => config_error(reason),
            other => other,
        })
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn into_scenarios(self) -> Vec<Scenario> {
        self.scenarios
    }

    /// Keep scenarios whose identity matches any glob pattern.
    ///
    /// No patterns keeps everything. A pattern that does not parse as a glob
    /// matches identities literally. Matching nothing is an error.
    pub fn select(self, patterns: &[String]) -> HarnessResult<Self> {
        if patterns.is_empty() {
            return Ok(self);
        }

        let matchers: Vec<IdMatcher> = patterns.iter().map(|p| IdMatcher::new(p)).collect();
        let scenarios: Vec<Scenario> = self
            .scenarios
            .into_iter()
            .filter(|s| matchers.iter().any(|m| m.matches(&s.id)))
            .collect();

        if scenarios.is_empty() {
            return Err(HarnessError::Config {
                path: PathBuf::new(),
                reason: format!("no scenario matches {}", patterns.join(", ")),
            });
        }
        debug!("{} scenarios selected by {:?}", scenarios.len(), patterns);
        Ok(Self { scenarios })
    }
}

enum IdMatcher {
    Glob(Pattern),
    Literal(String),
}

impl IdMatcher {
    fn new(pattern: &str) -> Self {
        match Pattern::new(pattern) {
            Ok(glob) => IdMatcher::Glob(glob),
            Err(_) => IdMatcher::Literal(pattern.to_string()),
        }
    }

    fn matches(&self, id: &str) -> bool {
        match self {
            IdMatcher::Glob(glob) => glob.matches(id),
            IdMatcher::Literal(literal) => literal == id,
        }
    }
}

fn join(base: &Path, path: Option<&Path>) -> PathBuf {
    match path {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => base.join(p),
        None => base.to_path_buf(),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn read_payload(path: &Path) -> Result<Value, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read payload {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("payload {} is not JSON: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("payloads")).unwrap();
        std::fs::write(
            dir.path().join("payloads/valid_admin.json"),
            r#"{"principal":{"roles":["admin"]},"operation":"api:documents:read"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("payloads/non_admin.json"),
            r#"{"principal":{"roles":["viewer"]}}"#,
        )
        .unwrap();
        dir
    }

    const MANIFEST: &str = r#"
bundle_dir: bundles
payload_dir: payloads
suites:
  - name: consolidated
    bundle: consolidated.yml
    cases:
      - payload: valid_admin.json
        expect: { decision_and_no_deny_references: ALLOW }
      - payload: non_admin.json
        expect: { not_decision: GRANT }
        channel: server
  - name: broken_alpha
    bundle: broken_alpha.yml
    payloads: [valid_admin.json, non_admin.json]
    expect: { error_category: reference_cycle }
  - name: mixed
    bundle: mixed_invalid.yml
    channel: server
    expect: { deny_or_error_contains: ["validation failed"] }
    cases:
      - payload_inline: { principal: { roles: [] } }
"#;

    #[test]
    fn test_manifest_expands_matrix() {
        let dir = fixture_dir();
        let registry = ScenarioRegistry::from_manifest_str(MANIFEST, dir.path()).unwrap();

        let ids: Vec<&str> = registry.scenarios().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "consolidated::valid_admin",
                "consolidated::non_admin",
                "broken_alpha::valid_admin",
                "broken_alpha::non_admin",
                "mixed::inline-0",
            ]
        );

        let first = &registry.scenarios()[0];
        assert_eq!(first.bundle, dir.path().join("bundles/consolidated.yml"));
        assert_eq!(
            first.expectation,
            Expectation::DecisionAndNoDenyReferences(Outcome::Grant)
        );
        assert_eq!(first.payload["operation"], "api:documents:read");

        let cycle = &registry.scenarios()[2];
        assert_eq!(
            cycle.expectation,
            Expectation::ErrorContains(vec!["cycle".to_string()])
        );
        assert_eq!(cycle.resolve_channel(Channel::Server), Channel::Cli);

        let inline = &registry.scenarios()[4];
        assert_eq!(inline.payload, json!({"principal": {"roles": []}}));
        assert_eq!(inline.channel, Some(Channel::Server));
        assert_eq!(registry.scenarios()[1].channel, Some(Channel::Server));
    }

    #[test]
    fn test_documented_manifest_layout_loads() {
        let dir = fixture_dir();
        std::fs::write(
            dir.path().join("payloads/admin_with_write_api_scope.json"),
            r#"{"principal":{"roles":["admin"],"scopes":["api:write"]}}"#,
        )
        .unwrap();
        let manifest = r#"
bundle_dir: bundles          # optional, relative to the manifest
payload_dir: payloads        # optional, relative to the manifest
suites:
  - name: consolidated
    bundle: consolidated.yml
    channel: cli             # optional: cli | server
    cases:
      - payload: valid_admin.json
        expect: { decision_and_no_deny_references: GRANT }
      - payload: admin_with_write_api_scope.json
        expect: { not_decision: GRANT }
  - name: broken_alpha
    bundle: broken_alpha.yml
    payloads: [valid_admin.json, non_admin.json]   # cartesian expansion
    expect: { error_category: reference_cycle }
"#;
        let registry = ScenarioRegistry::from_manifest_str(manifest, dir.path()).unwrap();

        let ids: Vec<&str> = registry.scenarios().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "consolidated::valid_admin",
                "consolidated::admin_with_write_api_scope",
                "broken_alpha::valid_admin",
                "broken_alpha::non_admin",
            ]
        );
        assert_eq!(registry.scenarios()[0].channel, Some(Channel::Cli));
        assert_eq!(
            registry.scenarios()[1].expectation,
            Expectation::NotDecision(Outcome::Grant)
        );
        assert_eq!(
            registry.scenarios()[3].expectation,
            Expectation::ErrorContains(vec!["cycle".to_string()])
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dir = fixture_dir();
        let manifest = r#"
payload_dir: payloads
suites:
  - name: dup
    bundle: a.yml
    payloads: [valid_admin.json, valid_admin.json]
    expect: { exact_decision: GRANT }
"#;
        let err = ScenarioRegistry::from_manifest_str(manifest, dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate scenario 'dup::valid_admin'"));
    }

    #[test]
    fn test_missing_payload_is_load_error() {
        let dir = fixture_dir();
        let manifest = r#"
suites:
  - name: s
    bundle: a.yml
    payloads: [nope.json]
    expect: { exact_decision: DENY }
"#;
        let err = ScenarioRegistry::from_manifest_str(manifest, dir.path()).unwrap_err();
        assert!(err.to_string().contains("nope.json"));
    }

    #[test]
    fn test_unknown_decision_token_rejected_in_manifest() {
        let dir = fixture_dir();
        let manifest = r#"
payload_dir: payloads
suites:
  - name: s
    bundle: a.yml
    payloads: [valid_admin.json]
    expect: { exact_decision: MAYBE }
"#;
        assert!(ScenarioRegistry::from_manifest_str(manifest, dir.path()).is_err());
    }

    #[test]
    fn test_case_without_expectation_rejected() {
        let dir = fixture_dir();
        let manifest = r#"
payload_dir: payloads
suites:
  - name: s
    bundle: a.yml
    cases:
      - payload: valid_admin.json
"#;
        let err = ScenarioRegistry::from_manifest_str(manifest, dir.path()).unwrap_err();
        assert!(err.to_string().contains("has no expect"));
    }

    #[test]
    fn test_select_by_glob() {
        let dir = fixture_dir();
        let registry = ScenarioRegistry::from_manifest_str(MANIFEST, dir.path()).unwrap();

        let selected = registry
            .clone()
            .select(&["broken_alpha::*".to_string()])
            .unwrap();
        assert_eq!(selected.len(), 2);

        let everything = registry.clone().select(&[]).unwrap();
        assert_eq!(everything.len(), 5);

        assert!(registry.select(&["nothing::*".to_string()]).is_err());
    }

    #[test]
    fn test_invalid_glob_matches_literally() {
        let scenario = Scenario {
            id: "odd::[x".to_string(),
            bundle: PathBuf::from("b.yml"),
            payload: json!({}),
            expectation: Expectation::ExactDecision(Outcome::Deny),
            channel: None,
        };
        let registry = ScenarioRegistry::new(vec![scenario]).unwrap();
        assert_eq!(registry.select(&["odd::[x".to_string()]).unwrap().len(), 1);
    }

    #[test]
    fn test_expectation_display() {
        assert_eq!(
            Expectation::DecisionAndNoDenyReferences(Outcome::Grant).to_string(),
            "decision GRANT with no DENY references"
        );
        assert_eq!(
            Expectation::ErrorContains(vec!["yaml".into(), "expected ':'".into()]).to_string(),
            "error containing 'yaml', 'expected ':''"
        );
    }
}
