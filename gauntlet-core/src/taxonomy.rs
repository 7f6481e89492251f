//! Error taxonomy matcher
//!
//! Engine diagnostics are free text, so a failure category is defined purely by
//! the substrings its diagnostics must contain. Matching is conjunctive and
//! case-insensitive, and reports every fragment individually so a failing
//! check names exactly what was missing.

use serde::{Deserialize, Serialize};

/// Named failure categories the engine is expected to report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bundle is not well-formed YAML
    MalformedSyntax,
    /// A rule failed to compile
    RuleCompilation,
    /// A library or policy reference does not resolve
    UnresolvedReference,
    /// Library dependencies form a cycle
    ReferenceCycle,
    /// Bundle file or requested operation does not exist
    MissingBundle,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::MalformedSyntax,
        ErrorCategory::RuleCompilation,
        ErrorCategory::UnresolvedReference,
        ErrorCategory::ReferenceCycle,
        ErrorCategory::MissingBundle,
    ];

    /// Fragments every diagnostic of this category contains
    pub fn fragments(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::MalformedSyntax => &["yaml", "expected ':'"],
            ErrorCategory::RuleCompilation => &["rego compilation failed"],
            ErrorCategory::UnresolvedReference => &["reference", "not found"],
            ErrorCategory::ReferenceCycle => &["cycle"],
            ErrorCategory::MissingBundle => &["no such file or directory"],
        }
    }

    pub fn fragment_strings(&self) -> Vec<String> {
        self.fragments().iter().map(|f| f.to_string()).collect()
    }

    /// Every category whose fragments all appear in `text`
    pub fn classify(text: &str) -> Vec<ErrorCategory> {
        let haystack = text.to_lowercase();
        Self::ALL
            .into_iter()
            .filter(|category| {
                category
                    .fragments()
                    .iter()
                    .all(|fragment| haystack.contains(&fragment.to_lowercase()))
            })
            .collect()
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::MalformedSyntax => "malformed_syntax",
            ErrorCategory::RuleCompilation => "rule_compilation",
            ErrorCategory::UnresolvedReference => "unresolved_reference",
            ErrorCategory::ReferenceCycle => "reference_cycle",
            ErrorCategory::MissingBundle => "missing_bundle",
        };
        f.write_str(name)
    }
}

/// Join diagnostics the way the engine reports them: stderr first, then stdout
pub fn combined_diagnostics(stderr: &str, stdout: &str) -> String {
    format!("{stderr}\n{stdout}")
}

/// Outcome of checking one expected fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentCheck {
    pub fragment: String,
    pub present: bool,
}

/// Per-fragment result of a conjunctive match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentReport {
    pub checks: Vec<FragmentCheck>,
}

impl FragmentReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.present)
    }

    pub fn missing(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.present)
            .map(|c| c.fragment.as_str())
            .collect()
    }

    /// Human-readable explanation naming each missing fragment
    pub fn explain(&self) -> Option<String> {
        let missing = self.missing();
        if missing.is_empty() {
            return None;
        }
        let listed = missing
            .iter()
            .map(|f| format!("'{f}'"))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!(
            "expected error fragment(s) not found in engine output: {listed}"
        ))
    }
}

/// Check every fragment against `text`, case-insensitively
pub fn match_fragments<S: AsRef<str>>(text: &str, fragments: &[S]) -> FragmentReport {
    let haystack = text.to_lowercase();
    let checks = fragments
        .iter()
        .map(|fragment| {
            let fragment = fragment.as_ref();
            FragmentCheck {
                fragment: fragment.to_string(),
                present: haystack.contains(&fragment.to_lowercase()),
            }
        })
        .collect();
    FragmentReport { checks }
}
