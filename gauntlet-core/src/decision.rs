//! Decision vocabulary normalization and the typed decision-document parser.
//!
//! Engines spell the same outcome several ways (`ALLOW`, `PERMIT`, `GRANT`,
//! `DENY`, `REJECT`). Everything the harness compares goes through
//! [`normalize`] first, so the oracle only ever sees two canonical values.
//! Tokens outside the vocabulary are kept verbatim so drift stays visible.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};

/// Canonical two-state outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Grant,
    Deny,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Grant => "GRANT",
            Outcome::Deny => "DENY",
        }
    }
}

/// Manifests may spell expected outcomes with any recognized synonym
impl<'de> Deserialize<'de> for Outcome {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        normalize(Some(&token)).outcome().ok_or_else(|| {
            serde::de::Error::custom(format!(
                "unrecognized decision {token:?}, expected GRANT/ALLOW/PERMIT or DENY/REJECT"
            ))
        })
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of normalizing an arbitrary decision token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Normalized {
    /// A recognized synonym, mapped to its canonical outcome
    Canonical(Outcome),
    /// Not in the vocabulary; carries the trimmed, uppercased token
    Unrecognized(String),
    /// Absent or blank input
    Empty,
}

impl Normalized {
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Normalized::Canonical(outcome) => Some(*outcome),
            _ => None,
        }
    }

    pub fn is(&self, outcome: Outcome) -> bool {
        self.outcome() == Some(outcome)
    }
}

impl std::fmt::Display for Normalized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Normalized::Canonical(outcome) => f.write_str(outcome.as_str()),
            Normalized::Unrecognized(token) => f.write_str(token),
            Normalized::Empty => Ok(()),
        }
    }
}

/// Normalize a decision token, case- and whitespace-insensitively.
///
/// `normalize(Some(&normalize(x).to_string()))` always equals `normalize(x)`.
pub fn normalize(token: Option<&str>) -> Normalized {
    let Some(raw) = token else {
        return Normalized::Empty;
    };

    let upper = raw.trim().to_uppercase();
    match upper.as_str() {
        "" => Normalized::Empty,
        "ALLOW" | "PERMIT" | "GRANT" => Normalized::Canonical(Outcome::Grant),
        "DENY" | "REJECT" => Normalized::Canonical(Outcome::Deny),
        _ => Normalized::Unrecognized(upper),
    }
}

/// A sub-decision contributed by one referenced policy or library
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceDecision {
    pub outcome: Outcome,
    /// The reference entry exactly as the engine reported it
    pub raw: Value,
}

/// A well-formed decision: canonical outcome plus ordered reference decisions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub references: Vec<ReferenceDecision>,
}

impl Decision {
    /// References whose outcome normalized to `DENY`
    pub fn deny_references(&self) -> Vec<&ReferenceDecision> {
        self.references
            .iter()
            .filter(|r| r.outcome == Outcome::Deny)
            .collect()
    }

    /// Parse engine output into a decision, failing closed on any unexpected shape.
    ///
    /// The document must be a JSON object with a `decision` key. `references`
    /// may be omitted (engines drop empty lists), but when present it must be
    /// an array of objects that each carry a `decision`. Unknown extra fields
    /// are ignored.
    pub fn parse(output: &[u8]) -> HarnessResult<Decision> {
        let text = String::from_utf8_lossy(output);
        let malformed = |reason: String| HarnessError::MalformedOutput {
            reason,
            output: text.to_string(),
        };

        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(malformed("output is empty".to_string()));
        }

        let document: Value = serde_json::from_str(trimmed)
            .map_err(|e| malformed(format!("output is not JSON ({e})")))?;

        let object = document
            .as_object()
            .ok_or_else(|| malformed(format!("expected a JSON object, got {}", type_name(&document))))?;

        let token = object
            .get("decision")
            .ok_or_else(|| malformed("missing `decision` field".to_string()))?;
        let outcome = canonical_outcome(token, "decision", &malformed)?;

        let references = match object.get("references") {
            None => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .enumerate()
                .map(|(index, entry)| -> HarnessResult<ReferenceDecision> {
                    let location = format!("references[{index}].decision");
                    let token = entry
                        .as_object()
                        .and_then(|e| e.get("decision"))
                        .ok_or_else(|| {
                            malformed(format!("{location} is missing or the entry is not an object"))
                        })?;
                    Ok(ReferenceDecision {
                        outcome: canonical_outcome(token, &location, &malformed)?,
                        raw: entry.clone(),
                    })
                })
                .collect::<HarnessResult<Vec<_>>>()?,
            Some(other) => {
                return Err(malformed(format!(
                    "`references` must be an array, got {}",
                    type_name(other)
                )))
            }
        };

        Ok(Decision {
            outcome,
            references,
        })
    }
}

/// How an absent or blank token is reported
const EMPTY_MARKER: &str = "<empty>";

fn canonical_outcome(
    token: &Value,
    location: &str,
    malformed: &dyn Fn(String) -> HarnessError,
) -> HarnessResult<Outcome> {
    let normalized = match token {
        Value::String(s) => normalize(Some(s)),
        Value::Number(n) => normalize(Some(&n.to_string())),
        Value::Null => Normalized::Empty,
        other => {
            return Err(malformed(format!(
                "{location} must be a string token, got {}",
                type_name(other)
            )))
        }
    };

    normalized
        .outcome()
        .ok_or_else(|| HarnessError::NormalizationMismatch {
            token: match &normalized {
                Normalized::Empty => EMPTY_MARKER.to_string(),
                other => other.to_string(),
            },
            location: location.to_string(),
        })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
