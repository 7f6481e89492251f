//! Gauntlet core: drives a black-box policy decision engine through a scenario matrix

pub mod config;
pub mod decision;
pub mod error;
pub mod invoker;
pub mod orchestrator;
pub mod report;
pub mod scenario;
pub mod server;
pub mod taxonomy;

pub use config::{Channel, HarnessConfig, ServerScope};
pub use decision::{normalize, Decision, Normalized, Outcome};
pub use error::{FailureKind, HarnessError, HarnessResult};
pub use orchestrator::{evaluate, Harness, Verdict};
pub use report::{ProbeOutcome, RunReport};
pub use scenario::{Expectation, Scenario, ScenarioRegistry};
