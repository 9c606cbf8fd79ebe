//! Boundary to the external browser test executor.
//!
//! The executor runs a test case (or a fixture's setup steps) in a real
//! browser and reports per-step results. Everything here is a data contract;
//! the orchestrator treats calls as slow and fallible.

pub mod http;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fixtures::{BrowserState, Fixture, ResolvedFixture};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor unreachable: {0}")]
    Transport(String),
    #[error("executor protocol error: {0}")]
    Protocol(String),
    #[error("executor rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("executor reported failure: {0}")]
    Failed(String),
}

impl From<reqwest::Error> for ExecutorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExecutorError::Protocol(e.to_string())
        } else {
            ExecutorError::Transport(e.to_string())
        }
    }
}

/// Browser engine name as understood by the executor (`chromium`, `firefox`, `webkit`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Browser(String);

impl Browser {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Browser {
    fn default() -> Self {
        Self("chromium".to_string())
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored browser test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    /// Executor step objects (`{"action": ..., "target": ..., "value": ...}`).
    pub steps: Vec<serde_json::Value>,
    pub tags: Vec<String>,
    pub fixture_ids: Vec<i64>,
}

impl TestCase {
    /// Step `n` (1-based, as reported by the executor).
    pub fn step(&self, number: u32) -> Option<&serde_json::Value> {
        (number as usize).checked_sub(1).and_then(|i| self.steps.get(i))
    }
}

/// Where a test runs: the project's base URL and resolved variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    pub base_url: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: u32,
    pub status: StepStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What went wrong in a failed attempt, in the shape the classifier consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub error: String,
    /// Base64 PNG of the page at failure, when the executor captured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl FailureDetail {
    pub fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }
}

/// Structured result of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub passed: bool,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
}

impl ExecutionOutcome {
    pub fn passed(step_results: Vec<StepResult>) -> Self {
        Self {
            passed: true,
            step_results,
            failure: None,
        }
    }

    pub fn failed(failure: FailureDetail) -> Self {
        Self {
            passed: false,
            step_results: Vec::new(),
            failure: Some(failure),
        }
    }

    /// The failure detail, synthesizing one when the executor reported none.
    pub fn failure_detail(&self) -> FailureDetail {
        self.failure
            .clone()
            .unwrap_or_else(|| FailureDetail::message("test failed without failure detail"))
    }
}

/// Everything one execution call needs.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub test_case: &'a TestCase,
    pub fixtures: &'a [ResolvedFixture],
    pub environment: &'a Environment,
    pub browser: &'a Browser,
}

/// Runs a test case against a real browser.
#[async_trait::async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Runs a fixture's setup steps and captures the resulting browser state.
#[async_trait::async_trait]
pub trait FixtureCapturer: Send + Sync {
    async fn capture(&self, fixture: &Fixture, browser: &Browser) -> Result<BrowserState, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lookup_is_one_based() {
        let tc = TestCase {
            id: 1,
            project_id: 1,
            name: "login".into(),
            steps: vec![serde_json::json!({"action": "goto"}), serde_json::json!({"action": "click"})],
            tags: vec![],
            fixture_ids: vec![],
        };
        assert_eq!(tc.step(1).unwrap()["action"], "goto");
        assert_eq!(tc.step(2).unwrap()["action"], "click");
        assert!(tc.step(0).is_none());
        assert!(tc.step(3).is_none());
    }

    #[test]
    fn test_missing_failure_detail_is_synthesized() {
        let outcome = ExecutionOutcome {
            passed: false,
            step_results: vec![],
            failure: None,
        };
        assert!(outcome.failure_detail().error.contains("without failure detail"));
    }
}
