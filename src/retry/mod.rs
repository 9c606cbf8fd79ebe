//! Retry orchestration for a single target.
//!
//! One target is a chain of attempts: attempt n+1 starts only after attempt n
//! has been executed and evaluated. Every attempt is a persisted TestRun;
//! attempts after the first point back at the first via `original_run_id`.

pub mod classifier;
pub mod ledger;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use self::classifier::{AttemptRecord, FailureClassifier, ParamAdjustment};
use self::ledger::{NewAttempt, RetryLedger};
use crate::executor::{Browser, Environment, ExecutionOutcome, ExecutionRequest, FailureDetail, TestCase, TestExecutor};
use crate::fixtures::FixtureCache;
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    #[default]
    Simple,
    Intelligent,
}

impl RetryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryMode::Simple => "simple",
            RetryMode::Intelligent => "intelligent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "simple" => Some(RetryMode::Simple),
            "intelligent" => Some(RetryMode::Intelligent),
            _ => None,
        }
    }
}

/// How an attempt ended its part of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Passed,
    /// Failed, and a further attempt was scheduled.
    Retried,
    /// Failed, and the classifier vetoed a retry.
    NotRetryable,
    /// Failed on the last allowed attempt.
    BudgetExhausted,
    /// Left running by an orchestrator that went away.
    OrchestratorRestarted,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Passed => "passed",
            Termination::Retried => "retried",
            Termination::NotRetryable => "not_retryable",
            Termination::BudgetExhausted => "budget_exhausted",
            Termination::OrchestratorRestarted => "orchestrator_restarted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "passed" => Some(Termination::Passed),
            "retried" => Some(Termination::Retried),
            "not_retryable" => Some(Termination::NotRetryable),
            "budget_exhausted" => Some(Termination::BudgetExhausted),
            "orchestrator_restarted" => Some(Termination::OrchestratorRestarted),
            _ => None,
        }
    }
}

/// Only storage failures escape a chain; everything else is a failed attempt.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub mode: RetryMode,
    pub max_retries: u32,
}

/// One target to run to a terminal attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryRequest<'a> {
    pub test_case: &'a TestCase,
    pub environment: &'a Environment,
    pub browser: &'a Browser,
    pub policy: RetryPolicy,
    pub scheduled_run_id: Option<i64>,
    pub thread_id: Option<&'a str>,
}

/// The terminal attempt of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetOutcome {
    pub test_case_id: i64,
    pub root_run_id: i64,
    pub terminal_run_id: i64,
    pub attempts: u32,
    pub passed: bool,
    pub termination: Termination,
}

#[derive(Debug, Clone)]
pub struct RetryTimeouts {
    pub attempt: Duration,
    pub classifier: Duration,
}

#[derive(Clone)]
pub struct RetryOrchestrator {
    ledger: RetryLedger,
    executor: Arc<dyn TestExecutor>,
    classifier: Arc<dyn FailureClassifier>,
    fixtures: FixtureCache,
    timeouts: RetryTimeouts,
    intelligent_enabled: bool,
}

/// What the chain does after a failed attempt.
enum Next {
    Retry { reason: String, recapture: bool },
    Stop(Termination),
}

impl RetryOrchestrator {
    pub fn new(
        ledger: RetryLedger,
        executor: Arc<dyn TestExecutor>,
        classifier: Arc<dyn FailureClassifier>,
        fixtures: FixtureCache,
        timeouts: RetryTimeouts,
        intelligent_enabled: bool,
    ) -> Self {
        Self {
            ledger,
            executor,
            classifier,
            fixtures,
            timeouts,
            intelligent_enabled,
        }
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Run a target to its terminal attempt.
    pub async fn run(&self, request: RetryRequest<'_>) -> Result<TargetOutcome, RetryError> {
        let tc = request.test_case;
        let mode = match request.policy.mode {
            RetryMode::Intelligent if !self.intelligent_enabled => RetryMode::Simple,
            mode => mode,
        };
        let max = request.policy.max_retries;

        let mut attempt: u32 = 0;
        let mut root: Option<i64> = None;
        let mut reason: Option<String> = None;
        let mut recapture = false;
        let mut history: Vec<AttemptRecord> = Vec::new();

        loop {
            let run_id = self
                .ledger
                .start_attempt(
                    NewAttempt {
                        project_id: tc.project_id,
                        test_case_id: tc.id,
                        scheduled_run_id: request.scheduled_run_id,
                        thread_id: request.thread_id.map(str::to_string),
                        retry_attempt: attempt,
                        max_retries: max,
                        original_run_id: root,
                        retry_mode: mode,
                        retry_reason: reason.take(),
                    },
                    Utc::now(),
                )
                .await?;
            let root_id = *root.get_or_insert(run_id);

            let outcome = self.attempt(&request, recapture).await;

            let next = if outcome.passed {
                Next::Stop(Termination::Passed)
            } else {
                history.push(AttemptRecord {
                    attempt,
                    failure: outcome.failure_detail(),
                });
                if attempt >= max {
                    Next::Stop(Termination::BudgetExhausted)
                } else {
                    self.evaluate(mode, tc.id, &history).await
                }
            };

            let termination = match &next {
                Next::Retry { .. } => Termination::Retried,
                Next::Stop(t) => *t,
            };
            self.ledger.finish_attempt(run_id, &outcome, termination, Utc::now()).await?;
            info!(test_case_id = tc.id, run_id, attempt, termination = termination.as_str(), "attempt finished");

            match next {
                Next::Retry { reason: why, recapture: again } => {
                    reason = Some(why);
                    recapture = again;
                    attempt += 1;
                }
                Next::Stop(termination) => {
                    return Ok(TargetOutcome {
                        test_case_id: tc.id,
                        root_run_id: root_id,
                        terminal_run_id: run_id,
                        attempts: attempt + 1,
                        passed: termination == Termination::Passed,
                        termination,
                    });
                }
            }
        }
    }

    /// Decide whether a failed attempt with budget left gets another go.
    async fn evaluate(&self, mode: RetryMode, test_case_id: i64, history: &[AttemptRecord]) -> Next {
        if mode == RetryMode::Simple {
            return Next::Retry {
                reason: "simple retry".to_string(),
                recapture: false,
            };
        }
        let Some(last) = history.last() else {
            return Next::Stop(Termination::NotRetryable);
        };

        let verdict = tokio::time::timeout(
            self.timeouts.classifier,
            self.classifier.classify(&last.failure, history),
        )
        .await;
        match verdict {
            Ok(Ok(c)) if c.retryable => Next::Retry {
                reason: c.reason,
                recapture: c.adjustment == Some(ParamAdjustment::RecaptureFixtures),
            },
            Ok(Ok(c)) => {
                info!(test_case_id, category = ?c.category, reason = %c.reason, "classifier vetoed retry");
                Next::Stop(Termination::NotRetryable)
            }
            Ok(Err(e)) => {
                warn!(test_case_id, error = %e, "classifier failed, not retrying");
                Next::Stop(Termination::NotRetryable)
            }
            Err(_) => {
                warn!(test_case_id, "classifier timed out, not retrying");
                Next::Stop(Termination::NotRetryable)
            }
        }
    }

    /// Resolve fixtures and execute once. Any failure becomes a failed outcome.
    async fn attempt(&self, request: &RetryRequest<'_>, recapture: bool) -> ExecutionOutcome {
        let tc = request.test_case;
        let fixtures = match self.fixtures.resolve_all(&tc.fixture_ids, request.browser, recapture).await {
            Ok(f) => f,
            Err(e) => {
                warn!(test_case_id = tc.id, error = %e, "fixture resolution failed");
                return ExecutionOutcome::failed(FailureDetail::message(format!("fixture setup failed: {e}")));
            }
        };

        let exec = self.executor.execute(ExecutionRequest {
            test_case: tc,
            fixtures: &fixtures,
            environment: request.environment,
            browser: request.browser,
        });
        match tokio::time::timeout(self.timeouts.attempt, exec).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(test_case_id = tc.id, error = %e, "execution failed");
                ExecutionOutcome::failed(FailureDetail::message(e.to_string()))
            }
            Err(_) => {
                warn!(test_case_id = tc.id, timeout = ?self.timeouts.attempt, "execution timed out");
                ExecutionOutcome::failed(FailureDetail::message(format!(
                    "execution timed out after {}s",
                    self.timeouts.attempt.as_secs()
                )))
            }
        }
    }
}
