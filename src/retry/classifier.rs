//! Failure classification for intelligent retry.
//!
//! A classifier looks at a failed attempt and says whether another attempt is
//! worth it. Being wrong in the "retry" direction hides real bugs, so anything
//! unrecognised is not retryable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::FailureDetail;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classifier timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    NetworkError,
    Timeout,
    ElementTiming,
    StaleSession,
    AuthenticationFailure,
    AssertionFailure,
    ValidationError,
    ApplicationError,
    Unknown,
}

impl FailureCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureCategory::NetworkError
                | FailureCategory::Timeout
                | FailureCategory::ElementTiming
                | FailureCategory::StaleSession
        )
    }

    /// Short human phrase, used as the child attempt's retry reason.
    pub fn describe(self) -> &'static str {
        match self {
            FailureCategory::NetworkError => "network error",
            FailureCategory::Timeout => "timeout",
            FailureCategory::ElementTiming => "element timing",
            FailureCategory::StaleSession => "stale session",
            FailureCategory::AuthenticationFailure => "authentication failure",
            FailureCategory::AssertionFailure => "assertion failure",
            FailureCategory::ValidationError => "validation error",
            FailureCategory::ApplicationError => "application error",
            FailureCategory::Unknown => "unknown failure",
        }
    }
}

/// A change to apply to the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamAdjustment {
    /// Ignore cached fixture state and capture it again.
    RecaptureFixtures,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub retryable: bool,
    pub category: FailureCategory,
    pub confidence: f32,
    pub reason: String,
    pub adjustment: Option<ParamAdjustment>,
}

impl Classification {
    pub fn new(category: FailureCategory, confidence: f32) -> Self {
        Self {
            retryable: category.is_retryable(),
            category,
            confidence,
            reason: category.describe().to_string(),
            adjustment: (category == FailureCategory::StaleSession).then_some(ParamAdjustment::RecaptureFixtures),
        }
    }
}

/// A previous failed attempt of the same chain.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub failure: FailureDetail,
}

#[async_trait::async_trait]
pub trait FailureClassifier: Send + Sync {
    /// `history` holds every failed attempt so far, the current one last.
    async fn classify(&self, failure: &FailureDetail, history: &[AttemptRecord]) -> Result<Classification, ClassifierError>;
}

/// Keyword rules over the failing step and error message.
#[derive(Debug, Default, Clone)]
pub struct RuleClassifier;

const STALE_SESSION: &[&str] = &[
    "stale session",
    "session expired",
    "session has expired",
    "storage state",
    "redirected to login",
];
const AUTHENTICATION: &[&str] = &[
    "invalid credentials",
    "login failed",
    "authentication failed",
    "incorrect password",
    "401 unauthorized",
    "access denied",
];
const NETWORK: &[&str] = &[
    "econnrefused",
    "econnreset",
    "connection refused",
    "connection reset",
    "net::err_",
    "dns",
    "network unreachable",
    "socket hang up",
];
const ASSERTION: &[&str] = &["assertion", "expected", "to contain", "to equal", "to have"];
const VALIDATION: &[&str] = &["validation", "is required", "invalid format", "must be a valid"];
const APPLICATION: &[&str] = &[
    "internal server error",
    "status 500",
    "http 500",
    "502 bad gateway",
    "503 service unavailable",
    "application error",
    "uncaught exception",
];
const ELEMENT_TIMING: &[&str] = &[
    "waiting for",
    "not found",
    "unable to locate",
    "not visible",
    "detached from the dom",
    "not attached",
];
const TIMEOUT: &[&str] = &["timeout", "timed out"];

fn any_of(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

impl RuleClassifier {
    pub fn categorize(&self, failure: &FailureDetail) -> (FailureCategory, f32) {
        let error = failure.error.to_lowercase();
        let action = failure.action.as_deref().unwrap_or("").to_lowercase();

        if any_of(&error, STALE_SESSION) {
            (FailureCategory::StaleSession, 0.8)
        } else if any_of(&error, AUTHENTICATION) {
            (FailureCategory::AuthenticationFailure, 0.8)
        } else if any_of(&error, NETWORK) {
            (FailureCategory::NetworkError, 0.9)
        } else if action.starts_with("assert") || action.starts_with("expect") || any_of(&error, ASSERTION) {
            (FailureCategory::AssertionFailure, 0.8)
        } else if any_of(&error, VALIDATION) {
            (FailureCategory::ValidationError, 0.7)
        } else if any_of(&error, APPLICATION) {
            (FailureCategory::ApplicationError, 0.8)
        } else if any_of(&error, ELEMENT_TIMING) {
            (FailureCategory::ElementTiming, 0.6)
        } else if any_of(&error, TIMEOUT) {
            (FailureCategory::Timeout, 0.7)
        } else {
            (FailureCategory::Unknown, 0.0)
        }
    }
}

#[async_trait::async_trait]
impl FailureClassifier for RuleClassifier {
    async fn classify(&self, failure: &FailureDetail, history: &[AttemptRecord]) -> Result<Classification, ClassifierError> {
        let (category, confidence) = self.categorize(failure);
        let mut classification = Classification::new(category, confidence);

        // The same stale session twice means a fresh capture did not help.
        if category == FailureCategory::StaleSession {
            let repeats = history
                .iter()
                .filter(|h| self.categorize(&h.failure).0 == FailureCategory::StaleSession)
                .count();
            if repeats > 1 {
                classification.retryable = false;
                classification.adjustment = None;
                classification.reason = "stale session persists after recapture".into();
            }
        }
        Ok(classification)
    }
}
