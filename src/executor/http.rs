//! HTTP client for the browser executor service.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Browser, ExecutionOutcome, ExecutionRequest, ExecutorError, FailureDetail, FixtureCapturer,
    StepResult, StepStatus, TestExecutor,
};
use crate::fixtures::{BrowserState, Fixture};

/// Talks to an executor exposing `POST /execute` and `POST /fixtures/capture`.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    base_url: String,
}

impl HttpExecutor {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ExecutorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ExecutorError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(response.json::<R>().await?)
    }
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    test_id: String,
    base_url: Option<&'a str>,
    steps: &'a [Value],
    variables: &'a std::collections::BTreeMap<String, String>,
    storage_states: Vec<StorageStateBody<'a>>,
    options: Options<'a>,
}

#[derive(Serialize)]
struct StorageStateBody<'a> {
    fixture_id: i64,
    url: Option<&'a str>,
    storage_state: &'a Value,
}

#[derive(Serialize)]
struct Options<'a> {
    browser: &'a str,
    screenshot_on_failure: bool,
}

#[derive(Deserialize)]
struct ExecuteReply {
    #[serde(default)]
    steps: Vec<StepEvent>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct StepEvent {
    step_number: u32,
    status: String,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    screenshot: Option<String>,
}

#[derive(Serialize)]
struct CaptureBody<'a> {
    fixture_id: i64,
    steps: &'a [Value],
    options: Options<'a>,
}

#[derive(Deserialize)]
struct CaptureReply {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    storage_state: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn step_field(step: Option<&Value>, key: &str) -> Option<String> {
    step.and_then(|s| s.get(key)).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

#[async_trait::async_trait]
impl TestExecutor for HttpExecutor {
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutorError> {
        let body = ExecuteBody {
            test_id: request.test_case.id.to_string(),
            base_url: request.environment.base_url.as_deref(),
            steps: &request.test_case.steps,
            variables: &request.environment.variables,
            storage_states: request
                .fixtures
                .iter()
                .map(|f| StorageStateBody {
                    fixture_id: f.fixture_id,
                    url: f.state.url.as_deref(),
                    storage_state: &f.state.storage_state,
                })
                .collect(),
            options: Options {
                browser: request.browser.as_str(),
                screenshot_on_failure: true,
            },
        };

        let reply: ExecuteReply = self.post("/execute", &body).await?;

        let mut failure = None;
        let mut step_results = Vec::with_capacity(reply.steps.len());
        for event in reply.steps {
            let status = match event.status.as_str() {
                "passed" => StepStatus::Passed,
                "skipped" => StepStatus::Skipped,
                _ => StepStatus::Failed,
            };
            if status == StepStatus::Failed && failure.is_none() {
                let step = request.test_case.step(event.step_number);
                failure = Some(FailureDetail {
                    step_number: Some(event.step_number),
                    action: step_field(step, "action"),
                    target: step_field(step, "target"),
                    value: step_field(step, "value"),
                    error: event
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("step {} failed", event.step_number)),
                    screenshot: event.screenshot,
                });
            }
            step_results.push(StepResult {
                step_number: event.step_number,
                status,
                duration_ms: event.duration,
                error: event.error,
            });
        }

        if let Some(error) = reply.error {
            failure.get_or_insert_with(|| FailureDetail::message(error));
        }

        Ok(ExecutionOutcome {
            passed: failure.is_none(),
            step_results,
            failure,
        })
    }
}

#[async_trait::async_trait]
impl FixtureCapturer for HttpExecutor {
    async fn capture(&self, fixture: &Fixture, browser: &Browser) -> Result<BrowserState, ExecutorError> {
        let body = CaptureBody {
            fixture_id: fixture.id,
            steps: &fixture.setup_steps,
            options: Options {
                browser: browser.as_str(),
                screenshot_on_failure: false,
            },
        };
        let reply: CaptureReply = self.post("/fixtures/capture", &body).await?;
        if let Some(error) = reply.error {
            return Err(ExecutorError::Failed(error));
        }
        let storage_state = reply
            .storage_state
            .ok_or_else(|| ExecutorError::Protocol("capture reply has no storage_state".into()))?;
        Ok(BrowserState {
            url: reply.url,
            storage_state,
        })
    }
}
