//! Outcome notifications for finished scheduled runs.
//!
//! Delivery is best-effort and strictly downstream of the run: a failing
//! channel is recorded and skipped, never retried inline, and never changes
//! the run's status.

pub mod template;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use self::transport::Transport;
use crate::runs::{RunStatus, ScheduledRun};
use crate::scheduler::Schedule;
use crate::storage::{catalog, with_conn, Pool, StorageError};

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("channel not found")]
    ChannelNotFound,
    #[error("invalid template JSON: {0}")]
    InvalidBody(String),
    #[error("channel misconfigured: {0}")]
    Misconfigured(String),
    #[error("{0}")]
    Transport(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
    /// Slack incoming webhook; delivered like a generic webhook.
    Slack,
    Email,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Webhook => "webhook",
            ChannelKind::Slack => "slack",
            ChannelKind::Email => "email",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "webhook" => Some(ChannelKind::Webhook),
            "slack" => Some(ChannelKind::Slack),
            "email" => Some(ChannelKind::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyOn {
    Failure,
    Success,
    Always,
}

impl NotifyOn {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyOn::Failure => "failure",
            NotifyOn::Success => "success",
            NotifyOn::Always => "always",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "failure" => Some(NotifyOn::Failure),
            "success" => Some(NotifyOn::Success),
            "always" => Some(NotifyOn::Always),
            _ => None,
        }
    }

    /// Whether a run that ended in `status` triggers this policy.
    pub fn matches(self, status: RunStatus) -> bool {
        match self {
            NotifyOn::Always => true,
            NotifyOn::Failure => status != RunStatus::Completed,
            NotifyOn::Success => status == RunStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub webhook_template: Option<String>,
    pub email_recipients: Vec<String>,
    pub email_template: Option<String>,
    pub notify_on: NotifyOn,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: Vec<i64>,
    pub failed: Vec<(i64, String)>,
    pub skipped: Vec<i64>,
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(pool: Pool, transport: Arc<dyn Transport>, send_timeout: Duration) -> Self {
        Self {
            pool,
            transport,
            send_timeout,
        }
    }

    /// Notify every channel of `schedule` about `run`, in stored order.
    ///
    /// Each outcome is appended to the run's log as soon as it is known.
    /// Only a failure to write that log is returned.
    pub async fn dispatch(&self, schedule: &Schedule, run: &ScheduledRun) -> Result<DispatchReport, StorageError> {
        let mut report = DispatchReport::default();

        for &channel_id in &schedule.notification_channel_ids {
            let channel = match catalog::get_channel(&self.pool, channel_id).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    self.record(run.id, channel_id, Err(DeliveryError::ChannelNotFound)).await?;
                    report.failed.push((channel_id, DeliveryError::ChannelNotFound.to_string()));
                    continue;
                }
                Err(e) => {
                    // An unreadable row is this channel's failure only.
                    warn!(channel_id, run_id = run.id, error = %e, "could not load notification channel");
                    let err = DeliveryError::Misconfigured(format!("channel unreadable: {e}"));
                    report.failed.push((channel_id, err.to_string()));
                    self.record(run.id, channel_id, Err(err)).await?;
                    continue;
                }
            };

            if !channel.enabled || !channel.notify_on.matches(run.status) {
                debug!(channel_id, run_id = run.id, notify_on = channel.notify_on.as_str(), "channel skipped");
                report.skipped.push(channel_id);
                continue;
            }

            let result = self.deliver(&channel, schedule, run).await;
            match &result {
                Ok(()) => {
                    info!(channel_id, run_id = run.id, kind = channel.kind.as_str(), "notification sent");
                    report.sent.push(channel_id);
                }
                Err(e) => {
                    warn!(channel_id, run_id = run.id, kind = channel.kind.as_str(), error = %e, "notification failed");
                    report.failed.push((channel_id, e.to_string()));
                }
            }
            self.record(run.id, channel_id, result).await?;
        }

        info!(run_id = run.id, sent = report.sent.len(), failed = report.failed.len(), "notifications dispatched");
        Ok(report)
    }

    async fn deliver(&self, channel: &NotificationChannel, schedule: &Schedule, run: &ScheduledRun) -> Result<(), DeliveryError> {
        let ctx = template::context(schedule, run);
        let send = async {
            match channel.kind {
                ChannelKind::Webhook | ChannelKind::Slack => {
                    let url = channel
                        .webhook_url
                        .as_deref()
                        .filter(|u| !u.is_empty())
                        .ok_or_else(|| DeliveryError::Misconfigured("no webhook URL configured".into()))?;
                    let tpl = channel.webhook_template.as_deref().unwrap_or(template::DEFAULT_WEBHOOK_TEMPLATE);
                    let rendered = template::render_json(tpl, &ctx);
                    let body: serde_json::Value =
                        serde_json::from_str(&rendered).map_err(|e| DeliveryError::InvalidBody(e.to_string()))?;
                    self.transport.send_webhook(url, &body).await
                }
                ChannelKind::Email => {
                    let tpl = channel.email_template.as_deref().unwrap_or(template::DEFAULT_EMAIL_TEMPLATE);
                    let body = template::render(tpl, &ctx);
                    let subject = template::subject(schedule, run);
                    self.transport.send_email(&channel.email_recipients, &subject, &body).await
                }
            }
        };
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        }
    }

    /// Append one channel outcome to the run's delivery log.
    async fn record(&self, run_id: i64, channel_id: i64, result: Result<(), DeliveryError>) -> Result<(), StorageError> {
        with_conn(&self.pool, move |conn| {
            match result {
                Ok(()) => conn.execute(
                    "UPDATE scheduled_runs
                     SET notifications_sent = json_insert(coalesce(notifications_sent, '[]'), '$[#]', ?2)
                     WHERE id = ?1",
                    params![run_id, channel_id],
                )?,
                Err(e) => conn.execute(
                    "UPDATE scheduled_runs
                     SET notification_errors = json_set(coalesce(notification_errors, '{}'), '$.\"' || ?2 || '\"', ?3)
                     WHERE id = ?1",
                    params![run_id, channel_id, e.to_string()],
                )?,
            };
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryMode;
    use crate::runs;
    use crate::scheduler::{testing::new_schedule, Scheduler, TargetSelector};
    use crate::storage::testing::temp_pool;
    use chrono::Utc;
    use parking_lot::Mutex;

    /// Records deliveries; webhook URLs containing "broken" fail.
    #[derive(Default)]
    struct RecordingTransport {
        webhooks: Mutex<Vec<(String, serde_json::Value)>>,
        emails: Mutex<Vec<(Vec<String>, String)>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send_webhook(&self, url: &str, body: &serde_json::Value) -> Result<(), DeliveryError> {
            if url.contains("broken") {
                return Err(DeliveryError::Transport("request error: invalid URL".into()));
            }
            self.webhooks.lock().push((url.to_string(), body.clone()));
            Ok(())
        }

        async fn send_email(&self, recipients: &[String], subject: &str, _body: &str) -> Result<(), DeliveryError> {
            self.emails.lock().push((recipients.to_vec(), subject.to_string()));
            Ok(())
        }
    }

    fn channel(project_id: i64, kind: ChannelKind, url: Option<&str>, notify_on: NotifyOn) -> NotificationChannel {
        NotificationChannel {
            id: 0,
            project_id,
            name: format!("{}-{}", kind.as_str(), notify_on.as_str()),
            kind,
            enabled: true,
            webhook_url: url.map(String::from),
            webhook_template: None,
            email_recipients: vec!["qa@shop.test".into()],
            email_template: None,
            notify_on,
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        pool: Pool,
        project: i64,
        transport: Arc<RecordingTransport>,
        dispatcher: Dispatcher,
    }

    async fn setup() -> Setup {
        let (dir, pool) = temp_pool();
        let project = catalog::insert_project(&pool, "shop", None).await.unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(pool.clone(), transport.clone(), Duration::from_secs(5));
        Setup {
            _dir: dir,
            pool,
            project,
            transport,
            dispatcher,
        }
    }

    async fn schedule_with(s: &Setup, channels: Vec<i64>) -> Schedule {
        let mut new = new_schedule(s.project, "0 9 * * *", TargetSelector::TestCaseIds { ids: vec![1] });
        new.notification_channel_ids = channels;
        new.retry_mode = RetryMode::Simple;
        Scheduler::new(s.pool.clone()).add(new, Utc::now()).await.unwrap()
    }

    async fn finished_run(s: &Setup, schedule: &Schedule, status: RunStatus, pass: u32, fail: u32) -> ScheduledRun {
        let id = runs::store::insert_run(&s.pool, schedule, "scheduled-test", Utc::now()).await.unwrap();
        runs::store::mark_running(&s.pool, id, pass + fail, Utc::now()).await.unwrap();
        runs::store::finish_run(&s.pool, id, status, pass, fail, None, Utc::now()).await.unwrap();
        runs::store::get_run(&s.pool, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let s = setup().await;
        let broken = catalog::insert_channel(&s.pool, &channel(s.project, ChannelKind::Webhook, Some("http://broken.invalid/hook"), NotifyOn::Always))
            .await
            .unwrap();
        let slack = catalog::insert_channel(&s.pool, &channel(s.project, ChannelKind::Slack, Some("https://hooks.slack.test/x"), NotifyOn::Always))
            .await
            .unwrap();
        let email = catalog::insert_channel(&s.pool, &channel(s.project, ChannelKind::Email, None, NotifyOn::Failure))
            .await
            .unwrap();
        let schedule = schedule_with(&s, vec![broken, 404, slack, email]).await;
        let run = finished_run(&s, &schedule, RunStatus::Failed, 0, 2).await;

        let report = s.dispatcher.dispatch(&schedule, &run).await.unwrap();
        assert_eq!(report.sent, vec![slack, email]);
        assert_eq!(report.failed.len(), 2);

        let stored = runs::store::get_run(&s.pool, run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed, "delivery never changes the run");
        assert_eq!(stored.notifications_sent, vec![slack, email]);
        assert!(stored.notification_errors[&broken.to_string()].contains("invalid URL"));
        assert_eq!(stored.notification_errors["404"], "channel not found");

        let hooks = s.transport.webhooks.lock();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].1["attachments"][0]["color"], "danger");
        assert_eq!(s.transport.emails.lock()[0].0, vec!["qa@shop.test".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_channel_does_not_block_others() {
        let s = setup().await;
        let project = s.project;
        let bad = with_conn(&s.pool, move |conn| {
            conn.execute_batch("PRAGMA ignore_check_constraints = ON;")?;
            conn.execute(
                "INSERT INTO notification_channels (project_id, name, channel_type, webhook_url, notify_on)
                 VALUES (?1, 'legacy', 'webhook', 'https://legacy.test', 'sometimes')",
                rusqlite::params![project],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute_batch("PRAGMA ignore_check_constraints = OFF;")?;
            Ok(id)
        })
        .await
        .unwrap();
        let good = catalog::insert_channel(&s.pool, &channel(s.project, ChannelKind::Webhook, Some("https://ok.test"), NotifyOn::Always))
            .await
            .unwrap();
        let schedule = schedule_with(&s, vec![bad, good]).await;
        let run = finished_run(&s, &schedule, RunStatus::Completed, 1, 0).await;

        let report = s.dispatcher.dispatch(&schedule, &run).await.unwrap();
        assert_eq!(report.sent, vec![good]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad);

        let stored = runs::store::get_run(&s.pool, run.id).await.unwrap().unwrap();
        assert_eq!(stored.notifications_sent, vec![good]);
        assert!(stored.notification_errors[&bad.to_string()].contains("sometimes"));
        assert_eq!(s.transport.webhooks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_on_policies() {
        let s = setup().await;
        let on_failure = catalog::insert_channel(&s.pool, &channel(s.project, ChannelKind::Webhook, Some("https://a.test"), NotifyOn::Failure))
            .await
            .unwrap();
        let on_success = catalog::insert_channel(&s.pool, &channel(s.project, ChannelKind::Webhook, Some("https://b.test"), NotifyOn::Success))
            .await
            .unwrap();
        let mut disabled = channel(s.project, ChannelKind::Webhook, Some("https://c.test"), NotifyOn::Always);
        disabled.enabled = false;
        let disabled = catalog::insert_channel(&s.pool, &disabled).await.unwrap();
        let schedule = schedule_with(&s, vec![on_failure, on_success, disabled]).await;

        let completed = finished_run(&s, &schedule, RunStatus::Completed, 2, 0).await;
        let report = s.dispatcher.dispatch(&schedule, &completed).await.unwrap();
        assert_eq!(report.sent, vec![on_success]);
        assert_eq!(report.skipped, vec![on_failure, disabled]);

        let partial = finished_run(&s, &schedule, RunStatus::Partial, 1, 1).await;
        let report = s.dispatcher.dispatch(&schedule, &partial).await.unwrap();
        assert_eq!(report.sent, vec![on_failure]);
    }

    #[tokio::test]
    async fn test_invalid_template_is_a_channel_error() {
        let s = setup().await;
        let mut bad = channel(s.project, ChannelKind::Webhook, Some("https://a.test"), NotifyOn::Always);
        bad.webhook_template = Some("status={{status}}".into());
        let bad = catalog::insert_channel(&s.pool, &bad).await.unwrap();
        let schedule = schedule_with(&s, vec![bad]).await;
        let run = finished_run(&s, &schedule, RunStatus::Completed, 1, 0).await;

        let report = s.dispatcher.dispatch(&schedule, &run).await.unwrap();
        assert!(report.sent.is_empty());
        assert!(report.failed[0].1.contains("invalid template JSON"));
        assert!(s.transport.webhooks.lock().is_empty());
    }
}
