//! `{{placeholder}}` rendering of notification bodies.

use std::collections::BTreeMap;

use crate::runs::{RunStatus, ScheduledRun};
use crate::scheduler::Schedule;

/// Slack-compatible incoming-webhook payload.
pub const DEFAULT_WEBHOOK_TEMPLATE: &str = r#"{
  "text": "Scheduled Run: {{schedule.name}}",
  "attachments": [{
    "color": "{{color}}",
    "fields": [
      {"title": "Status", "value": "{{status}}", "short": true},
      {"title": "Tests", "value": "{{pass_count}}/{{test_count}} passed", "short": true},
      {"title": "Failed", "value": "{{fail_count}}", "short": true},
      {"title": "Duration", "value": "{{duration}}", "short": true}
    ]
  }]
}"#;

pub const DEFAULT_EMAIL_TEMPLATE: &str = "Scheduled run {{run_id}} of '{{schedule.name}}' finished: {{status}}.

Tests:    {{pass_count}}/{{test_count}} passed, {{fail_count}} failed
Started:  {{started_at}}
Finished: {{completed_at}}
Duration: {{duration}}
Thread:   {{thread_id}}
";

pub type Context = BTreeMap<&'static str, String>;

pub fn color(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "good",
        RunStatus::Partial => "warning",
        _ => "danger",
    }
}

pub fn context(schedule: &Schedule, run: &ScheduledRun) -> Context {
    let duration = match (run.started_at, run.completed_at) {
        (Some(start), Some(end)) => format!("{}s", (end - start).num_seconds().max(0)),
        _ => "N/A".to_string(),
    };
    let mut ctx = Context::new();
    ctx.insert("schedule.name", schedule.name.clone());
    ctx.insert("schedule.id", schedule.id.to_string());
    ctx.insert("status", run.status.as_str().to_string());
    ctx.insert("color", color(run.status).to_string());
    ctx.insert("pass_count", run.pass_count.to_string());
    ctx.insert("fail_count", run.fail_count.to_string());
    ctx.insert("test_count", run.test_count.to_string());
    ctx.insert("started_at", run.started_at.map(|t| t.to_rfc3339()).unwrap_or_default());
    ctx.insert("completed_at", run.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default());
    ctx.insert("duration", duration);
    ctx.insert("run_id", run.id.to_string());
    ctx.insert("thread_id", run.thread_id.clone());
    ctx
}

/// Substitute every known `{{key}}` in one pass over the template.
/// Unknown placeholders are left in place; substituted values are never
/// scanned again.
pub fn render(template: &str, ctx: &Context) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            rest = &rest[open..];
            break;
        };
        match ctx.get(&after[..close]) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Like [`render`], escaping values for use inside JSON string literals.
pub fn render_json(template: &str, ctx: &Context) -> String {
    let escaped: Context = ctx
        .iter()
        .map(|(k, v)| {
            let quoted = serde_json::Value::String(v.clone()).to_string();
            (*k, quoted[1..quoted.len() - 1].to_string())
        })
        .collect();
    render(template, &escaped)
}

pub fn subject(schedule: &Schedule, run: &ScheduledRun) -> String {
    format!("[{}] Scheduled run: {}", run.status.as_str(), schedule.name)
}
