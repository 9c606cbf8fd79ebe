//! Delivery transports: webhook over HTTP, email over SMTP.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::Value;

use super::DeliveryError;
use crate::config::SmtpConfig;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send_webhook(&self, url: &str, body: &Value) -> Result<(), DeliveryError>;
    async fn send_email(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), DeliveryError>;
}

struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

pub struct HttpTransport {
    client: Client,
    mailer: Option<Mailer>,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration, smtp: Option<&SmtpConfig>) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let mailer = match smtp {
            Some(cfg) => {
                let from: Mailbox = cfg
                    .from
                    .parse()
                    .map_err(|e| DeliveryError::Misconfigured(format!("invalid from address: {e}")))?;
                let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
                    .map_err(|e| DeliveryError::Misconfigured(format!("SMTP relay: {e}")))?
                    .port(cfg.port)
                    .timeout(Some(request_timeout));
                if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
                    builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
                }
                Some(Mailer {
                    transport: builder.build(),
                    from,
                })
            }
            None => None,
        };

        Ok(Self { client, mailer })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send_webhook(&self, url: &str, body: &Value) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("request error: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }

    async fn send_email(&self, recipients: &[String], subject: &str, body: &str) -> Result<(), DeliveryError> {
        let mailer = self
            .mailer
            .as_ref()
            .ok_or_else(|| DeliveryError::Misconfigured("SMTP is not configured".into()))?;
        if recipients.is_empty() {
            return Err(DeliveryError::Misconfigured("channel has no recipients".into()));
        }

        let mut builder = Message::builder()
            .from(mailer.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for r in recipients {
            let to: Mailbox = r
                .parse()
                .map_err(|e| DeliveryError::Misconfigured(format!("invalid recipient {r}: {e}")))?;
            builder = builder.to(to);
        }
        let email = builder
            .body(body.to_string())
            .map_err(|e| DeliveryError::Misconfigured(format!("build email: {e}")))?;

        mailer
            .transport
            .send(email)
            .await
            .map_err(|e| DeliveryError::Transport(format!("SMTP send: {e}")))?;
        Ok(())
    }
}
