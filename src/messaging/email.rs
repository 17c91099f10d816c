//! Email senders: SendGrid over HTTP, or any SMTP relay via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message as MimeMessage, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::config::{SendGridConfig, SmtpConfig};
use crate::error::ChannelError;
use crate::messaging::sender::{EmailSender, OutboundEmail};

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";

// ── SendGrid ────────────────────────────────────────────────────────

/// Email sender backed by SendGrid's v3 mail API.
pub struct SendGridEmailSender {
    config: Option<SendGridConfig>,
    client: reqwest::Client,
    send_url: String,
}

impl SendGridEmailSender {
    /// Build a sender whose requests give up after `timeout`. With `None`,
    /// every send fails as not configured.
    pub fn new(config: Option<SendGridConfig>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            send_url: SENDGRID_SEND_URL.to_string(),
        })
    }

    pub fn with_send_url(mut self, send_url: impl Into<String>) -> Self {
        self.send_url = send_url.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }
}

fn sendgrid_payload(from: &str, email: &OutboundEmail) -> serde_json::Value {
    serde_json::json!({
        "personalizations": [{ "to": [{ "email": email.to }] }],
        "from": { "email": from },
        "subject": email.subject,
        "content": [{ "type": "text/plain", "value": email.body }],
    })
}

#[async_trait]
impl EmailSender for SendGridEmailSender {
    async fn send_email(&self, email: &OutboundEmail) -> Result<String, ChannelError> {
        let config = self.config.as_ref().ok_or_else(|| ChannelError::NotConfigured {
            name: "sendgrid".into(),
        })?;

        let resp = self
            .client
            .post(&self.send_url)
            .bearer_auth(config.api_key.expose_secret())
            .json(&sendgrid_payload(&config.from_address, email))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "sendgrid".into(),
                reason: format!("{status}: {body}"),
            });
        }

        // SendGrid answers 202 with an empty body; the id rides in a header.
        let provider_id = resp
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| format!("sendgrid-{}", Uuid::new_v4()));

        tracing::info!(to = %email.to, provider_id = %provider_id, "Email sent via SendGrid");
        Ok(provider_id)
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Email sender that relays through an SMTP server.
pub struct SmtpEmailSender {
    config: SmtpConfig,
    timeout: Duration,
}

impl SmtpEmailSender {
    /// `timeout` bounds each SMTP command, connect included.
    pub fn new(config: SmtpConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn build_message(&self, email: &OutboundEmail, message_id: &str) -> Result<MimeMessage, ChannelError> {
        MimeMessage::builder()
            .from(self.config.from_address.parse().map_err(|e| {
                ChannelError::SendFailed {
                    name: "smtp".into(),
                    reason: format!("Invalid from address: {e}"),
                }
            })?)
            .to(email.to.parse().map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("Invalid to address: {e}"),
            })?)
            .subject(email.subject.as_str())
            .message_id(Some(message_id.to_string()))
            .body(email.body.clone())
            .map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("Failed to build email: {e}"),
            })
    }
}

/// `<uuid@domain>` using the from-address domain.
fn generate_message_id(from_address: &str) -> String {
    let domain = from_address
        .rsplit_once('@')
        .map(|(_, d)| d.trim_end_matches('>'))
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{domain}>", Uuid::new_v4())
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send_email(&self, email: &OutboundEmail) -> Result<String, ChannelError> {
        let message_id = generate_message_id(&self.config.from_address);
        let mime = self.build_message(email, &message_id)?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&self.config.host)
            .map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.port)
            .credentials(creds)
            .timeout(Some(self.timeout))
            .build();

        tokio::task::spawn_blocking(move || transport.send(&mime))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| ChannelError::SendFailed {
                name: "smtp".into(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        tracing::info!(to = %email.to, message_id = %message_id, "Email sent via SMTP");
        Ok(message_id)
    }
}
