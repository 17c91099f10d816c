//! Twilio SMS sender: REST `Messages.json` via reqwest.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::config::TwilioConfig;
use crate::error::ChannelError;
use crate::messaging::sender::{OutboundSms, SmsSender, to_e164};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// SMS sender backed by Twilio's REST API.
pub struct TwilioSmsSender {
    config: Option<TwilioConfig>,
    client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct TwilioMessageResponse {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct TwilioErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

impl TwilioSmsSender {
    /// Build a sender whose requests give up after `timeout`. With `None`,
    /// every send fails as not configured.
    pub fn new(config: Option<TwilioConfig>, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            api_base: TWILIO_API_BASE.to_string(),
        })
    }

    /// Point the sender at a different API root (local fakes).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn messages_url(&self, account_sid: &str) -> String {
        format!("{}/Accounts/{account_sid}/Messages.json", self.api_base)
    }
}

#[async_trait]
impl SmsSender for TwilioSmsSender {
    async fn send_sms(&self, sms: &OutboundSms) -> Result<String, ChannelError> {
        let config = self.config.as_ref().ok_or_else(|| ChannelError::NotConfigured {
            name: "twilio".into(),
        })?;

        if sms.to.trim().is_empty() {
            return Err(ChannelError::InvalidMessage("SMS recipient is empty".into()));
        }

        let to = to_e164(&sms.to);
        let form = [
            ("To", to.as_str()),
            ("From", config.from_number.as_str()),
            ("Body", sms.body.as_str()),
        ];

        let resp = self
            .client
            .post(self.messages_url(&config.account_sid))
            .basic_auth(&config.account_sid, Some(config.auth_token.expose_secret()))
            .form(&form)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<TwilioErrorResponse>(&body) {
                Ok(TwilioErrorResponse {
                    code,
                    message: Some(message),
                }) => match code {
                    Some(code) => format!("{status}: {message} (code {code})"),
                    None => format!("{status}: {message}"),
                },
                _ => format!("{status}: {body}"),
            };
            return Err(ChannelError::SendFailed {
                name: "twilio".into(),
                reason,
            });
        }

        let parsed: TwilioMessageResponse = resp.json().await.map_err(|e| {
            ChannelError::SendFailed {
                name: "twilio".into(),
                reason: format!("Unreadable response: {e}"),
            }
        })?;

        tracing::info!(to = %to, sid = %parsed.sid, "SMS sent via Twilio");
        Ok(parsed.sid)
    }
}
