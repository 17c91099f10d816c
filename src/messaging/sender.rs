//! Channel sender traits.
//!
//! Senders own their credentials and from-address. A sender without
//! configuration still exists and fails every send with
//! `ChannelError::NotConfigured`.

use async_trait::async_trait;

use crate::error::ChannelError;

/// An email ready for the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// An SMS ready for the carrier. `to` is the normalized digit string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSms {
    pub to: String,
    pub body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver one email. Returns the provider's message id.
    async fn send_email(&self, email: &OutboundEmail) -> Result<String, ChannelError>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Deliver one SMS. Returns the provider's message id.
    async fn send_sms(&self, sms: &OutboundSms) -> Result<String, ChannelError>;
}

/// Render a normalized digit string as E.164.
pub fn to_e164(digits: &str) -> String {
    if digits.starts_with('+') {
        digits.to_string()
    } else {
        format!("+{digits}")
    }
}
