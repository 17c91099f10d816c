//! Message data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "sms" => Some(Channel::Sms),
            "email" => Some(Channel::Email),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "inbound" => Direction::Inbound,
            _ => Direction::Outbound,
        }
    }
}

/// Message lifecycle.
///
/// Outbound: `pending|scheduled -> sending -> sent|failed|skipped`. A row sits
/// in `sending` only while one dispatcher holds it. Inbound rows land directly
/// in `received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Scheduled,
    Sending,
    Sent,
    Failed,
    Skipped,
    Received,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Skipped => "skipped",
            MessageStatus::Received => "received",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "scheduled" => MessageStatus::Scheduled,
            "sending" => MessageStatus::Sending,
            "sent" => MessageStatus::Sent,
            "failed" => MessageStatus::Failed,
            "skipped" => MessageStatus::Skipped,
            "received" => MessageStatus::Received,
            _ => MessageStatus::Pending,
        }
    }

    /// Whether the dispatcher may still pick this row up.
    pub fn is_sendable(&self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Scheduled)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message to or from a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    pub channel: Channel,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    /// When a failed row becomes eligible for automatic re-queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Set for messages queued by a sequence step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inputs for creating a message row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    pub channel: Channel,
    pub direction: Direction,
    pub subject: Option<String>,
    pub body: String,
    pub status: MessageStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub enrollment_id: Option<Uuid>,
    pub step_index: Option<u32>,
}

impl NewMessage {
    /// An outbound message with no sequence linkage.
    pub fn outbound(
        tenant_id: Uuid,
        lead_id: Uuid,
        channel: Channel,
        body: impl Into<String>,
        status: MessageStatus,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            tenant_id,
            lead_id,
            channel,
            direction: Direction::Outbound,
            subject: None,
            body: body.into(),
            status,
            scheduled_at,
            enrollment_id: None,
            step_index: None,
        }
    }

    /// A reply received from the lead; lands directly in `received`.
    pub fn inbound(tenant_id: Uuid, lead_id: Uuid, channel: Channel, body: impl Into<String>) -> Self {
        Self {
            tenant_id,
            lead_id,
            channel,
            direction: Direction::Inbound,
            subject: None,
            body: body.into(),
            status: MessageStatus::Received,
            scheduled_at: None,
            enrollment_id: None,
            step_index: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn for_step(mut self, enrollment_id: Uuid, step_index: u32) -> Self {
        self.enrollment_id = Some(enrollment_id);
        self.step_index = Some(step_index);
        self
    }

    pub fn into_message(self, now: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            lead_id: self.lead_id,
            channel: self.channel,
            direction: self.direction,
            subject: self.subject,
            body: self.body,
            status: self.status,
            scheduled_at: self.scheduled_at,
            sent_at: None,
            attempt_count: 0,
            last_error: None,
            provider_message_id: None,
            retry_at: None,
            enrollment_id: self.enrollment_id,
            step_index: self.step_index,
            created_at: now,
            updated_at: now,
        }
    }
}
