//! InboundReplyHandler: matches replies to leads and halts their automation.
//!
//! Matching is scoped to a tenant when the payload's destination address is a
//! known tenant number or reply address; otherwise the most recently created
//! lead with the sender's identifier wins across all tenants.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::leads::{Lead, normalize_email, normalize_phone};
use crate::messaging::{Channel, NewMessage};
use crate::sequences::{SequenceRunner, StopReason};
use crate::store::Database;
use crate::timeline::{TimelineEvent, TimelineLogger, record_best_effort};

/// Twilio-style inbound SMS webhook fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundSms {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
    #[serde(rename = "Body", default)]
    pub body: String,
}

/// Inbound email fields as forwarded by the mail provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundEmail {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboundOutcome {
    Matched {
        lead_id: Uuid,
        message_id: Uuid,
        enrollments_stopped: u64,
    },
    /// No lead has this sender identifier.
    NoLead,
    /// Sender identifier was missing or unparseable.
    Ignored { reason: String },
}

pub struct InboundReplyHandler {
    store: Arc<dyn Database>,
    runner: Arc<SequenceRunner>,
    timeline: Arc<dyn TimelineLogger>,
    clock: Arc<dyn Clock>,
}

impl InboundReplyHandler {
    pub fn new(
        store: Arc<dyn Database>,
        runner: Arc<SequenceRunner>,
        timeline: Arc<dyn TimelineLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            runner,
            timeline,
            clock,
        }
    }

    pub async fn handle_inbound_sms(&self, sms: &InboundSms) -> Result<InboundOutcome, DatabaseError> {
        let Some(phone) = normalize_phone(&sms.from) else {
            debug!(from = %sms.from, "Inbound SMS without a usable sender");
            return Ok(InboundOutcome::Ignored {
                reason: "sender has no digits".into(),
            });
        };

        let tenant_id = match sms.to.as_deref().and_then(normalize_phone) {
            Some(to) => self.store.find_tenant_by_sms_number(&to).await?,
            None => None,
        };

        let Some(lead) = self.store.find_latest_lead_by_phone(&phone, tenant_id).await? else {
            debug!(from = %phone, "Inbound SMS matched no lead");
            return Ok(InboundOutcome::NoLead);
        };

        let reply = NewMessage::inbound(lead.tenant_id, lead.id, Channel::Sms, sms.body.clone());
        self.record_reply(&lead, reply).await
    }

    pub async fn handle_inbound_email(
        &self,
        email: &InboundEmail,
    ) -> Result<InboundOutcome, DatabaseError> {
        let Some(from) = normalize_email(&email.from).filter(|e| e.contains('@')) else {
            debug!(from = %email.from, "Inbound email without a usable sender");
            return Ok(InboundOutcome::Ignored {
                reason: "sender is not an email address".into(),
            });
        };

        let tenant_id = match email.to.as_deref().and_then(normalize_email) {
            Some(to) => self.store.find_tenant_by_reply_email(&to).await?,
            None => None,
        };

        let Some(lead) = self.store.find_latest_lead_by_email(&from, tenant_id).await? else {
            debug!(from = %from, "Inbound email matched no lead");
            return Ok(InboundOutcome::NoLead);
        };

        let mut reply = NewMessage::inbound(
            lead.tenant_id,
            lead.id,
            Channel::Email,
            email.text.clone().unwrap_or_default(),
        );
        if let Some(subject) = email.subject.as_deref().filter(|s| !s.trim().is_empty()) {
            reply = reply.with_subject(subject);
        }
        self.record_reply(&lead, reply).await
    }

    async fn record_reply(&self, lead: &Lead, reply: NewMessage) -> Result<InboundOutcome, DatabaseError> {
        let channel = reply.channel;
        let message = reply.into_message(self.clock.now());
        self.store.insert_message(&message).await?;

        record_best_effort(
            self.timeline.as_ref(),
            lead.id,
            TimelineEvent::LeadReplied,
            json!({ "message_id": message.id, "channel": channel }),
        )
        .await;

        let enrollments_stopped = self.runner.stop(lead.id, StopReason::Reply).await?;
        info!(
            lead_id = %lead.id,
            channel = %channel,
            enrollments_stopped,
            "Lead replied; automation stopped"
        );

        Ok(InboundOutcome::Matched {
            lead_id: lead.id,
            message_id: message.id,
            enrollments_stopped,
        })
    }
}
