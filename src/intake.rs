//! IntakeCoordinator: dedupes and persists new leads, then kicks off automation.
//!
//! Only tenant resolution and payload validation can fail an intake. Once the
//! lead is stored, the instant response and sequence enrollment are
//! best-effort and report through outcomes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{DatabaseError, IntakeError};
use crate::leads::{Lead, LeadType, NewLead, Temperature, normalize_email, normalize_phone};
use crate::messaging::{Channel, DispatchReport, MessageDispatcher, MessageStatus, NewMessage};
use crate::sequences::template::{TemplateVars, render};
use crate::sequences::{SequenceRunner, StartOutcome};
use crate::store::Database;
use crate::tenants::{TenantSettings, TenantSettingsProvider};
use crate::timeline::{TimelineEvent, TimelineLogger, record_best_effort};

pub const INSTANT_EMAIL_SUBJECT: &str = "Thanks for reaching out";

const INSTANT_BODY_WITH_LINK: &str =
    "Hi {{leadName}}, thanks for reaching out! Grab a time that works for you: {{bookingLink}}";
const INSTANT_BODY_NO_LINK: &str =
    "Hi {{leadName}}, thanks for reaching out! We'll be in touch shortly.";

/// Cap on the dispatch pass run for a single new lead.
const INSTANT_DISPATCH_LIMIT: usize = 10;

/// Raw lead as submitted by a form, portal, or API client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadPayload {
    #[serde(default, alias = "fullName")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "leadType")]
    pub lead_type: Option<String>,
    #[serde(default)]
    pub temperature: Option<String>,
}

/// What the instant-response flow did for a new lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstantResponseOutcome {
    Queued {
        message_ids: Vec<Uuid>,
        /// Set when quiet hours pushed the messages out.
        scheduled_at: Option<DateTime<Utc>>,
        dispatch: Option<DispatchReport>,
    },
    /// The lead has neither a phone nor an email.
    NoContact,
    /// The tenant has automations switched off.
    Disabled,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IntakeResult {
    pub lead: Lead,
    pub deduped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instant_response: Option<InstantResponseOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<StartOutcome>,
}

pub struct IntakeCoordinator {
    store: Arc<dyn Database>,
    dispatcher: Arc<MessageDispatcher>,
    runner: Arc<SequenceRunner>,
    tenants: Arc<dyn TenantSettingsProvider>,
    timeline: Arc<dyn TimelineLogger>,
    clock: Arc<dyn Clock>,
}

impl IntakeCoordinator {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<MessageDispatcher>,
        runner: Arc<SequenceRunner>,
        tenants: Arc<dyn TenantSettingsProvider>,
        timeline: Arc<dyn TimelineLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            runner,
            tenants,
            timeline,
            clock,
        }
    }

    pub async fn intake(&self, tenant_id: Uuid, payload: LeadPayload) -> Result<IntakeResult, IntakeError> {
        if !self.store.tenant_exists(tenant_id).await? {
            return Err(IntakeError::UnknownTenant(tenant_id));
        }

        let new_lead = validate(tenant_id, payload)?;

        if let Some(existing) = self
            .store
            .find_duplicate_lead(tenant_id, new_lead.email.as_deref(), new_lead.phone.as_deref())
            .await?
        {
            debug!(lead_id = %existing.id, tenant_id = %tenant_id, "Intake deduped to existing lead");
            record_best_effort(
                self.timeline.as_ref(),
                existing.id,
                TimelineEvent::Deduped,
                json!({ "source": new_lead.source }),
            )
            .await;
            return Ok(IntakeResult {
                lead: existing,
                deduped: true,
                instant_response: None,
                sequence: None,
            });
        }

        let lead = new_lead.into_lead(self.clock.now());
        self.store.insert_lead(&lead).await?;
        info!(lead_id = %lead.id, tenant_id = %tenant_id, source = ?lead.source, "Lead created");
        record_best_effort(
            self.timeline.as_ref(),
            lead.id,
            TimelineEvent::Created,
            json!({ "source": lead.source, "lead_type": lead.lead_type, "temperature": lead.temperature }),
        )
        .await;

        let (instant_response, sequence) = self.trigger_automation(&lead).await;

        // Reflect status changes made by enrollment.
        let lead = match self.store.get_lead(lead.id).await {
            Ok(Some(fresh)) => fresh,
            _ => lead,
        };

        Ok(IntakeResult {
            lead,
            deduped: false,
            instant_response: Some(instant_response),
            sequence: Some(sequence),
        })
    }

    async fn trigger_automation(&self, lead: &Lead) -> (InstantResponseOutcome, StartOutcome) {
        let settings = match self.tenants.get(lead.tenant_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(lead_id = %lead.id, "Tenant settings unavailable; skipping automation: {e}");
                let error = e.to_string();
                return (
                    InstantResponseOutcome::Failed {
                        error: error.clone(),
                    },
                    StartOutcome::Failed { error },
                );
            }
        };

        if !settings.automations_enabled {
            debug!(tenant_id = %lead.tenant_id, "Automations disabled for tenant");
            return (InstantResponseOutcome::Disabled, StartOutcome::Disabled);
        }

        let instant = self.queue_instant_responses(lead, &settings).await;
        let sequence = self.runner.start_for_lead(lead).await;
        (instant, sequence)
    }

    /// Queue the first-touch SMS and email, holding them until quiet hours
    /// end if necessary, then run a dispatch pass for just this lead.
    pub async fn queue_instant_responses(
        &self,
        lead: &Lead,
        settings: &TenantSettings,
    ) -> InstantResponseOutcome {
        match self.try_queue_instant_responses(lead, settings).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(lead_id = %lead.id, "Instant response failed: {e}");
                InstantResponseOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn try_queue_instant_responses(
        &self,
        lead: &Lead,
        settings: &TenantSettings,
    ) -> Result<InstantResponseOutcome, DatabaseError> {
        let channels: Vec<Channel> = [
            lead.phone.as_ref().map(|_| Channel::Sms),
            lead.email.as_ref().map(|_| Channel::Email),
        ]
        .into_iter()
        .flatten()
        .collect();
        if channels.is_empty() {
            debug!(lead_id = %lead.id, "Lead has no contact channel; no instant response");
            return Ok(InstantResponseOutcome::NoContact);
        }

        let vars = TemplateVars {
            lead_name: lead.display_name(),
            booking_link: settings.booking_link(),
        };
        let template = if settings.booking_link().is_empty() {
            INSTANT_BODY_NO_LINK
        } else {
            INSTANT_BODY_WITH_LINK
        };
        let body = render(template, &vars);

        let now = self.clock.now();
        let (status, scheduled_at) = if settings.is_quiet_at(now) {
            (MessageStatus::Scheduled, Some(settings.next_send_time(now)))
        } else {
            (MessageStatus::Pending, None)
        };

        let mut message_ids = Vec::with_capacity(channels.len());
        for channel in channels {
            let mut new = NewMessage::outbound(
                lead.tenant_id,
                lead.id,
                channel,
                body.clone(),
                status,
                scheduled_at,
            );
            if channel == Channel::Email {
                new = new.with_subject(INSTANT_EMAIL_SUBJECT);
            }
            let Some(message) = self.dispatcher.create_message(new).await? else {
                continue;
            };
            record_best_effort(
                self.timeline.as_ref(),
                lead.id,
                TimelineEvent::MessageQueued,
                json!({ "message_id": message.id, "channel": channel, "scheduled_at": scheduled_at }),
            )
            .await;
            message_ids.push(message.id);
        }

        if let Some(at) = scheduled_at {
            info!(lead_id = %lead.id, scheduled_at = %at, "Quiet hours; instant response scheduled");
        }

        let dispatch = match self
            .dispatcher
            .process_pending_outbound(INSTANT_DISPATCH_LIMIT, Some(lead.id))
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(lead_id = %lead.id, "Immediate dispatch pass failed: {e}");
                None
            }
        };

        Ok(InstantResponseOutcome::Queued {
            message_ids,
            scheduled_at,
            dispatch,
        })
    }
}

/// Normalize identifiers and classification; reject payloads with nothing usable.
fn validate(tenant_id: Uuid, payload: LeadPayload) -> Result<NewLead, IntakeError> {
    let full_name = payload.full_name.unwrap_or_default().trim().to_string();
    let phone = payload.phone.as_deref().and_then(normalize_phone);
    let email = payload.email.as_deref().and_then(normalize_email);

    if let Some(email) = &email {
        if !email.contains('@') {
            return Err(IntakeError::InvalidPayload(format!("invalid email: {email}")));
        }
    }
    if full_name.is_empty() && email.is_none() && phone.is_none() {
        return Err(IntakeError::InvalidPayload(
            "lead needs a name, email, or phone".into(),
        ));
    }

    let lead_type = match payload.lead_type.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw.parse::<LeadType>().map_err(IntakeError::InvalidPayload)?,
        None => LeadType::default(),
    };
    let temperature = match payload.temperature.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw.parse::<Temperature>().map_err(IntakeError::InvalidPayload)?,
        None => Temperature::default(),
    };

    Ok(NewLead {
        tenant_id,
        full_name,
        email,
        phone,
        source: payload
            .source
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        lead_type,
        temperature,
    })
}
