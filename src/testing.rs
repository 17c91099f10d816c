//! Test fixtures: an in-memory store wired to recording senders and a
//! manual clock.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::clock::{Clock, ManualClock};
use crate::error::ChannelError;
use crate::intake::IntakeCoordinator;
use crate::leads::{Lead, LeadType, NewLead, Temperature};
use crate::messaging::{
    Channel, EmailSender, InboundReplyHandler, MessageDispatcher, OutboundEmail, OutboundSms,
    RetryPolicy, SmsSender,
};
use crate::sequences::{Sequence, SequenceRunner, SequenceStep};
use crate::store::{Database, LibSqlBackend};
use crate::tenants::{StoreTenantSettings, TenantSettings, TenantSettingsProvider};
use crate::timeline::{StoreTimeline, TimelineLogger};

/// Records every outbound payload; fails on demand.
pub struct Recorder<T> {
    name: &'static str,
    sent: Mutex<Vec<T>>,
    failure: Mutex<Option<String>>,
}

impl<T: Clone> Recorder<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            sent: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// Payloads delivered so far.
    pub fn sent(&self) -> Vec<T> {
        self.sent.lock().unwrap().clone()
    }

    /// Fail every following send with `reason`.
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn succeed(&self) {
        *self.failure.lock().unwrap() = None;
    }

    fn deliver(&self, payload: &T, prefix: &str) -> Result<String, ChannelError> {
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(ChannelError::SendFailed {
                name: self.name.to_string(),
                reason,
            });
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(format!("{prefix}-{}", Uuid::new_v4()))
    }
}

/// Serve `app` on an ephemeral local port; returns its base URL.
pub async fn serve_stub(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub type RecordingSms = Recorder<OutboundSms>;
pub type RecordingEmail = Recorder<OutboundEmail>;

#[async_trait]
impl SmsSender for Recorder<OutboundSms> {
    async fn send_sms(&self, sms: &OutboundSms) -> Result<String, ChannelError> {
        self.deliver(sms, "SM")
    }
}

#[async_trait]
impl EmailSender for Recorder<OutboundEmail> {
    async fn send_email(&self, email: &OutboundEmail) -> Result<String, ChannelError> {
        self.deliver(email, "EM")
    }
}

pub struct Harness {
    pub db: Arc<dyn Database>,
    pub clock: Arc<ManualClock>,
    pub tenant_id: Uuid,
    pub sms: Arc<RecordingSms>,
    pub email: Arc<RecordingEmail>,
    pub tenants: Arc<dyn TenantSettingsProvider>,
    pub timeline: Arc<dyn TimelineLogger>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub runner: Arc<SequenceRunner>,
    pub intake: Arc<IntakeCoordinator>,
    pub inbound: Arc<InboundReplyHandler>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_retry(RetryPolicy::disabled()).await
    }

    /// Tenant in America/New_York with default quiet hours; the clock starts
    /// at 12:00 local on 2026-04-01.
    pub async fn with_retry(retry: RetryPolicy) -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 16, 0, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();

        let tenant_id = Uuid::new_v4();
        db.insert_tenant(tenant_id, "Test Realty").await.unwrap();

        let sms = Arc::new(RecordingSms::new("sms"));
        let email = Arc::new(RecordingEmail::new("email"));
        let tenants: Arc<dyn TenantSettingsProvider> =
            Arc::new(StoreTenantSettings::new(Arc::clone(&db)));
        let timeline: Arc<dyn TimelineLogger> =
            Arc::new(StoreTimeline::new(Arc::clone(&db), Arc::clone(&dyn_clock)));

        let dispatcher = Arc::new(
            MessageDispatcher::new(
                Arc::clone(&db),
                email.clone(),
                sms.clone(),
                Arc::clone(&tenants),
                Arc::clone(&timeline),
                Arc::clone(&dyn_clock),
            )
            .with_retry_policy(retry),
        );
        let runner = Arc::new(SequenceRunner::new(
            Arc::clone(&db),
            Arc::clone(&dispatcher),
            Arc::clone(&tenants),
            Arc::clone(&timeline),
            Arc::clone(&dyn_clock),
        ));
        let intake = Arc::new(IntakeCoordinator::new(
            Arc::clone(&db),
            Arc::clone(&dispatcher),
            Arc::clone(&runner),
            Arc::clone(&tenants),
            Arc::clone(&timeline),
            Arc::clone(&dyn_clock),
        ));
        let inbound = Arc::new(InboundReplyHandler::new(
            Arc::clone(&db),
            Arc::clone(&runner),
            Arc::clone(&timeline),
            dyn_clock,
        ));

        Self {
            db,
            clock,
            tenant_id,
            sms,
            email,
            tenants,
            timeline,
            dispatcher,
            runner,
            intake,
            inbound,
        }
    }

    /// A dispatcher over the same store and clock with a different SMS sender.
    pub fn dispatcher_with_sms(&self, sms: Arc<dyn SmsSender>) -> MessageDispatcher {
        let clock: Arc<dyn Clock> = self.clock.clone();
        MessageDispatcher::new(
            Arc::clone(&self.db),
            self.email.clone(),
            sms,
            Arc::clone(&self.tenants),
            Arc::clone(&self.timeline),
            clock,
        )
        .with_retry_policy(self.dispatcher.retry_policy())
    }

    /// Insert a lead directly, bypassing intake (no timeline entries).
    pub async fn lead(&self, email: Option<&str>, phone: Option<&str>) -> Lead {
        self.lead_named("Pat Buyer", email, phone).await
    }

    pub async fn lead_named(&self, name: &str, email: Option<&str>, phone: Option<&str>) -> Lead {
        self.insert_lead(self.tenant_id, name, email, phone).await
    }

    pub async fn lead_in(&self, tenant_id: Uuid, email: Option<&str>, phone: Option<&str>) -> Lead {
        self.insert_lead(tenant_id, "Pat Buyer", email, phone).await
    }

    async fn insert_lead(
        &self,
        tenant_id: Uuid,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Lead {
        let lead = NewLead {
            tenant_id,
            full_name: name.to_string(),
            email: email.map(String::from),
            phone: phone.map(String::from),
            source: Some("test".into()),
            lead_type: LeadType::Buyer,
            temperature: Temperature::Warm,
        }
        .into_lead(self.clock.now());
        self.db.insert_lead(&lead).await.unwrap();
        lead
    }

    /// Event types on a lead's timeline, oldest first.
    pub async fn event_types(&self, lead_id: Uuid) -> Vec<String> {
        self.db
            .list_lead_events(lead_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    /// Insert an active sequence for the harness tenant.
    pub async fn sequence(&self, lead_type: Option<LeadType>, steps: &[(i64, Channel, &str)]) -> Sequence {
        let id = Uuid::new_v4();
        let mut sequence = Sequence {
            id,
            tenant_id: self.tenant_id,
            name: "Test follow-up".into(),
            lead_type,
            temperature: None,
            is_active: true,
            steps: steps
                .iter()
                .map(|(offset, channel, body)| SequenceStep {
                    id: Uuid::new_v4(),
                    sequence_id: id,
                    offset_minutes: *offset,
                    channel: *channel,
                    subject_template: None,
                    body_template: body.to_string(),
                })
                .collect(),
            created_at: self.clock.now(),
        };
        sequence.sort_steps();
        self.db.insert_sequence(&sequence).await.unwrap();
        sequence
    }

    pub async fn set_booking_link(&self, link: &str) {
        self.update_settings(|s| s.booking_link = Some(link.to_string())).await;
    }

    pub async fn set_sms_number(&self, number: &str) {
        self.update_settings(|s| s.sms_number = Some(number.to_string())).await;
    }

    pub async fn disable_automations(&self) {
        self.update_settings(|s| s.automations_enabled = false).await;
    }

    async fn update_settings(&self, change: impl FnOnce(&mut TenantSettings)) {
        let mut settings = self.tenants.get(self.tenant_id).await.unwrap();
        change(&mut settings);
        self.db.upsert_tenant_settings(&settings).await.unwrap();
    }
}
