//! End-to-end: intake during quiet hours, scheduled delivery, reply stops the
//! follow-up sequence, and repeat submissions dedupe.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;

use leadflow::clock::{Clock, ManualClock};
use leadflow::config::AutomationConfig;
use leadflow::error::ChannelError;
use leadflow::intake::{InstantResponseOutcome, IntakeCoordinator, LeadPayload};
use leadflow::leads::SequenceStatus;
use leadflow::messaging::{
    Channel, Direction, EmailSender, InboundOutcome, InboundReplyHandler, InboundSms,
    MessageDispatcher, MessageStatus, OutboundEmail, OutboundSms, SmsSender,
};
use leadflow::scheduler::AutomationScheduler;
use leadflow::sequences::{
    EnrollmentStatus, Sequence, SequenceRunner, SequenceStep, StartOutcome, StopReason,
};
use leadflow::store::{Database, LibSqlBackend};
use leadflow::tenants::{StoreTenantSettings, TenantSettingsProvider};
use leadflow::timeline::{StoreTimeline, TimelineLogger};

#[derive(Default)]
struct Outbox {
    sms: Mutex<Vec<OutboundSms>>,
    email: Mutex<Vec<OutboundEmail>>,
}

#[async_trait]
impl SmsSender for Outbox {
    async fn send_sms(&self, sms: &OutboundSms) -> Result<String, ChannelError> {
        self.sms.lock().unwrap().push(sms.clone());
        Ok(format!("SM{}", Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl EmailSender for Outbox {
    async fn send_email(&self, email: &OutboundEmail) -> Result<String, ChannelError> {
        self.email.lock().unwrap().push(email.clone());
        Ok(format!("<{}@test>", Uuid::new_v4()))
    }
}

struct App {
    db: Arc<dyn Database>,
    clock: Arc<ManualClock>,
    outbox: Arc<Outbox>,
    tenant_id: Uuid,
    intake: IntakeCoordinator,
    inbound: InboundReplyHandler,
    scheduler: AutomationScheduler,
}

async fn setup() -> App {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    // 22:30 on 2026-01-15 in America/New_York.
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 16, 3, 30, 0).unwrap()));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let outbox = Arc::new(Outbox::default());

    let tenant_id = Uuid::new_v4();
    db.insert_tenant(tenant_id, "Harbor Realty").await.unwrap();

    let sequence_id = Uuid::new_v4();
    let step = |offset: i64, channel: Channel, body: &str| SequenceStep {
        id: Uuid::new_v4(),
        sequence_id,
        offset_minutes: offset,
        channel,
        subject_template: None,
        body_template: body.to_string(),
    };
    db.insert_sequence(&Sequence {
        id: sequence_id,
        tenant_id,
        name: "New buyer".into(),
        lead_type: None,
        temperature: None,
        is_active: true,
        steps: vec![
            step(0, Channel::Sms, "Hi {{leadName}}, still looking?"),
            step(1440, Channel::Email, "Checking in, {{leadName}}."),
        ],
        created_at: clock.now(),
    })
    .await
    .unwrap();

    let tenants: Arc<dyn TenantSettingsProvider> =
        Arc::new(StoreTenantSettings::new(Arc::clone(&db)));
    let timeline: Arc<dyn TimelineLogger> =
        Arc::new(StoreTimeline::new(Arc::clone(&db), Arc::clone(&dyn_clock)));
    let dispatcher = Arc::new(MessageDispatcher::new(
        Arc::clone(&db),
        outbox.clone(),
        outbox.clone(),
        Arc::clone(&tenants),
        Arc::clone(&timeline),
        Arc::clone(&dyn_clock),
    ));
    let runner = Arc::new(SequenceRunner::new(
        Arc::clone(&db),
        Arc::clone(&dispatcher),
        Arc::clone(&tenants),
        Arc::clone(&timeline),
        Arc::clone(&dyn_clock),
    ));

    App {
        intake: IntakeCoordinator::new(
            Arc::clone(&db),
            Arc::clone(&dispatcher),
            Arc::clone(&runner),
            tenants,
            Arc::clone(&timeline),
            Arc::clone(&dyn_clock),
        ),
        inbound: InboundReplyHandler::new(Arc::clone(&db), Arc::clone(&runner), timeline, dyn_clock),
        scheduler: AutomationScheduler::new(dispatcher, runner, &AutomationConfig::default()),
        db,
        clock,
        outbox,
        tenant_id,
    }
}

fn payload() -> LeadPayload {
    LeadPayload {
        full_name: Some("Morgan Price".into()),
        email: Some("Morgan@Example.com".into()),
        phone: Some("(555) 987-6543".into()),
        source: Some("open_house".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn quiet_hours_intake_through_reply() {
    let app = setup().await;
    let morning = Utc.with_ymd_and_hms(2026, 1, 16, 13, 0, 0).unwrap();

    let result = app.intake.intake(app.tenant_id, payload()).await.unwrap();
    assert!(!result.deduped);
    let lead = result.lead;
    assert_eq!(lead.phone.as_deref(), Some("15559876543"));
    assert_eq!(lead.email.as_deref(), Some("morgan@example.com"));
    assert_eq!(lead.sequence_status, SequenceStatus::Active);

    match result.instant_response {
        Some(InstantResponseOutcome::Queued { message_ids, scheduled_at, .. }) => {
            assert_eq!(message_ids.len(), 2);
            assert_eq!(scheduled_at, Some(morning));
        }
        other => panic!("expected queued instant response, got {other:?}"),
    }
    assert!(matches!(result.sequence, Some(StartOutcome::Enrolled { .. })));

    // The first step is due now but still lands behind quiet hours.
    let seq = app.scheduler.tick_sequences().await;
    assert_eq!(seq.advanced, 1);
    let dispatch = app.scheduler.tick_dispatch().await;
    assert_eq!(dispatch.sent, 0);
    assert!(app.outbox.sms.lock().unwrap().is_empty());

    let messages = app.db.list_messages_for_lead(lead.id).await.unwrap();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.status == MessageStatus::Scheduled));
    assert!(messages.iter().all(|m| m.scheduled_at == Some(morning)));

    app.clock.set(morning + Duration::minutes(1));
    let dispatch = app.scheduler.tick_dispatch().await;
    assert_eq!(dispatch.sent, 3);
    assert_eq!(app.outbox.sms.lock().unwrap().len(), 2);
    assert_eq!(app.outbox.email.lock().unwrap().len(), 1);
    assert!(
        app.outbox.sms.lock().unwrap().iter().all(|s| s.to == "15559876543"),
    );

    // Reply before the second step comes due.
    let reply = app
        .inbound
        .handle_inbound_sms(&InboundSms {
            from: "+15559876543".into(),
            to: None,
            body: "Yes, Saturday?".into(),
        })
        .await
        .unwrap();
    assert!(matches!(reply, InboundOutcome::Matched { enrollments_stopped: 1, .. }));

    app.clock.advance(Duration::days(2));
    let seq = app.scheduler.tick_sequences().await;
    assert_eq!(seq.selected, 0);
    app.scheduler.tick_dispatch().await;
    assert_eq!(app.outbox.email.lock().unwrap().len(), 1);

    let messages = app.db.list_messages_for_lead(lead.id).await.unwrap();
    let inbound: Vec<_> = messages
        .iter()
        .filter(|m| m.direction == Direction::Inbound)
        .collect();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].status, MessageStatus::Received);

    let stored = app.db.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(stored.sequence_status, SequenceStatus::Stopped);
    assert!(app.db.get_active_enrollment(lead.id).await.unwrap().is_none());

    let events: Vec<String> = app
        .db
        .list_lead_events(lead.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    for expected in [
        "created",
        "message_queued",
        "sequence_started",
        "sequence_step_queued",
        "message_sent",
        "lead_replied",
        "sequence_stopped",
    ] {
        assert!(events.iter().any(|e| e == expected), "missing {expected} in {events:?}");
    }
}

#[tokio::test]
async fn resubmission_dedupes_without_new_messages() {
    let app = setup().await;
    let first = app.intake.intake(app.tenant_id, payload()).await.unwrap();

    app.clock.advance(Duration::minutes(5));
    let second = app
        .intake
        .intake(
            app.tenant_id,
            LeadPayload {
                full_name: Some("M. Price".into()),
                phone: Some("555.987.6543".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(second.deduped);
    assert_eq!(second.lead.id, first.lead.id);
    assert!(second.instant_response.is_none());

    let messages = app.db.list_messages_for_lead(first.lead.id).await.unwrap();
    assert_eq!(messages.len(), 2);

    let enrollment = app
        .db
        .get_active_enrollment(first.lead.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert_eq!(enrollment.stopped_reason, None::<StopReason>);
}
