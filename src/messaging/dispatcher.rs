//! MessageDispatcher: queues outbound messages and drives their delivery.
//!
//! Only `process_pending_outbound` moves rows out of `pending`/`scheduled`.
//! Each row is claimed into `sending` with a compare-and-set on its attempt
//! count before any external call, so overlapping ticks never deliver the same
//! row twice. Re-queued rows respect the tenant's quiet hours.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::messaging::retry::RetryPolicy;
use crate::messaging::sender::{EmailSender, OutboundEmail, OutboundSms, SmsSender};
use crate::messaging::{Channel, Direction, Message, MessageStatus, NewMessage};
use crate::store::Database;
use crate::tenants::TenantSettingsProvider;
use crate::timeline::{TimelineEvent, TimelineLogger, record_best_effort};

/// Subject used for email rows that were queued without one.
pub const DEFAULT_EMAIL_SUBJECT: &str = "Following up";

/// Minutes a row may sit in `sending` before it is presumed lost.
pub const STALLED_SEND_MINUTES: i64 = 15;

const STALLED_SEND_ERROR: &str = "send interrupted before completion";

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent { provider_message_id: String },
    Failed { error: String },
    /// The lead cannot be reached on this channel; terminal.
    Skipped { reason: String },
    /// Another worker claimed the row first, or it is no longer sendable.
    NotClaimed,
}

/// Tally of one dispatcher pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_claimed: usize,
    /// Rows abandoned because the store errored mid-attempt.
    pub errors: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Sent { .. } => self.sent += 1,
            SendOutcome::Failed { .. } => self.failed += 1,
            SendOutcome::Skipped { .. } => self.skipped += 1,
            SendOutcome::NotClaimed => self.not_claimed += 1,
        }
    }
}

pub struct MessageDispatcher {
    store: Arc<dyn Database>,
    email: Arc<dyn EmailSender>,
    sms: Arc<dyn SmsSender>,
    tenants: Arc<dyn TenantSettingsProvider>,
    timeline: Arc<dyn TimelineLogger>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl MessageDispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        email: Arc<dyn EmailSender>,
        sms: Arc<dyn SmsSender>,
        tenants: Arc<dyn TenantSettingsProvider>,
        timeline: Arc<dyn TimelineLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            email,
            sms,
            tenants,
            timeline,
            clock,
            retry: RetryPolicy::disabled(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Persist a message. No delivery happens here.
    ///
    /// Returns `None` when the row duplicates an existing (enrollment, step)
    /// message and was ignored.
    pub async fn create_message(&self, new: NewMessage) -> Result<Option<Message>, DatabaseError> {
        let message = new.into_message(self.clock.now());
        if self.store.insert_message(&message).await? {
            debug!(
                message_id = %message.id,
                lead_id = %message.lead_id,
                channel = %message.channel,
                status = %message.status,
                "Message created"
            );
            Ok(Some(message))
        } else {
            debug!(lead_id = %message.lead_id, "Duplicate step message ignored");
            Ok(None)
        }
    }

    /// Attempt every due outbound row, oldest first, up to `limit`.
    pub async fn process_pending_outbound(
        &self,
        limit: usize,
        lead_filter: Option<Uuid>,
    ) -> Result<DispatchReport, DatabaseError> {
        let now = self.clock.now();
        let due = self.store.list_due_outbound(now, limit, lead_filter).await?;

        let mut report = DispatchReport {
            selected: due.len(),
            ..Default::default()
        };

        for message in &due {
            match self.try_send(message).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(message_id = %message.id, "Dispatch attempt aborted: {e}");
                    report.errors += 1;
                }
            }
        }

        if report.selected > 0 {
            info!(
                selected = report.selected,
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Dispatcher pass complete"
            );
        }
        Ok(report)
    }

    /// Claim and deliver one message.
    ///
    /// The row moves to `sending` and its attempt count is bumped before the
    /// sender runs. Send failures are recorded on the row, with a `retry_at`
    /// when the retry policy leaves attempts; they are never retried here.
    pub async fn try_send(&self, message: &Message) -> Result<SendOutcome, DatabaseError> {
        if message.direction != Direction::Outbound || !message.status.is_sendable() {
            return Ok(SendOutcome::NotClaimed);
        }

        let now = self.clock.now();
        if !self
            .store
            .claim_message(message.id, message.attempt_count, now)
            .await?
        {
            debug!(message_id = %message.id, "Message already claimed");
            return Ok(SendOutcome::NotClaimed);
        }

        let lead = self.store.get_lead(message.lead_id).await?;
        let recipient = lead.as_ref().and_then(|lead| match message.channel {
            Channel::Sms => lead.phone.clone(),
            Channel::Email => lead.email.clone(),
        });

        let Some(to) = recipient else {
            let reason = match lead {
                None => "lead not found".to_string(),
                Some(_) => format!("lead has no {} contact", message.channel),
            };
            self.store
                .mark_message_skipped(message.id, &reason, self.clock.now())
                .await?;
            info!(message_id = %message.id, reason = %reason, "Message skipped");
            record_best_effort(
                self.timeline.as_ref(),
                message.lead_id,
                TimelineEvent::MessageSkipped,
                json!({ "message_id": message.id, "channel": message.channel, "reason": reason }),
            )
            .await;
            return Ok(SendOutcome::Skipped { reason });
        };

        let result = match message.channel {
            Channel::Sms => {
                self.sms
                    .send_sms(&OutboundSms {
                        to,
                        body: message.body.clone(),
                    })
                    .await
            }
            Channel::Email => {
                self.email
                    .send_email(&OutboundEmail {
                        to,
                        subject: message
                            .subject
                            .clone()
                            .unwrap_or_else(|| DEFAULT_EMAIL_SUBJECT.to_string()),
                        body: message.body.clone(),
                    })
                    .await
            }
        };

        match result {
            Ok(provider_message_id) => {
                self.store
                    .mark_message_sent(message.id, Some(&provider_message_id), self.clock.now())
                    .await?;
                info!(
                    message_id = %message.id,
                    lead_id = %message.lead_id,
                    channel = %message.channel,
                    "Message sent"
                );
                record_best_effort(
                    self.timeline.as_ref(),
                    message.lead_id,
                    TimelineEvent::MessageSent,
                    json!({
                        "message_id": message.id,
                        "channel": message.channel,
                        "provider_message_id": provider_message_id,
                    }),
                )
                .await;
                Ok(SendOutcome::Sent {
                    provider_message_id,
                })
            }
            Err(e) => {
                let error = e.to_string();
                let failed_at = self.clock.now();
                let retry_at = self
                    .retry
                    .retry_at(message.attempt_count.saturating_add(1), failed_at);
                self.store
                    .mark_message_failed(message.id, &error, retry_at, failed_at)
                    .await?;
                warn!(
                    message_id = %message.id,
                    lead_id = %message.lead_id,
                    channel = %message.channel,
                    "Message send failed: {error}"
                );
                record_best_effort(
                    self.timeline.as_ref(),
                    message.lead_id,
                    TimelineEvent::MessageFailed,
                    json!({ "message_id": message.id, "channel": message.channel, "error": error }),
                )
                .await;
                Ok(SendOutcome::Failed { error })
            }
        }
    }

    /// Put failed rows whose `retry_at` has passed back in the queue. Rows
    /// whose tenant is inside quiet hours are scheduled for the window end.
    /// A no-op while the policy is disabled.
    pub async fn requeue_failed(&self, limit: usize) -> Result<usize, DatabaseError> {
        if !self.retry.is_enabled() {
            return Ok(0);
        }

        let now = self.clock.now();
        let due = self.store.list_retryable_failed(now, limit).await?;

        let mut requeued = 0;
        for message in &due {
            let scheduled_at = self.resend_time(message.tenant_id, now).await?;
            if self.store.requeue_message(message.id, scheduled_at, now).await? {
                debug!(
                    message_id = %message.id,
                    attempts = message.attempt_count,
                    scheduled_at = ?scheduled_at,
                    "Failed message re-queued"
                );
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!(requeued, "Re-queued failed messages");
        }
        Ok(requeued)
    }

    /// Agent-initiated resend of one failed message: `pending`, or
    /// `scheduled` for the end of the tenant's quiet hours.
    /// Returns `false` if the message does not exist or is not `failed`.
    pub async fn requeue(&self, message_id: Uuid) -> Result<bool, DatabaseError> {
        let Some(message) = self.store.get_message(message_id).await? else {
            return Ok(false);
        };
        if message.direction != Direction::Outbound || message.status != MessageStatus::Failed {
            return Ok(false);
        }

        let now = self.clock.now();
        let scheduled_at = self.resend_time(message.tenant_id, now).await?;
        let requeued = self
            .store
            .requeue_message(message_id, scheduled_at, now)
            .await?;
        if requeued {
            info!(message_id = %message_id, scheduled_at = ?scheduled_at, "Message manually re-queued");
        }
        Ok(requeued)
    }

    /// Fail rows stuck in `sending` past [`STALLED_SEND_MINUTES`], e.g. after
    /// a crash mid-send. They are not auto-retried since delivery is unknown.
    pub async fn fail_stalled_sends(&self) -> Result<u64, DatabaseError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::minutes(STALLED_SEND_MINUTES);
        let failed = self
            .store
            .fail_stalled_sends(cutoff, STALLED_SEND_ERROR, now)
            .await?;
        if failed > 0 {
            warn!(count = failed, "Stalled sends marked failed");
        }
        Ok(failed)
    }

    /// `None` to send right away, or the end of the tenant's quiet hours.
    async fn resend_time(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let settings = self.tenants.get(tenant_id).await?;
        let at = settings.next_send_time(now);
        Ok((at > now).then_some(at))
    }

    /// Failed outbound messages for a tenant, newest first.
    pub async fn list_failed(&self, tenant_id: Uuid, limit: usize) -> Result<Vec<Message>, DatabaseError> {
        self.store.list_failed_messages(tenant_id, limit).await
    }
}
