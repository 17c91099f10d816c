//! SequenceRunner: polling state machine over enrollments.
//!
//! Enrollment lifecycle: `active -> active (step advanced) -> completed`, or
//! `active -> stopped` from any active state. Step offsets are measured from
//! enrollment time, so a late tick never compresses the remaining schedule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::leads::{Lead, SequenceStatus};
use crate::messaging::dispatcher::DEFAULT_EMAIL_SUBJECT;
use crate::messaging::{Channel, MessageDispatcher, MessageStatus, NewMessage};
use crate::sequences::template::{TemplateVars, render};
use crate::sequences::{EnrollmentStatus, SequenceEnrollment, StopReason};
use crate::store::Database;
use crate::tenants::TenantSettingsProvider;
use crate::timeline::{TimelineEvent, TimelineLogger, record_best_effort};

/// Default batch size for one sequence tick.
pub const DEFAULT_ENROLLMENT_BATCH: usize = 25;

/// Result of trying to enroll a lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Enrolled {
        enrollment_id: Uuid,
        sequence_id: Uuid,
        next_run_at: DateTime<Utc>,
    },
    AlreadyEnrolled,
    NoMatchingSequence,
    /// The tenant has automations switched off.
    Disabled,
    /// Enrollment could not be set up; the caller carries on regardless.
    Failed { error: String },
}

/// Result of running one enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// A step message was queued and the enrollment moved to the next step.
    Advanced { step_index: u32, next_run_at: DateTime<Utc> },
    /// The last step was queued.
    Completed { step_index: u32 },
    /// Sequence or lead vanished; the enrollment was stopped.
    ForceStopped,
    /// Enrollment changed underneath us (stopped, or another tick advanced it).
    Superseded,
}

/// Tally of one sequence tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollmentTickReport {
    pub selected: usize,
    pub advanced: usize,
    pub completed: usize,
    pub force_stopped: usize,
    pub superseded: usize,
    pub errors: usize,
}

pub struct SequenceRunner {
    store: Arc<dyn Database>,
    dispatcher: Arc<MessageDispatcher>,
    tenants: Arc<dyn TenantSettingsProvider>,
    timeline: Arc<dyn TimelineLogger>,
    clock: Arc<dyn Clock>,
}

impl SequenceRunner {
    pub fn new(
        store: Arc<dyn Database>,
        dispatcher: Arc<MessageDispatcher>,
        tenants: Arc<dyn TenantSettingsProvider>,
        timeline: Arc<dyn TimelineLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            tenants,
            timeline,
            clock,
        }
    }

    /// Enroll a lead in its best-matching sequence. Never fails the caller.
    pub async fn start_for_lead(&self, lead: &Lead) -> StartOutcome {
        match self.try_start(lead).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(lead_id = %lead.id, "Sequence enrollment failed: {e}");
                StartOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn try_start(&self, lead: &Lead) -> Result<StartOutcome, DatabaseError> {
        if lead.id.is_nil() || lead.tenant_id.is_nil() {
            debug!("Lead without id or tenant; not enrolling");
            return Ok(StartOutcome::NoMatchingSequence);
        }

        if self.store.get_active_enrollment(lead.id).await?.is_some() {
            debug!(lead_id = %lead.id, "Lead already has an active enrollment");
            return Ok(StartOutcome::AlreadyEnrolled);
        }

        let sequence = self
            .store
            .find_matching_sequence(lead.tenant_id, lead.lead_type, lead.temperature)
            .await?;
        let Some(sequence) = sequence.filter(|s| !s.steps.is_empty()) else {
            info!(
                lead_id = %lead.id,
                lead_type = %lead.lead_type,
                temperature = %lead.temperature,
                "No sequence matches lead"
            );
            return Ok(StartOutcome::NoMatchingSequence);
        };

        let now = self.clock.now();
        let next_run_at = sequence.steps[0].due_at(now);
        let enrollment = SequenceEnrollment {
            id: Uuid::new_v4(),
            tenant_id: lead.tenant_id,
            lead_id: lead.id,
            sequence_id: sequence.id,
            status: EnrollmentStatus::Active,
            current_step_index: 0,
            next_run_at: Some(next_run_at),
            stopped_reason: None,
            enrolled_at: now,
            updated_at: now,
        };

        if !self.store.insert_enrollment(&enrollment).await? {
            debug!(lead_id = %lead.id, "Concurrent enrollment won; not enrolling again");
            return Ok(StartOutcome::AlreadyEnrolled);
        }

        self.store
            .update_lead_sequence_status(lead.id, SequenceStatus::Active, now)
            .await?;
        info!(
            lead_id = %lead.id,
            enrollment_id = %enrollment.id,
            sequence = %sequence.name,
            "Lead enrolled in sequence"
        );
        record_best_effort(
            self.timeline.as_ref(),
            lead.id,
            TimelineEvent::SequenceStarted,
            json!({ "enrollment_id": enrollment.id, "sequence_id": sequence.id, "sequence": sequence.name }),
        )
        .await;

        Ok(StartOutcome::Enrolled {
            enrollment_id: enrollment.id,
            sequence_id: sequence.id,
            next_run_at,
        })
    }

    /// Stop every active enrollment for the lead. Idempotent.
    pub async fn stop_for_lead(&self, lead_id: Uuid, reason: StopReason) -> Result<u64, DatabaseError> {
        let stopped = self
            .store
            .stop_active_enrollments(lead_id, reason, self.clock.now())
            .await?;
        if stopped > 0 {
            info!(lead_id = %lead_id, reason = %reason, stopped, "Sequence stopped");
            record_best_effort(
                self.timeline.as_ref(),
                lead_id,
                TimelineEvent::SequenceStopped,
                json!({ "reason": reason, "enrollments": stopped }),
            )
            .await;
        }
        Ok(stopped)
    }

    /// Stop the lead's automation and mark the lead itself stopped.
    pub async fn stop(&self, lead_id: Uuid, reason: StopReason) -> Result<u64, DatabaseError> {
        let stopped = self.stop_for_lead(lead_id, reason).await?;
        self.store
            .update_lead_sequence_status(lead_id, SequenceStatus::Stopped, self.clock.now())
            .await?;
        Ok(stopped)
    }

    /// Run every due enrollment, earliest first. One failure never aborts the batch.
    pub async fn process_due_enrollments(
        &self,
        limit: usize,
    ) -> Result<EnrollmentTickReport, DatabaseError> {
        let due = self
            .store
            .list_due_enrollments(self.clock.now(), limit)
            .await?;

        let mut report = EnrollmentTickReport {
            selected: due.len(),
            ..Default::default()
        };

        for enrollment in &due {
            match self.run_one_enrollment(enrollment).await {
                Ok(StepOutcome::Advanced { .. }) => report.advanced += 1,
                Ok(StepOutcome::Completed { .. }) => report.completed += 1,
                Ok(StepOutcome::ForceStopped) => report.force_stopped += 1,
                Ok(StepOutcome::Superseded) => report.superseded += 1,
                Err(e) => {
                    error!(enrollment_id = %enrollment.id, "Enrollment step failed: {e}");
                    report.errors += 1;
                }
            }
        }

        if report.selected > 0 {
            info!(
                selected = report.selected,
                advanced = report.advanced,
                completed = report.completed,
                "Sequence pass complete"
            );
        }
        Ok(report)
    }

    /// Queue the enrollment's current step and move it forward.
    ///
    /// Safe to run twice for the same step: the step message is unique per
    /// (enrollment, step) and the advance is conditional on the step index.
    pub async fn run_one_enrollment(
        &self,
        enrollment: &SequenceEnrollment,
    ) -> Result<StepOutcome, DatabaseError> {
        if enrollment.status != EnrollmentStatus::Active {
            return Ok(StepOutcome::Superseded);
        }

        let sequence = self.store.get_sequence(enrollment.sequence_id).await?;
        let lead = self.store.get_lead(enrollment.lead_id).await?;
        let (Some(mut sequence), Some(lead)) = (sequence, lead) else {
            warn!(enrollment_id = %enrollment.id, "Sequence or lead missing; stopping enrollment");
            self.store
                .stop_enrollment(enrollment.id, StopReason::Other, self.clock.now())
                .await?;
            return Ok(StepOutcome::ForceStopped);
        };
        sequence.sort_steps();

        let index = enrollment.current_step_index;
        let Some(step) = sequence.steps.get(index as usize) else {
            // Steps shrank below the saved index; nothing left to send.
            let done = self
                .store
                .complete_enrollment(enrollment.id, index, index, self.clock.now())
                .await?;
            return Ok(if done {
                self.mark_completed(&lead, enrollment, index).await?;
                StepOutcome::Completed { step_index: index }
            } else {
                StepOutcome::Superseded
            });
        };

        let settings = self.tenants.get(lead.tenant_id).await?;
        let vars = TemplateVars {
            lead_name: lead.display_name(),
            booking_link: settings.booking_link(),
        };

        let now = self.clock.now();
        let (status, scheduled_at) = if settings.is_quiet_at(now) {
            (MessageStatus::Scheduled, Some(settings.next_send_time(now)))
        } else {
            (MessageStatus::Pending, None)
        };

        let mut new_message = NewMessage::outbound(
            lead.tenant_id,
            lead.id,
            step.channel,
            render(&step.body_template, &vars),
            status,
            scheduled_at,
        )
        .for_step(enrollment.id, index);
        if step.channel == Channel::Email {
            let subject = step.subject_template.as_deref().unwrap_or(DEFAULT_EMAIL_SUBJECT);
            new_message = new_message.with_subject(render(subject, &vars));
        }

        if let Some(message) = self.dispatcher.create_message(new_message).await? {
            record_best_effort(
                self.timeline.as_ref(),
                lead.id,
                TimelineEvent::SequenceStepQueued,
                json!({
                    "enrollment_id": enrollment.id,
                    "step_index": index,
                    "message_id": message.id,
                    "channel": step.channel,
                    "scheduled_at": scheduled_at,
                }),
            )
            .await;
        }

        let next_index = index + 1;
        match sequence.steps.get(next_index as usize) {
            Some(next_step) => {
                let next_run_at = next_step.due_at(enrollment.enrolled_at);
                let advanced = self
                    .store
                    .advance_enrollment(enrollment.id, index, next_index, next_run_at, now)
                    .await?;
                if !advanced {
                    debug!(enrollment_id = %enrollment.id, "Enrollment moved on before advance");
                    return Ok(StepOutcome::Superseded);
                }
                debug!(
                    enrollment_id = %enrollment.id,
                    step_index = next_index,
                    next_run_at = %next_run_at,
                    "Enrollment advanced"
                );
                Ok(StepOutcome::Advanced {
                    step_index: next_index,
                    next_run_at,
                })
            }
            None => {
                let done = self
                    .store
                    .complete_enrollment(enrollment.id, index, next_index, now)
                    .await?;
                if !done {
                    return Ok(StepOutcome::Superseded);
                }
                self.mark_completed(&lead, enrollment, next_index).await?;
                Ok(StepOutcome::Completed {
                    step_index: next_index,
                })
            }
        }
    }

    async fn mark_completed(
        &self,
        lead: &Lead,
        enrollment: &SequenceEnrollment,
        steps_run: u32,
    ) -> Result<(), DatabaseError> {
        self.store
            .update_lead_sequence_status(lead.id, SequenceStatus::Idle, self.clock.now())
            .await?;
        info!(lead_id = %lead.id, enrollment_id = %enrollment.id, "Sequence completed");
        record_best_effort(
            self.timeline.as_ref(),
            lead.id,
            TimelineEvent::SequenceCompleted,
            json!({ "enrollment_id": enrollment.id, "steps": steps_run }),
        )
        .await;
        Ok(())
    }
}
