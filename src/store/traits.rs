//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every create/update is its own atomic unit; no transaction spans a
//! component boundary. Conditional updates (`expected_*` parameters) report
//! whether they matched so callers can detect lost races.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::{Lead, LeadType, SequenceStatus, Temperature};
use crate::messaging::Message;
use crate::sequences::{Sequence, SequenceEnrollment, StopReason};
use crate::tenants::TenantSettings;
use crate::timeline::TimelineEntry;

#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tenants ─────────────────────────────────────────────────────

    async fn insert_tenant(&self, id: Uuid, name: &str) -> Result<(), DatabaseError>;

    async fn tenant_exists(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn get_tenant_settings(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantSettings>, DatabaseError>;

    /// Insert settings; an existing row for the tenant is left untouched.
    async fn insert_tenant_settings(&self, settings: &TenantSettings) -> Result<(), DatabaseError>;

    /// Insert settings, replacing any existing row for the tenant.
    async fn upsert_tenant_settings(&self, settings: &TenantSettings) -> Result<(), DatabaseError>;

    /// Tenant whose outbound SMS number equals `number` (normalized).
    async fn find_tenant_by_sms_number(&self, number: &str) -> Result<Option<Uuid>, DatabaseError>;

    /// Tenant whose reply-to address equals `email` (normalized).
    async fn find_tenant_by_reply_email(&self, email: &str) -> Result<Option<Uuid>, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Oldest lead in the tenant matching any of the given identifiers.
    /// Absent identifiers contribute no clause; with none given, returns `None`.
    async fn find_duplicate_lead(
        &self,
        tenant_id: Uuid,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<Lead>, DatabaseError>;

    /// Most recently created lead with this phone, optionally within one tenant.
    async fn find_latest_lead_by_phone(
        &self,
        phone: &str,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<Lead>, DatabaseError>;

    /// Most recently created lead with this email, optionally within one tenant.
    async fn find_latest_lead_by_email(
        &self,
        email: &str,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<Lead>, DatabaseError>;

    async fn update_lead_sequence_status(
        &self,
        lead_id: Uuid,
        status: SequenceStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message. Returns `false` if a message for the same
    /// (enrollment, step) already exists.
    async fn insert_message(&self, message: &Message) -> Result<bool, DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    async fn list_messages_for_lead(&self, lead_id: Uuid) -> Result<Vec<Message>, DatabaseError>;

    /// Outbound `pending|scheduled` rows with `scheduled_at` null or `<= now`,
    /// oldest first.
    async fn list_due_outbound(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lead_id: Option<Uuid>,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Move a sendable row to `sending`, bumping `attempt_count` and clearing
    /// `last_error`, but only if nobody else bumped it first. Claimed rows
    /// drop out of `list_due_outbound`.
    async fn claim_message(
        &self,
        id: Uuid,
        expected_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // The three marks below only apply to rows in `sending`.

    async fn mark_message_sent(
        &self,
        id: Uuid,
        provider_message_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn mark_message_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn mark_message_skipped(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Failed outbound messages for one tenant, newest first.
    async fn list_failed_messages(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Failed outbound messages across tenants whose `retry_at` has passed,
    /// earliest first.
    async fn list_retryable_failed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Move a `failed` outbound message back into the send queue.
    async fn requeue_message(
        &self,
        id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Fail rows left in `sending` since before `claimed_before`. Returns the
    /// number of rows changed.
    async fn fail_stalled_sends(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Sequences ───────────────────────────────────────────────────

    /// Insert a sequence together with its steps.
    async fn insert_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError>;

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError>;

    /// Most specific active sequence for the tenant matching the lead profile.
    async fn find_matching_sequence(
        &self,
        tenant_id: Uuid,
        lead_type: LeadType,
        temperature: Temperature,
    ) -> Result<Option<Sequence>, DatabaseError>;

    // ── Enrollments ─────────────────────────────────────────────────

    /// Insert an enrollment. Returns `false` if the lead already has an
    /// active one.
    async fn insert_enrollment(&self, enrollment: &SequenceEnrollment) -> Result<bool, DatabaseError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<SequenceEnrollment>, DatabaseError>;

    async fn get_active_enrollment(
        &self,
        lead_id: Uuid,
    ) -> Result<Option<SequenceEnrollment>, DatabaseError>;

    /// Active enrollments with `next_run_at <= now`, earliest first.
    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SequenceEnrollment>, DatabaseError>;

    /// Move an active enrollment from `expected_step` to `next_step`.
    async fn advance_enrollment(
        &self,
        id: Uuid,
        expected_step: u32,
        next_step: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Mark an active enrollment at `expected_step` completed.
    async fn complete_enrollment(
        &self,
        id: Uuid,
        expected_step: u32,
        final_step: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Stop one enrollment if it is still active.
    async fn stop_enrollment(
        &self,
        id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Stop every active enrollment for a lead. Returns how many changed.
    async fn stop_active_enrollments(
        &self,
        lead_id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Timeline ────────────────────────────────────────────────────

    async fn insert_lead_event(&self, entry: &TimelineEntry) -> Result<(), DatabaseError>;

    async fn list_lead_events(&self, lead_id: Uuid) -> Result<Vec<TimelineEntry>, DatabaseError>;
}
