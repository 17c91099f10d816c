//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC (`...T..:..:..ffffffZ`) so that SQL string
//! comparison orders them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::{Lead, LeadType, SequenceStatus, Temperature};
use crate::messaging::{Channel, Direction, Message, MessageStatus};
use crate::sequences::{
    EnrollmentStatus, Sequence, SequenceEnrollment, SequenceStep, StopReason,
};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tenants::TenantSettings;
use crate::timeline::TimelineEntry;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("invalid uuid in {column}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

type RowMapper<T> = fn(&libsql::Row) -> Result<T, DatabaseError>;

/// Run a query and map every row, skipping (and logging) rows that fail to parse.
async fn query_all<T>(
    conn: &Connection,
    op: &'static str,
    sql: &str,
    params: impl IntoParams,
    map: RowMapper<T>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn.query(sql, params).await.map_err(query_err(op))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        match map(&row) {
            Ok(item) => out.push(item),
            Err(e) => tracing::warn!("{op}: skipping row: {e}"),
        }
    }
    Ok(out)
}

/// Run a query and map the first row, if any.
async fn query_opt<T>(
    conn: &Connection,
    op: &'static str,
    sql: &str,
    params: impl IntoParams,
    map: RowMapper<T>,
) -> Result<Option<T>, DatabaseError> {
    let mut rows = conn.query(sql, params).await.map_err(query_err(op))?;
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => map(&row).map(Some),
        None => Ok(None),
    }
}

fn col_text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn col_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn col_int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

// ── Row mappers ─────────────────────────────────────────────────────

const TENANT_SETTINGS_COLUMNS: &str = "tenant_id, timezone, quiet_hours_start, quiet_hours_end, booking_link, automations_enabled, sms_number, reply_email";

fn row_to_settings(row: &libsql::Row) -> Result<TenantSettings, DatabaseError> {
    Ok(TenantSettings {
        tenant_id: parse_uuid(&col_text(row, 0)?, "tenant_id")?,
        timezone: col_text(row, 1)?,
        quiet_hours_start: col_text(row, 2)?,
        quiet_hours_end: col_text(row, 3)?,
        booking_link: col_opt_text(row, 4),
        automations_enabled: col_int(row, 5)? != 0,
        sms_number: col_opt_text(row, 6),
        reply_email: col_opt_text(row, 7),
    })
}

const LEAD_COLUMNS: &str = "id, tenant_id, full_name, email, phone, source, lead_type, temperature, stage, sequence_status, created_at, updated_at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    Ok(Lead {
        id: parse_uuid(&col_text(row, 0)?, "leads.id")?,
        tenant_id: parse_uuid(&col_text(row, 1)?, "leads.tenant_id")?,
        full_name: col_text(row, 2)?,
        email: col_opt_text(row, 3),
        phone: col_opt_text(row, 4),
        source: col_opt_text(row, 5),
        lead_type: col_text(row, 6)?.parse().unwrap_or_default(),
        temperature: col_text(row, 7)?.parse().unwrap_or_default(),
        stage: col_text(row, 8)?,
        sequence_status: SequenceStatus::from_db(&col_text(row, 9)?),
        created_at: parse_datetime(&col_text(row, 10)?),
        updated_at: parse_datetime(&col_text(row, 11)?),
    })
}

const MESSAGE_COLUMNS: &str = "id, tenant_id, lead_id, channel, direction, subject, body, status, scheduled_at, sent_at, attempt_count, last_error, provider_message_id, enrollment_id, step_index, created_at, updated_at, retry_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let channel_str = col_text(row, 3)?;
    let channel = Channel::from_db(&channel_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown channel: {channel_str}")))?;
    let enrollment_id = match col_opt_text(row, 13) {
        Some(s) => Some(parse_uuid(&s, "messages.enrollment_id")?),
        None => None,
    };

    Ok(Message {
        id: parse_uuid(&col_text(row, 0)?, "messages.id")?,
        tenant_id: parse_uuid(&col_text(row, 1)?, "messages.tenant_id")?,
        lead_id: parse_uuid(&col_text(row, 2)?, "messages.lead_id")?,
        channel,
        direction: Direction::from_db(&col_text(row, 4)?),
        subject: col_opt_text(row, 5),
        body: col_text(row, 6)?,
        status: MessageStatus::from_db(&col_text(row, 7)?),
        scheduled_at: parse_optional_datetime(&col_opt_text(row, 8)),
        sent_at: parse_optional_datetime(&col_opt_text(row, 9)),
        attempt_count: col_int(row, 10)?.max(0) as u32,
        last_error: col_opt_text(row, 11),
        provider_message_id: col_opt_text(row, 12),
        enrollment_id,
        step_index: row.get::<i64>(14).ok().map(|v| v.max(0) as u32),
        created_at: parse_datetime(&col_text(row, 15)?),
        updated_at: parse_datetime(&col_text(row, 16)?),
        retry_at: parse_optional_datetime(&col_opt_text(row, 17)),
    })
}

const SEQUENCE_COLUMNS: &str = "id, tenant_id, name, lead_type, temperature, is_active, created_at";

fn row_to_sequence(row: &libsql::Row) -> Result<Sequence, DatabaseError> {
    Ok(Sequence {
        id: parse_uuid(&col_text(row, 0)?, "sequences.id")?,
        tenant_id: parse_uuid(&col_text(row, 1)?, "sequences.tenant_id")?,
        name: col_text(row, 2)?,
        lead_type: col_opt_text(row, 3).and_then(|s| s.parse::<LeadType>().ok()),
        temperature: col_opt_text(row, 4).and_then(|s| s.parse::<Temperature>().ok()),
        is_active: col_int(row, 5)? != 0,
        steps: Vec::new(),
        created_at: parse_datetime(&col_text(row, 6)?),
    })
}

const STEP_COLUMNS: &str = "id, sequence_id, offset_minutes, channel, subject_template, body_template";

fn row_to_step(row: &libsql::Row) -> Result<SequenceStep, DatabaseError> {
    let channel_str = col_text(row, 3)?;
    Ok(SequenceStep {
        id: parse_uuid(&col_text(row, 0)?, "sequence_steps.id")?,
        sequence_id: parse_uuid(&col_text(row, 1)?, "sequence_steps.sequence_id")?,
        offset_minutes: col_int(row, 2)?,
        channel: Channel::from_db(&channel_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown channel: {channel_str}"))
        })?,
        subject_template: col_opt_text(row, 4),
        body_template: col_text(row, 5)?,
    })
}

const ENROLLMENT_COLUMNS: &str = "id, tenant_id, lead_id, sequence_id, status, current_step_index, next_run_at, stopped_reason, enrolled_at, updated_at";

fn row_to_enrollment(row: &libsql::Row) -> Result<SequenceEnrollment, DatabaseError> {
    Ok(SequenceEnrollment {
        id: parse_uuid(&col_text(row, 0)?, "sequence_enrollments.id")?,
        tenant_id: parse_uuid(&col_text(row, 1)?, "sequence_enrollments.tenant_id")?,
        lead_id: parse_uuid(&col_text(row, 2)?, "sequence_enrollments.lead_id")?,
        sequence_id: parse_uuid(&col_text(row, 3)?, "sequence_enrollments.sequence_id")?,
        status: EnrollmentStatus::from_db(&col_text(row, 4)?),
        current_step_index: col_int(row, 5)?.max(0) as u32,
        next_run_at: parse_optional_datetime(&col_opt_text(row, 6)),
        stopped_reason: col_opt_text(row, 7).map(|s| StopReason::from_db(&s)),
        enrolled_at: parse_datetime(&col_text(row, 8)?),
        updated_at: parse_datetime(&col_text(row, 9)?),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<TimelineEntry, DatabaseError> {
    let metadata_str = col_text(row, 3)?;
    Ok(TimelineEntry {
        id: parse_uuid(&col_text(row, 0)?, "lead_events.id")?,
        lead_id: parse_uuid(&col_text(row, 1)?, "lead_events.lead_id")?,
        event_type: col_text(row, 2)?,
        metadata: serde_json::from_str(&metadata_str)
            .map_err(|e| DatabaseError::Serialization(format!("lead_events.metadata: {e}")))?,
        created_at: parse_datetime(&col_text(row, 4)?),
    })
}

fn row_to_uuid(row: &libsql::Row) -> Result<Uuid, DatabaseError> {
    parse_uuid(&col_text(row, 0)?, "id")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn insert_tenant(&self, id: Uuid, name: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenants (id, name) VALUES (?1, ?2)",
                params![id.to_string(), name],
            )
            .await
            .map_err(query_err("insert_tenant"))?;
        debug!(tenant_id = %id, "Tenant inserted");
        Ok(())
    }

    async fn tenant_exists(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let found = query_opt(
            self.conn(),
            "tenant_exists",
            "SELECT id FROM tenants WHERE id = ?1",
            params![id.to_string()],
            row_to_uuid,
        )
        .await?;
        Ok(found.is_some())
    }

    async fn get_tenant_settings(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantSettings>, DatabaseError> {
        query_opt(
            self.conn(),
            "get_tenant_settings",
            &format!("SELECT {TENANT_SETTINGS_COLUMNS} FROM tenant_settings WHERE tenant_id = ?1"),
            params![tenant_id.to_string()],
            row_to_settings,
        )
        .await
    }

    async fn insert_tenant_settings(&self, settings: &TenantSettings) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tenant_settings ({TENANT_SETTINGS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    settings.tenant_id.to_string(),
                    settings.timezone.as_str(),
                    settings.quiet_hours_start.as_str(),
                    settings.quiet_hours_end.as_str(),
                    opt_text(settings.booking_link.as_deref()),
                    settings.automations_enabled as i64,
                    opt_text(settings.sms_number.as_deref()),
                    opt_text(settings.reply_email.as_deref()),
                ],
            )
            .await
            .map_err(query_err("insert_tenant_settings"))?;
        Ok(())
    }

    async fn upsert_tenant_settings(&self, settings: &TenantSettings) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tenant_settings ({TENANT_SETTINGS_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(tenant_id) DO UPDATE SET
                        timezone = excluded.timezone,
                        quiet_hours_start = excluded.quiet_hours_start,
                        quiet_hours_end = excluded.quiet_hours_end,
                        booking_link = excluded.booking_link,
                        automations_enabled = excluded.automations_enabled,
                        sms_number = excluded.sms_number,
                        reply_email = excluded.reply_email"
                ),
                params![
                    settings.tenant_id.to_string(),
                    settings.timezone.as_str(),
                    settings.quiet_hours_start.as_str(),
                    settings.quiet_hours_end.as_str(),
                    opt_text(settings.booking_link.as_deref()),
                    settings.automations_enabled as i64,
                    opt_text(settings.sms_number.as_deref()),
                    opt_text(settings.reply_email.as_deref()),
                ],
            )
            .await
            .map_err(query_err("upsert_tenant_settings"))?;
        Ok(())
    }

    async fn find_tenant_by_sms_number(&self, number: &str) -> Result<Option<Uuid>, DatabaseError> {
        query_opt(
            self.conn(),
            "find_tenant_by_sms_number",
            "SELECT tenant_id FROM tenant_settings WHERE sms_number = ?1 LIMIT 1",
            params![number],
            row_to_uuid,
        )
        .await
    }

    async fn find_tenant_by_reply_email(&self, email: &str) -> Result<Option<Uuid>, DatabaseError> {
        query_opt(
            self.conn(),
            "find_tenant_by_reply_email",
            "SELECT tenant_id FROM tenant_settings WHERE reply_email = ?1 LIMIT 1",
            params![email],
            row_to_uuid,
        )
        .await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    lead.id.to_string(),
                    lead.tenant_id.to_string(),
                    lead.full_name.as_str(),
                    opt_text(lead.email.as_deref()),
                    opt_text(lead.phone.as_deref()),
                    opt_text(lead.source.as_deref()),
                    lead.lead_type.as_str(),
                    lead.temperature.as_str(),
                    lead.stage.as_str(),
                    lead.sequence_status.as_str(),
                    ts(lead.created_at),
                    ts(lead.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_lead"))?;
        debug!(lead_id = %lead.id, tenant_id = %lead.tenant_id, "Lead inserted");
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        query_opt(
            self.conn(),
            "get_lead",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
            params![id.to_string()],
            row_to_lead,
        )
        .await
    }

    async fn find_duplicate_lead(
        &self,
        tenant_id: Uuid,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<Lead>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values = vec![libsql::Value::Text(tenant_id.to_string())];
        if let Some(email) = email {
            values.push(libsql::Value::Text(email.to_string()));
            clauses.push(format!("email = ?{}", values.len()));
        }
        if let Some(phone) = phone {
            values.push(libsql::Value::Text(phone.to_string()));
            clauses.push(format!("phone = ?{}", values.len()));
        }
        if clauses.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 AND ({})
             ORDER BY created_at ASC, rowid ASC LIMIT 1",
            clauses.join(" OR ")
        );
        query_opt(self.conn(), "find_duplicate_lead", &sql, values, row_to_lead).await
    }

    async fn find_latest_lead_by_phone(
        &self,
        phone: &str,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<Lead>, DatabaseError> {
        query_opt(
            self.conn(),
            "find_latest_lead_by_phone",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE phone = ?1 AND (?2 IS NULL OR tenant_id = ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            params![phone, opt_text(tenant_id.map(|t| t.to_string()).as_deref())],
            row_to_lead,
        )
        .await
    }

    async fn find_latest_lead_by_email(
        &self,
        email: &str,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<Lead>, DatabaseError> {
        query_opt(
            self.conn(),
            "find_latest_lead_by_email",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE email = ?1 AND (?2 IS NULL OR tenant_id = ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            params![email, opt_text(tenant_id.map(|t| t.to_string()).as_deref())],
            row_to_lead,
        )
        .await
    }

    async fn update_lead_sequence_status(
        &self,
        lead_id: Uuid,
        status: SequenceStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET sequence_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(now), lead_id.to_string()],
            )
            .await
            .map_err(query_err("update_lead_sequence_status"))?;
        debug!(lead_id = %lead_id, status = status.as_str(), "Lead sequence status updated");
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    message.id.to_string(),
                    message.tenant_id.to_string(),
                    message.lead_id.to_string(),
                    message.channel.as_str(),
                    message.direction.as_str(),
                    opt_text(message.subject.as_deref()),
                    message.body.as_str(),
                    message.status.as_str(),
                    opt_ts(message.scheduled_at),
                    opt_ts(message.sent_at),
                    message.attempt_count as i64,
                    opt_text(message.last_error.as_deref()),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(message.enrollment_id.map(|id| id.to_string()).as_deref()),
                    opt_int(message.step_index.map(i64::from)),
                    ts(message.created_at),
                    ts(message.updated_at),
                    opt_ts(message.retry_at),
                ],
            )
            .await
            .map_err(query_err("insert_message"))?;

        debug!(
            message_id = %message.id,
            lead_id = %message.lead_id,
            status = %message.status,
            inserted = inserted > 0,
            "Message insert"
        );
        Ok(inserted > 0)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        query_opt(
            self.conn(),
            "get_message",
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
            row_to_message,
        )
        .await
    }

    async fn list_messages_for_lead(&self, lead_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        query_all(
            self.conn(),
            "list_messages_for_lead",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE lead_id = ?1 ORDER BY created_at ASC, rowid ASC"
            ),
            params![lead_id.to_string()],
            row_to_message,
        )
        .await
    }

    async fn list_due_outbound(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lead_id: Option<Uuid>,
    ) -> Result<Vec<Message>, DatabaseError> {
        query_all(
            self.conn(),
            "list_due_outbound",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE direction = 'outbound'
                   AND status IN ('pending', 'scheduled')
                   AND (scheduled_at IS NULL OR scheduled_at <= ?1)
                   AND (?3 IS NULL OR lead_id = ?3)
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?2"
            ),
            params![
                ts(now),
                limit as i64,
                opt_text(lead_id.map(|id| id.to_string()).as_deref()),
            ],
            row_to_message,
        )
        .await
    }

    async fn claim_message(
        &self,
        id: Uuid,
        expected_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE messages
                 SET status = 'sending', attempt_count = attempt_count + 1, last_error = NULL,
                     retry_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND attempt_count = ?2 AND status IN ('pending', 'scheduled')",
                params![id.to_string(), expected_attempts as i64, ts(now)],
            )
            .await
            .map_err(query_err("claim_message"))?;
        Ok(changed == 1)
    }

    async fn mark_message_sent(
        &self,
        id: Uuid,
        provider_message_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = 'sent', sent_at = ?2, provider_message_id = ?3, updated_at = ?2
                 WHERE id = ?1 AND status = 'sending'",
                params![id.to_string(), ts(now), opt_text(provider_message_id)],
            )
            .await
            .map_err(query_err("mark_message_sent"))?;
        Ok(())
    }

    async fn mark_message_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = 'failed', last_error = ?2, retry_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'sending'",
                params![id.to_string(), error, opt_ts(retry_at), ts(now)],
            )
            .await
            .map_err(query_err("mark_message_failed"))?;
        Ok(())
    }

    async fn mark_message_skipped(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = 'skipped', last_error = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'sending'",
                params![id.to_string(), reason, ts(now)],
            )
            .await
            .map_err(query_err("mark_message_skipped"))?;
        Ok(())
    }

    async fn list_failed_messages(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        query_all(
            self.conn(),
            "list_failed_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE tenant_id = ?1 AND direction = 'outbound' AND status = 'failed'
                 ORDER BY updated_at DESC LIMIT ?2"
            ),
            params![tenant_id.to_string(), limit as i64],
            row_to_message,
        )
        .await
    }

    async fn list_retryable_failed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        query_all(
            self.conn(),
            "list_retryable_failed",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE direction = 'outbound' AND status = 'failed'
                   AND retry_at IS NOT NULL AND retry_at <= ?1
                 ORDER BY retry_at ASC, rowid ASC LIMIT ?2"
            ),
            params![ts(now), limit as i64],
            row_to_message,
        )
        .await
    }

    async fn requeue_message(
        &self,
        id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let status = if scheduled_at.is_some() {
            MessageStatus::Scheduled
        } else {
            MessageStatus::Pending
        };
        let changed = self
            .conn()
            .execute(
                "UPDATE messages SET status = ?2, scheduled_at = ?3, retry_at = NULL, updated_at = ?4
                 WHERE id = ?1 AND direction = 'outbound' AND status = 'failed'",
                params![id.to_string(), status.as_str(), opt_ts(scheduled_at), ts(now)],
            )
            .await
            .map_err(query_err("requeue_message"))?;
        Ok(changed == 1)
    }

    async fn fail_stalled_sends(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = 'failed', last_error = ?2, retry_at = NULL, updated_at = ?3
                 WHERE direction = 'outbound' AND status = 'sending' AND updated_at < ?1",
                params![ts(claimed_before), error, ts(now)],
            )
            .await
            .map_err(query_err("fail_stalled_sends"))
    }

    // ── Sequences ───────────────────────────────────────────────────

    async fn insert_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            &format!("INSERT INTO sequences ({SEQUENCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                sequence.id.to_string(),
                sequence.tenant_id.to_string(),
                sequence.name.as_str(),
                opt_text(sequence.lead_type.map(|t| t.as_str())),
                opt_text(sequence.temperature.map(|t| t.as_str())),
                sequence.is_active as i64,
                ts(sequence.created_at),
            ],
        )
        .await
        .map_err(query_err("insert_sequence"))?;

        for step in &sequence.steps {
            conn.execute(
                &format!("INSERT INTO sequence_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    step.id.to_string(),
                    sequence.id.to_string(),
                    step.offset_minutes,
                    step.channel.as_str(),
                    opt_text(step.subject_template.as_deref()),
                    step.body_template.as_str(),
                ],
            )
            .await
            .map_err(query_err("insert_sequence_step"))?;
        }

        info!(
            sequence_id = %sequence.id,
            tenant_id = %sequence.tenant_id,
            steps = sequence.steps.len(),
            "Sequence inserted"
        );
        Ok(())
    }

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError> {
        let Some(mut sequence) = query_opt(
            self.conn(),
            "get_sequence",
            &format!("SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE id = ?1"),
            params![id.to_string()],
            row_to_sequence,
        )
        .await?
        else {
            return Ok(None);
        };

        sequence.steps = query_all(
            self.conn(),
            "get_sequence_steps",
            &format!("SELECT {STEP_COLUMNS} FROM sequence_steps WHERE sequence_id = ?1"),
            params![id.to_string()],
            row_to_step,
        )
        .await?;
        sequence.sort_steps();
        Ok(Some(sequence))
    }

    async fn find_matching_sequence(
        &self,
        tenant_id: Uuid,
        lead_type: LeadType,
        temperature: Temperature,
    ) -> Result<Option<Sequence>, DatabaseError> {
        let id = query_opt(
            self.conn(),
            "find_matching_sequence",
            "SELECT id FROM sequences
             WHERE tenant_id = ?1 AND is_active = 1
               AND (lead_type = ?2 OR lead_type IS NULL)
               AND (temperature = ?3 OR temperature IS NULL)
             ORDER BY (lead_type IS NULL) ASC, (temperature IS NULL) ASC, created_at ASC
             LIMIT 1",
            params![tenant_id.to_string(), lead_type.as_str(), temperature.as_str()],
            row_to_uuid,
        )
        .await?;

        match id {
            Some(id) => self.get_sequence(id).await,
            None => Ok(None),
        }
    }

    // ── Enrollments ─────────────────────────────────────────────────

    async fn insert_enrollment(&self, enrollment: &SequenceEnrollment) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO sequence_enrollments ({ENROLLMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    enrollment.id.to_string(),
                    enrollment.tenant_id.to_string(),
                    enrollment.lead_id.to_string(),
                    enrollment.sequence_id.to_string(),
                    enrollment.status.as_str(),
                    enrollment.current_step_index as i64,
                    opt_ts(enrollment.next_run_at),
                    opt_text(enrollment.stopped_reason.map(|r| r.as_str())),
                    ts(enrollment.enrolled_at),
                    ts(enrollment.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_enrollment"))?;
        Ok(inserted > 0)
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<SequenceEnrollment>, DatabaseError> {
        query_opt(
            self.conn(),
            "get_enrollment",
            &format!("SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments WHERE id = ?1"),
            params![id.to_string()],
            row_to_enrollment,
        )
        .await
    }

    async fn get_active_enrollment(
        &self,
        lead_id: Uuid,
    ) -> Result<Option<SequenceEnrollment>, DatabaseError> {
        query_opt(
            self.conn(),
            "get_active_enrollment",
            &format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments
                 WHERE lead_id = ?1 AND status = 'active' LIMIT 1"
            ),
            params![lead_id.to_string()],
            row_to_enrollment,
        )
        .await
    }

    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SequenceEnrollment>, DatabaseError> {
        query_all(
            self.conn(),
            "list_due_enrollments",
            &format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments
                 WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at ASC LIMIT ?2"
            ),
            params![ts(now), limit as i64],
            row_to_enrollment,
        )
        .await
    }

    async fn advance_enrollment(
        &self,
        id: Uuid,
        expected_step: u32,
        next_step: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sequence_enrollments
                 SET current_step_index = ?3, next_run_at = ?4, updated_at = ?5
                 WHERE id = ?1 AND status = 'active' AND current_step_index = ?2",
                params![
                    id.to_string(),
                    expected_step as i64,
                    next_step as i64,
                    ts(next_run_at),
                    ts(now),
                ],
            )
            .await
            .map_err(query_err("advance_enrollment"))?;
        Ok(changed == 1)
    }

    async fn complete_enrollment(
        &self,
        id: Uuid,
        expected_step: u32,
        final_step: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sequence_enrollments
                 SET status = 'completed', current_step_index = ?3, next_run_at = NULL, updated_at = ?4
                 WHERE id = ?1 AND status = 'active' AND current_step_index = ?2",
                params![id.to_string(), expected_step as i64, final_step as i64, ts(now)],
            )
            .await
            .map_err(query_err("complete_enrollment"))?;
        Ok(changed == 1)
    }

    async fn stop_enrollment(
        &self,
        id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sequence_enrollments
                 SET status = 'stopped', stopped_reason = ?2, next_run_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'active'",
                params![id.to_string(), reason.as_str(), ts(now)],
            )
            .await
            .map_err(query_err("stop_enrollment"))?;
        Ok(changed == 1)
    }

    async fn stop_active_enrollments(
        &self,
        lead_id: Uuid,
        reason: StopReason,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE sequence_enrollments
                 SET status = 'stopped', stopped_reason = ?2, next_run_at = NULL, updated_at = ?3
                 WHERE lead_id = ?1 AND status = 'active'",
                params![lead_id.to_string(), reason.as_str(), ts(now)],
            )
            .await
            .map_err(query_err("stop_active_enrollments"))?;
        Ok(changed)
    }

    // ── Timeline ────────────────────────────────────────────────────

    async fn insert_lead_event(&self, entry: &TimelineEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO lead_events (id, lead_id, event_type, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.id.to_string(),
                    entry.lead_id.to_string(),
                    entry.event_type.as_str(),
                    entry.metadata.to_string(),
                    ts(entry.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_lead_event"))?;
        Ok(())
    }

    async fn list_lead_events(&self, lead_id: Uuid) -> Result<Vec<TimelineEntry>, DatabaseError> {
        query_all(
            self.conn(),
            "list_lead_events",
            "SELECT id, lead_id, event_type, metadata, created_at FROM lead_events
             WHERE lead_id = ?1 ORDER BY created_at ASC, rowid ASC",
            params![lead_id.to_string()],
            row_to_event,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::leads::NewLead;
    use crate::messaging::NewMessage;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 14, 0, 0).unwrap()
    }

    fn make_lead(tenant_id: Uuid, email: Option<&str>, phone: Option<&str>) -> Lead {
        NewLead {
            tenant_id,
            full_name: "Pat Buyer".into(),
            email: email.map(String::from),
            phone: phone.map(String::from),
            source: Some("website".into()),
            lead_type: LeadType::Buyer,
            temperature: Temperature::Warm,
        }
        .into_lead(t0())
    }

    fn make_message(lead: &Lead, status: MessageStatus, scheduled_at: Option<DateTime<Utc>>) -> Message {
        NewMessage::outbound(lead.tenant_id, lead.id, Channel::Sms, "hello", status, scheduled_at)
            .into_message(t0())
    }

    // ── Tenants ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn settings_upsert_replaces_and_routes_inbound() {
        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let mut settings = TenantSettings::defaults_for(tenant);
        db.insert_tenant_settings(&settings).await.unwrap();

        settings.sms_number = Some("15550001111".into());
        settings.automations_enabled = false;
        // Plain insert keeps the first row.
        db.insert_tenant_settings(&settings).await.unwrap();
        assert!(db.get_tenant_settings(tenant).await.unwrap().unwrap().automations_enabled);

        db.upsert_tenant_settings(&settings).await.unwrap();
        assert_eq!(db.get_tenant_settings(tenant).await.unwrap(), Some(settings));
        assert_eq!(db.find_tenant_by_sms_number("15550001111").await.unwrap(), Some(tenant));
        assert!(db.find_tenant_by_reply_email("agent@example.com").await.unwrap().is_none());
    }

    // ── Leads ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn lead_insert_and_get() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), Some("pat@example.com"), Some("15551230003"));
        db.insert_lead(&lead).await.unwrap();

        let fetched = db.get_lead(lead.id).await.unwrap().expect("lead should exist");
        assert_eq!(fetched, lead);
    }

    #[tokio::test]
    async fn duplicate_lookup_uses_only_present_fields() {
        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let no_phone = make_lead(tenant, Some("pat@example.com"), None);
        db.insert_lead(&no_phone).await.unwrap();

        // Payload with a phone only must not match a lead whose phone is NULL.
        let found = db.find_duplicate_lead(tenant, None, Some("15550000000")).await.unwrap();
        assert!(found.is_none());

        let found = db
            .find_duplicate_lead(tenant, Some("pat@example.com"), Some("15550000000"))
            .await
            .unwrap();
        assert_eq!(found.map(|l| l.id), Some(no_phone.id));

        assert!(db.find_duplicate_lead(tenant, None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_lookup_is_tenant_scoped() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), Some("pat@example.com"), None);
        db.insert_lead(&lead).await.unwrap();

        let other_tenant = db
            .find_duplicate_lead(Uuid::new_v4(), Some("pat@example.com"), None)
            .await
            .unwrap();
        assert!(other_tenant.is_none());
    }

    #[tokio::test]
    async fn latest_lead_by_phone_prefers_newest_and_honors_tenant() {
        let db = test_db().await;
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let older = make_lead(tenant_a, None, Some("15551230003"));
        let mut newer = make_lead(tenant_b, None, Some("15551230003"));
        newer.created_at = t0() + Duration::hours(1);
        db.insert_lead(&older).await.unwrap();
        db.insert_lead(&newer).await.unwrap();

        let global = db.find_latest_lead_by_phone("15551230003", None).await.unwrap();
        assert_eq!(global.map(|l| l.id), Some(newer.id));

        let scoped = db
            .find_latest_lead_by_phone("15551230003", Some(tenant_a))
            .await
            .unwrap();
        assert_eq!(scoped.map(|l| l.id), Some(older.id));
    }

    // ── Messages ────────────────────────────────────────────────────

    #[tokio::test]
    async fn due_outbound_respects_schedule_and_order() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        db.insert_lead(&lead).await.unwrap();

        let immediate = make_message(&lead, MessageStatus::Pending, None);
        let later = make_message(&lead, MessageStatus::Scheduled, Some(t0() + Duration::hours(2)));
        let sent = make_message(&lead, MessageStatus::Sent, None);
        db.insert_message(&immediate).await.unwrap();
        db.insert_message(&later).await.unwrap();
        db.insert_message(&sent).await.unwrap();

        let due = db.list_due_outbound(t0(), 10, None).await.unwrap();
        assert_eq!(due.iter().map(|m| m.id).collect::<Vec<_>>(), vec![immediate.id]);

        let due = db
            .list_due_outbound(t0() + Duration::hours(2), 10, None)
            .await
            .unwrap();
        assert_eq!(due.iter().map(|m| m.id).collect::<Vec<_>>(), vec![immediate.id, later.id]);

        let filtered = db
            .list_due_outbound(t0() + Duration::hours(2), 10, Some(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        let msg = make_message(&lead, MessageStatus::Pending, None);
        db.insert_message(&msg).await.unwrap();

        assert!(db.claim_message(msg.id, 0, t0()).await.unwrap());
        // A second claimer that read the same row loses.
        assert!(!db.claim_message(msg.id, 0, t0()).await.unwrap());

        let fetched = db.get_message(msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.attempt_count, 1);
        assert_eq!(fetched.status, MessageStatus::Sending);
    }

    #[tokio::test]
    async fn claimed_rows_leave_the_due_list() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        let msg = make_message(&lead, MessageStatus::Pending, None);
        db.insert_message(&msg).await.unwrap();

        assert!(db.claim_message(msg.id, 0, t0()).await.unwrap());
        assert!(db.list_due_outbound(t0(), 10, None).await.unwrap().is_empty());
        // A reader that saw the row before the claim cannot claim it at its new count either.
        assert!(!db.claim_message(msg.id, 1, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn marks_require_a_claimed_row() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        let msg = make_message(&lead, MessageStatus::Pending, None);
        db.insert_message(&msg).await.unwrap();

        db.mark_message_sent(msg.id, Some("SM123"), t0()).await.unwrap();
        assert_eq!(
            db.get_message(msg.id).await.unwrap().unwrap().status,
            MessageStatus::Pending
        );
    }

    #[tokio::test]
    async fn stalled_sends_are_failed_after_cutoff() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        let old = make_message(&lead, MessageStatus::Pending, None);
        let fresh = make_message(&lead, MessageStatus::Pending, None);
        db.insert_message(&old).await.unwrap();
        db.insert_message(&fresh).await.unwrap();
        db.claim_message(old.id, 0, t0()).await.unwrap();
        db.claim_message(fresh.id, 0, t0() + Duration::minutes(20)).await.unwrap();

        let now = t0() + Duration::minutes(30);
        let changed = db
            .fail_stalled_sends(t0() + Duration::minutes(15), "send interrupted", now)
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let old = db.get_message(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, MessageStatus::Failed);
        assert_eq!(old.last_error.as_deref(), Some("send interrupted"));
        assert!(old.retry_at.is_none());
        assert_eq!(
            db.get_message(fresh.id).await.unwrap().unwrap().status,
            MessageStatus::Sending
        );
    }

    #[tokio::test]
    async fn sent_messages_are_immutable() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        let msg = make_message(&lead, MessageStatus::Pending, None);
        db.insert_message(&msg).await.unwrap();

        db.claim_message(msg.id, 0, t0()).await.unwrap();
        db.mark_message_sent(msg.id, Some("SM123"), t0()).await.unwrap();
        db.mark_message_failed(msg.id, "late failure", None, t0()).await.unwrap();

        let fetched = db.get_message(msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Sent);
        assert_eq!(fetched.provider_message_id.as_deref(), Some("SM123"));
        assert_eq!(fetched.sent_at, Some(t0()));
        assert!(fetched.last_error.is_none());
    }

    #[tokio::test]
    async fn step_messages_are_unique_per_enrollment_step() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        let enrollment_id = Uuid::new_v4();

        let first = NewMessage::outbound(lead.tenant_id, lead.id, Channel::Sms, "step 0", MessageStatus::Pending, None)
            .for_step(enrollment_id, 0)
            .into_message(t0());
        let again = NewMessage::outbound(lead.tenant_id, lead.id, Channel::Sms, "step 0", MessageStatus::Pending, None)
            .for_step(enrollment_id, 0)
            .into_message(t0());

        assert!(db.insert_message(&first).await.unwrap());
        assert!(!db.insert_message(&again).await.unwrap());
        assert_eq!(db.list_messages_for_lead(lead.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requeue_only_moves_failed_rows() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));
        let msg = make_message(&lead, MessageStatus::Pending, None);
        db.insert_message(&msg).await.unwrap();

        assert!(!db.requeue_message(msg.id, None, t0()).await.unwrap());

        db.claim_message(msg.id, 0, t0()).await.unwrap();
        db.mark_message_failed(msg.id, "boom", Some(t0()), t0()).await.unwrap();
        let failed = db.list_failed_messages(lead.tenant_id, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("boom"));

        let at = t0() + Duration::minutes(5);
        assert!(db.requeue_message(msg.id, Some(at), t0()).await.unwrap());
        let fetched = db.get_message(msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Scheduled);
        assert_eq!(fetched.scheduled_at, Some(at));
        assert!(fetched.retry_at.is_none());
    }

    #[tokio::test]
    async fn retryable_rows_are_selected_by_retry_time() {
        let db = test_db().await;
        let lead = make_lead(Uuid::new_v4(), None, Some("15551230003"));

        // Failed first but with a long backoff.
        let slow = make_message(&lead, MessageStatus::Pending, None);
        let due = make_message(&lead, MessageStatus::Pending, None);
        let exhausted = make_message(&lead, MessageStatus::Pending, None);
        for (msg, retry_at) in [
            (&slow, Some(t0() + Duration::hours(6))),
            (&due, Some(t0() + Duration::minutes(5))),
            (&exhausted, None),
        ] {
            db.insert_message(msg).await.unwrap();
            db.claim_message(msg.id, 0, t0()).await.unwrap();
            db.mark_message_failed(msg.id, "timeout", retry_at, t0()).await.unwrap();
        }

        let now = t0() + Duration::minutes(10);
        let picked = db.list_retryable_failed(now, 1).await.unwrap();
        assert_eq!(picked.iter().map(|m| m.id).collect::<Vec<_>>(), vec![due.id]);
        assert_eq!(picked[0].retry_at, Some(t0() + Duration::minutes(5)));

        let later = db
            .list_retryable_failed(t0() + Duration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(later.iter().map(|m| m.id).collect::<Vec<_>>(), vec![due.id, slow.id]);
    }

    // ── Sequences & enrollments ─────────────────────────────────────

    fn make_sequence(tenant_id: Uuid, lead_type: Option<LeadType>, temperature: Option<Temperature>) -> Sequence {
        let id = Uuid::new_v4();
        let step = |offset: i64| SequenceStep {
            id: Uuid::new_v4(),
            sequence_id: id,
            offset_minutes: offset,
            channel: Channel::Sms,
            subject_template: None,
            body_template: format!("offset {offset}"),
        };
        Sequence {
            id,
            tenant_id,
            name: "nurture".into(),
            lead_type,
            temperature,
            is_active: true,
            steps: vec![step(1440), step(0), step(4320)],
            created_at: t0(),
        }
    }

    #[tokio::test]
    async fn sequence_steps_come_back_sorted() {
        let db = test_db().await;
        let seq = make_sequence(Uuid::new_v4(), None, None);
        db.insert_sequence(&seq).await.unwrap();

        let fetched = db.get_sequence(seq.id).await.unwrap().unwrap();
        let offsets: Vec<i64> = fetched.steps.iter().map(|s| s.offset_minutes).collect();
        assert_eq!(offsets, vec![0, 1440, 4320]);
    }

    #[tokio::test]
    async fn matching_prefers_most_specific_sequence() {
        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let generic = make_sequence(tenant, None, None);
        let buyer = make_sequence(tenant, Some(LeadType::Buyer), None);
        let buyer_hot = make_sequence(tenant, Some(LeadType::Buyer), Some(Temperature::Hot));
        db.insert_sequence(&generic).await.unwrap();
        db.insert_sequence(&buyer).await.unwrap();
        db.insert_sequence(&buyer_hot).await.unwrap();

        let hot = db
            .find_matching_sequence(tenant, LeadType::Buyer, Temperature::Hot)
            .await
            .unwrap();
        assert_eq!(hot.map(|s| s.id), Some(buyer_hot.id));

        let warm = db
            .find_matching_sequence(tenant, LeadType::Buyer, Temperature::Warm)
            .await
            .unwrap();
        assert_eq!(warm.map(|s| s.id), Some(buyer.id));

        let seller = db
            .find_matching_sequence(tenant, LeadType::Seller, Temperature::Cold)
            .await
            .unwrap();
        assert_eq!(seller.map(|s| s.id), Some(generic.id));

        let other_tenant = db
            .find_matching_sequence(Uuid::new_v4(), LeadType::Buyer, Temperature::Hot)
            .await
            .unwrap();
        assert!(other_tenant.is_none());
    }

    fn make_enrollment(lead_id: Uuid, next_run_at: DateTime<Utc>) -> SequenceEnrollment {
        SequenceEnrollment {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            lead_id,
            sequence_id: Uuid::new_v4(),
            status: EnrollmentStatus::Active,
            current_step_index: 0,
            next_run_at: Some(next_run_at),
            stopped_reason: None,
            enrolled_at: t0(),
            updated_at: t0(),
        }
    }

    #[tokio::test]
    async fn second_active_enrollment_is_rejected() {
        let db = test_db().await;
        let lead_id = Uuid::new_v4();
        assert!(db.insert_enrollment(&make_enrollment(lead_id, t0())).await.unwrap());
        assert!(!db.insert_enrollment(&make_enrollment(lead_id, t0())).await.unwrap());
    }

    #[tokio::test]
    async fn advance_is_conditional_on_step_and_status() {
        let db = test_db().await;
        let enrollment = make_enrollment(Uuid::new_v4(), t0());
        db.insert_enrollment(&enrollment).await.unwrap();

        let next = t0() + Duration::days(1);
        assert!(db.advance_enrollment(enrollment.id, 0, 1, next, t0()).await.unwrap());
        assert!(!db.advance_enrollment(enrollment.id, 0, 1, next, t0()).await.unwrap());

        db.stop_enrollment(enrollment.id, StopReason::Manual, t0()).await.unwrap();
        assert!(!db.advance_enrollment(enrollment.id, 1, 2, next, t0()).await.unwrap());

        let fetched = db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, EnrollmentStatus::Stopped);
        assert_eq!(fetched.stopped_reason, Some(StopReason::Manual));
        assert!(fetched.next_run_at.is_none());
    }

    #[tokio::test]
    async fn due_enrollments_are_ordered_and_filtered() {
        let db = test_db().await;
        let late = make_enrollment(Uuid::new_v4(), t0() + Duration::minutes(10));
        let early = make_enrollment(Uuid::new_v4(), t0() - Duration::minutes(10));
        let future = make_enrollment(Uuid::new_v4(), t0() + Duration::days(1));
        for e in [&late, &early, &future] {
            db.insert_enrollment(e).await.unwrap();
        }

        let due = db
            .list_due_enrollments(t0() + Duration::minutes(10), 25)
            .await
            .unwrap();
        assert_eq!(due.iter().map(|e| e.id).collect::<Vec<_>>(), vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn stop_active_enrollments_is_idempotent() {
        let db = test_db().await;
        let enrollment = make_enrollment(Uuid::new_v4(), t0());
        db.insert_enrollment(&enrollment).await.unwrap();

        let first = db
            .stop_active_enrollments(enrollment.lead_id, StopReason::Reply, t0())
            .await
            .unwrap();
        let second = db
            .stop_active_enrollments(enrollment.lead_id, StopReason::Reply, t0())
            .await
            .unwrap();
        assert_eq!((first, second), (1, 0));
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("leadflow.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }
}
