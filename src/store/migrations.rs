//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS tenant_settings (
                tenant_id TEXT PRIMARY KEY,
                timezone TEXT NOT NULL DEFAULT 'America/New_York',
                quiet_hours_start TEXT NOT NULL DEFAULT '21:00',
                quiet_hours_end TEXT NOT NULL DEFAULT '08:00',
                booking_link TEXT,
                automations_enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                full_name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                source TEXT,
                lead_type TEXT NOT NULL DEFAULT 'buyer',
                temperature TEXT NOT NULL DEFAULT 'warm',
                stage TEXT NOT NULL DEFAULT 'new',
                sequence_status TEXT NOT NULL DEFAULT 'idle',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_tenant_email ON leads(tenant_id, email);
            CREATE INDEX IF NOT EXISTS idx_leads_tenant_phone ON leads(tenant_id, phone);
            CREATE INDEX IF NOT EXISTS idx_leads_phone ON leads(phone);
            CREATE INDEX IF NOT EXISTS idx_leads_email ON leads(email);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                direction TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_at TEXT,
                sent_at TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                provider_message_id TEXT,
                enrollment_id TEXT,
                step_index INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(direction, status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_messages_lead ON messages(lead_id);

            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                lead_type TEXT,
                temperature TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_tenant ON sequences(tenant_id);

            CREATE TABLE IF NOT EXISTS sequence_steps (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                offset_minutes INTEGER NOT NULL,
                channel TEXT NOT NULL,
                subject_template TEXT,
                body_template TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequence_steps_sequence ON sequence_steps(sequence_id);

            CREATE TABLE IF NOT EXISTS sequence_enrollments (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                current_step_index INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT,
                stopped_reason TEXT,
                enrolled_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_due ON sequence_enrollments(status, next_run_at);
            CREATE INDEX IF NOT EXISTS idx_enrollments_lead ON sequence_enrollments(lead_id);

            CREATE TABLE IF NOT EXISTS lead_events (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lead_events_lead ON lead_events(lead_id);
        "#,
    },
    Migration {
        version: 2,
        name: "automation_idempotency",
        sql: r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_enrollments_one_active
                ON sequence_enrollments(lead_id) WHERE status = 'active';
            CREATE UNIQUE INDEX IF NOT EXISTS uq_messages_enrollment_step
                ON messages(enrollment_id, step_index) WHERE enrollment_id IS NOT NULL;
        "#,
    },
    Migration {
        version: 3,
        name: "tenant_inbound_routing",
        sql: r#"
            ALTER TABLE tenant_settings ADD COLUMN sms_number TEXT;
            ALTER TABLE tenant_settings ADD COLUMN reply_email TEXT;
            CREATE INDEX IF NOT EXISTS idx_tenant_settings_sms ON tenant_settings(sms_number);
            CREATE INDEX IF NOT EXISTS idx_tenant_settings_reply ON tenant_settings(reply_email);
        "#,
    },
    Migration {
        version: 4,
        name: "message_retry_schedule",
        sql: r#"
            ALTER TABLE messages ADD COLUMN retry_at TEXT;
            CREATE INDEX IF NOT EXISTS idx_messages_retry ON messages(status, retry_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
