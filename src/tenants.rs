//! Per-tenant automation settings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;
use crate::time_window;

pub const DEFAULT_TIMEZONE: &str = "America/New_York";
pub const DEFAULT_QUIET_HOURS_START: &str = "21:00";
pub const DEFAULT_QUIET_HOURS_END: &str = "08:00";

/// Settings the automation core reads for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub tenant_id: Uuid,
    /// IANA timezone name.
    pub timezone: String,
    /// Local `HH:MM`.
    pub quiet_hours_start: String,
    /// Local `HH:MM`.
    pub quiet_hours_end: String,
    pub booking_link: Option<String>,
    pub automations_enabled: bool,
    /// Tenant's outbound SMS number (normalized); used to scope inbound replies.
    pub sms_number: Option<String>,
    /// Tenant's reply-to address (normalized); used to scope inbound replies.
    pub reply_email: Option<String>,
}

impl TenantSettings {
    pub fn defaults_for(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            timezone: DEFAULT_TIMEZONE.to_string(),
            quiet_hours_start: DEFAULT_QUIET_HOURS_START.to_string(),
            quiet_hours_end: DEFAULT_QUIET_HOURS_END.to_string(),
            booking_link: None,
            automations_enabled: true,
            sms_number: None,
            reply_email: None,
        }
    }

    pub fn booking_link(&self) -> &str {
        self.booking_link.as_deref().unwrap_or("")
    }

    /// Whether `now` falls inside this tenant's quiet hours.
    pub fn is_quiet_at(&self, now: DateTime<Utc>) -> bool {
        time_window::is_within_quiet_hours(
            now,
            &self.timezone,
            &self.quiet_hours_start,
            &self.quiet_hours_end,
        )
    }

    /// Earliest instant at or after `now` outside quiet hours.
    pub fn next_send_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        time_window::next_allowed_send_time(
            now,
            &self.timezone,
            &self.quiet_hours_start,
            &self.quiet_hours_end,
        )
    }
}

/// Read access to tenant settings. Implementations create defaults on first access.
#[async_trait]
pub trait TenantSettingsProvider: Send + Sync {
    async fn get(&self, tenant_id: Uuid) -> Result<TenantSettings, DatabaseError>;
}

/// Settings provider backed by the `tenant_settings` table.
pub struct StoreTenantSettings {
    store: Arc<dyn Database>,
}

impl StoreTenantSettings {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TenantSettingsProvider for StoreTenantSettings {
    async fn get(&self, tenant_id: Uuid) -> Result<TenantSettings, DatabaseError> {
        if let Some(settings) = self.store.get_tenant_settings(tenant_id).await? {
            return Ok(settings);
        }
        let defaults = TenantSettings::defaults_for(tenant_id);
        // Another caller may have raced us; the insert ignores conflicts and
        // we re-read whatever won.
        self.store.insert_tenant_settings(&defaults).await?;
        tracing::debug!(tenant_id = %tenant_id, "Created default tenant settings");
        Ok(self
            .store
            .get_tenant_settings(tenant_id)
            .await?
            .unwrap_or(defaults))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn creates_defaults_lazily() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tenant = Uuid::new_v4();
        assert!(db.get_tenant_settings(tenant).await.unwrap().is_none());

        let provider = StoreTenantSettings::new(Arc::clone(&db));
        let settings = provider.get(tenant).await.unwrap();
        assert_eq!(settings.timezone, "America/New_York");
        assert_eq!(settings.quiet_hours_start, "21:00");
        assert_eq!(settings.quiet_hours_end, "08:00");
        assert!(settings.automations_enabled);

        assert!(db.get_tenant_settings(tenant).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn existing_settings_are_returned_untouched() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let tenant = Uuid::new_v4();
        let mut custom = TenantSettings::defaults_for(tenant);
        custom.timezone = "America/Chicago".into();
        custom.booking_link = Some("https://cal.example/agent".into());
        db.insert_tenant_settings(&custom).await.unwrap();

        let settings = StoreTenantSettings::new(db).get(tenant).await.unwrap();
        assert_eq!(settings, custom);
    }
}
