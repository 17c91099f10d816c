//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::messaging::retry::RetryPolicy;

/// Runtime configuration for the automation core.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port for the HTTP adapter.
    pub http_port: u16,
    /// How often the outbound dispatcher sweeps pending messages.
    pub dispatch_interval: Duration,
    /// How often due sequence enrollments are advanced.
    pub sequence_interval: Duration,
    /// Maximum messages attempted per dispatcher tick.
    pub dispatch_batch: usize,
    /// Maximum enrollments advanced per sequence tick.
    pub enrollment_batch: usize,
    /// Re-queue policy for failed outbound messages.
    pub retry: RetryPolicy,
    /// Upper bound on one provider call (HTTP request or SMTP command).
    pub send_timeout: Duration,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/leadflow.db"),
            http_port: 8080,
            dispatch_interval: Duration::from_secs(5),
            sequence_interval: Duration::from_secs(10),
            dispatch_batch: 50,
            enrollment_batch: 25,
            retry: RetryPolicy::disabled(),
            send_timeout: Duration::from_secs(15),
        }
    }
}

impl AutomationConfig {
    /// Build config from `LEADFLOW_*` environment variables. Unset variables
    /// take their defaults; set but unparseable or zero values are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("LEADFLOW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let max_attempts: u32 = env_parse("LEADFLOW_RETRY_MAX_ATTEMPTS")?.unwrap_or(1);
        let backoff_secs: u64 = env_parse("LEADFLOW_RETRY_BACKOFF_SECS")?.unwrap_or(300);

        Ok(Self {
            db_path,
            http_port: env_parse("LEADFLOW_HTTP_PORT")?.unwrap_or(defaults.http_port),
            dispatch_interval: env_secs("LEADFLOW_DISPATCH_INTERVAL_SECS")?
                .unwrap_or(defaults.dispatch_interval),
            sequence_interval: env_secs("LEADFLOW_SEQUENCE_INTERVAL_SECS")?
                .unwrap_or(defaults.sequence_interval),
            dispatch_batch: env_nonzero("LEADFLOW_DISPATCH_BATCH")?.unwrap_or(defaults.dispatch_batch),
            enrollment_batch: env_nonzero("LEADFLOW_ENROLLMENT_BATCH")?
                .unwrap_or(defaults.enrollment_batch),
            retry: RetryPolicy::new(max_attempts, Duration::from_secs(backoff_secs)),
            send_timeout: env_secs("LEADFLOW_SEND_TIMEOUT_SECS")?.unwrap_or(defaults.send_timeout),
        })
    }
}

/// Twilio credentials for the SMS sender.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
}

impl TwilioConfig {
    /// Returns `None` unless all three Twilio variables are set.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            account_sid: non_empty_env("TWILIO_ACCOUNT_SID")?,
            auth_token: SecretString::from(non_empty_env("TWILIO_AUTH_TOKEN")?),
            from_number: non_empty_env("TWILIO_FROM_NUMBER")?,
        })
    }
}

/// SendGrid credentials for the HTTP email sender.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: SecretString,
    pub from_address: String,
}

impl SendGridConfig {
    /// Returns `None` if `SENDGRID_API_KEY` or `EMAIL_FROM_ADDRESS` is missing.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: SecretString::from(non_empty_env("SENDGRID_API_KEY")?),
            from_address: non_empty_env("EMAIL_FROM_ADDRESS")?,
        })
    }
}

/// SMTP relay settings for the lettre-backed email sender.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let host = non_empty_env("EMAIL_SMTP_HOST")?;
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port: env_parse("EMAIL_SMTP_PORT").ok().flatten().unwrap_or(587),
            username,
            password: SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default()),
            from_address,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match non_empty_env(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
    }
}

fn env_nonzero(key: &str) -> Result<Option<usize>, ConfigError> {
    match env_parse::<usize>(key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        }),
        other => Ok(other),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_nonzero(key)?.map(|secs| Duration::from_secs(secs as u64)))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
