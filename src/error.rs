//! Error types for leadflow.

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound channel errors.
///
/// The `Display` form is what lands in a message's `last_error` column.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} is not configured")]
    NotConfigured { name: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Errors surfaced by lead intake. Everything after persistence is best-effort
/// and reported through outcomes instead.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Unknown tenant: {0}")]
    UnknownTenant(Uuid),

    #[error("Invalid lead payload: {0}")]
    InvalidPayload(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
