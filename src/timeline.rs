//! Lead timeline: an append-only log of what automation did to a lead.
//!
//! Logging is best-effort everywhere in the core: a failed write is reported
//! at `warn` and otherwise ignored.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::store::Database;

/// Kinds of timeline entries written by the automation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEvent {
    Created,
    Deduped,
    MessageQueued,
    MessageSent,
    MessageFailed,
    MessageSkipped,
    SequenceStarted,
    SequenceStepQueued,
    SequenceCompleted,
    SequenceStopped,
    LeadReplied,
}

impl TimelineEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineEvent::Created => "created",
            TimelineEvent::Deduped => "deduped",
            TimelineEvent::MessageQueued => "message_queued",
            TimelineEvent::MessageSent => "message_sent",
            TimelineEvent::MessageFailed => "message_failed",
            TimelineEvent::MessageSkipped => "message_skipped",
            TimelineEvent::SequenceStarted => "sequence_started",
            TimelineEvent::SequenceStepQueued => "sequence_step_queued",
            TimelineEvent::SequenceCompleted => "sequence_completed",
            TimelineEvent::SequenceStopped => "sequence_stopped",
            TimelineEvent::LeadReplied => "lead_replied",
        }
    }
}

impl fmt::Display for TimelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub event_type: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TimelineLogger: Send + Sync {
    async fn record(
        &self,
        lead_id: Uuid,
        event: TimelineEvent,
        metadata: serde_json::Value,
    ) -> Result<(), DatabaseError>;
}

/// Record an event, swallowing failures. Returns whether the write landed.
pub async fn record_best_effort(
    logger: &dyn TimelineLogger,
    lead_id: Uuid,
    event: TimelineEvent,
    metadata: serde_json::Value,
) -> bool {
    match logger.record(lead_id, event, metadata).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(lead_id = %lead_id, event = %event, "Failed to record timeline event: {e}");
            false
        }
    }
}

/// Timeline backed by the `lead_events` table.
pub struct StoreTimeline {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl StoreTimeline {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl TimelineLogger for StoreTimeline {
    async fn record(
        &self,
        lead_id: Uuid,
        event: TimelineEvent,
        metadata: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let entry = TimelineEntry {
            id: Uuid::new_v4(),
            lead_id,
            event_type: event.as_str().to_string(),
            metadata,
            created_at: self.clock.now(),
        };
        self.store.insert_lead_event(&entry).await
    }
}
