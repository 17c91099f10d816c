//! Follow-up sequence data model.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::leads::{LeadType, Temperature};
use crate::messaging::Channel;

/// A tenant-scoped follow-up template.
///
/// `lead_type` / `temperature` of `None` match any lead; when several
/// sequences match, the most specific one wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub lead_type: Option<LeadType>,
    pub temperature: Option<Temperature>,
    pub is_active: bool,
    /// Always sorted by `offset_minutes` after loading.
    pub steps: Vec<SequenceStep>,
    pub created_at: DateTime<Utc>,
}

impl Sequence {
    /// Sort steps by offset. Storage order is never trusted.
    pub fn sort_steps(&mut self) {
        self.steps.sort_by_key(|s| s.offset_minutes);
    }
}

/// One timed step. `offset_minutes` is measured from enrollment time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub offset_minutes: i64,
    pub channel: Channel,
    /// Email subject template; ignored for SMS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_template: Option<String>,
    pub body_template: String,
}

impl SequenceStep {
    /// When this step is due for an enrollment made at `enrolled_at`.
    pub fn due_at(&self, enrolled_at: DateTime<Utc>) -> DateTime<Utc> {
        enrolled_at + Duration::minutes(self.offset_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Stopped,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Stopped => "stopped",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "completed" => EnrollmentStatus::Completed,
            "stopped" => EnrollmentStatus::Stopped,
            _ => EnrollmentStatus::Active,
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an enrollment was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Reply,
    Manual,
    Other,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Reply => "reply",
            StopReason::Manual => "manual",
            StopReason::Other => "other",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "reply" => StopReason::Reply,
            "manual" => StopReason::Manual,
            _ => StopReason::Other,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding of one lead to one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceEnrollment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    pub sequence_id: Uuid,
    pub status: EnrollmentStatus,
    /// 0-based index of the next step to run.
    pub current_step_index: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<StopReason>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn step(offset: i64) -> SequenceStep {
        SequenceStep {
            id: Uuid::new_v4(),
            sequence_id: Uuid::nil(),
            offset_minutes: offset,
            channel: Channel::Sms,
            subject_template: None,
            body_template: format!("step at {offset}"),
        }
    }

    #[test]
    fn sort_steps_orders_by_offset() {
        let mut seq = Sequence {
            id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            name: "Buyer nurture".into(),
            lead_type: None,
            temperature: None,
            is_active: true,
            steps: vec![step(4320), step(0), step(1440)],
            created_at: Utc::now(),
        };
        seq.sort_steps();
        let offsets: Vec<i64> = seq.steps.iter().map(|s| s.offset_minutes).collect();
        assert_eq!(offsets, vec![0, 1440, 4320]);
    }

    #[test]
    fn due_at_is_relative_to_enrollment() {
        let enrolled = Utc.with_ymd_and_hms(2026, 2, 1, 15, 0, 0).unwrap();
        assert_eq!(step(1440).due_at(enrolled), enrolled + Duration::days(1));
    }
}
