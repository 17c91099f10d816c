//! Lead data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the lead is looking to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadType {
    #[default]
    Buyer,
    Seller,
    Investor,
    Renter,
}

impl LeadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadType::Buyer => "buyer",
            LeadType::Seller => "seller",
            LeadType::Investor => "investor",
            LeadType::Renter => "renter",
        }
    }
}

impl FromStr for LeadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buyer" => Ok(LeadType::Buyer),
            "seller" => Ok(LeadType::Seller),
            "investor" => Ok(LeadType::Investor),
            "renter" => Ok(LeadType::Renter),
            other => Err(format!("unknown lead type: {other}")),
        }
    }
}

impl fmt::Display for LeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How ready the lead is to transact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    Hot,
    #[default]
    Warm,
    Cold,
}

impl Temperature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Temperature::Hot => "hot",
            Temperature::Warm => "warm",
            Temperature::Cold => "cold",
        }
    }
}

impl FromStr for Temperature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hot" => Ok(Temperature::Hot),
            "warm" => Ok(Temperature::Warm),
            "cold" => Ok(Temperature::Cold),
            other => Err(format!("unknown temperature: {other}")),
        }
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a follow-up sequence is running for the lead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    #[default]
    Idle,
    Active,
    Stopped,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Idle => "idle",
            SequenceStatus::Active => "active",
            SequenceStatus::Stopped => "stopped",
        }
    }

    /// Lenient parse for DB values; unknown strings read as idle.
    pub fn from_db(s: &str) -> Self {
        match s {
            "active" => SequenceStatus::Active,
            "stopped" => SequenceStatus::Stopped,
            _ => SequenceStatus::Idle,
        }
    }
}

/// A persisted lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub full_name: String,
    /// Normalized: lowercase, no display-name wrapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Normalized: digits only, leading country code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub lead_type: LeadType,
    pub temperature: Temperature,
    /// Pipeline stage (free-form; `new` on intake).
    pub stage: String,
    pub sequence_status: SequenceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Name used when greeting the lead in templates.
    pub fn display_name(&self) -> &str {
        let name = self.full_name.trim();
        if name.is_empty() { "there" } else { name }
    }
}

/// Fields for a lead that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewLead {
    pub tenant_id: Uuid,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub lead_type: LeadType,
    pub temperature: Temperature,
}

impl NewLead {
    /// Materialize into a lead with a fresh id, stage `new`, and idle sequence status.
    pub fn into_lead(self, now: DateTime<Utc>) -> Lead {
        Lead {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            full_name: self.full_name,
            email: self.email,
            phone: self.phone,
            source: self.source,
            lead_type: self.lead_type,
            temperature: self.temperature,
            stage: "new".to_string(),
            sequence_status: SequenceStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }
}
