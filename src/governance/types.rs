//! Reports, audit records and the enums that classify them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capabilities::{CapabilityId, CapabilityStatus};
use crate::error::{RegistryError, Result};

/// Implements `as_str`, `Display` and `FromStr` for a unit-only enum whose
/// wire form is its lower-case name.
macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = RegistryError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(RegistryError::Validation(format!(
                        "invalid {}: '{}' (expected one of: {})",
                        $label,
                        other,
                        [$($text),+].join(", ")
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Ethics,
    Harmful,
    Ineffective,
    Spam,
    Other,
}

string_enum!(ReportType, "report type", {
    Ethics => "ethics",
    Harmful => "harmful",
    Ineffective => "ineffective",
    Spam => "spam",
    Other => "other",
});

/// Report severity. Ordered from least to most serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(Severity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// `pending -> reviewing -> resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Reviewing,
    Resolved,
}

string_enum!(ReportStatus, "report status", {
    Pending => "pending",
    Reviewing => "reviewing",
    Resolved => "resolved",
});

/// Outcome of a ruling on a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Dismissed,
    Warning,
    Quarantine,
    Ban,
}

string_enum!(Resolution, "resolution", {
    Dismissed => "dismissed",
    Warning => "warning",
    Quarantine => "quarantine",
    Ban => "ban",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceActionType {
    Quarantine,
    Unquarantine,
    Ban,
    Warn,
    Promote,
    Demote,
}

string_enum!(GovernanceActionType, "action", {
    Quarantine => "quarantine",
    Unquarantine => "unquarantine",
    Ban => "ban",
    Warn => "warn",
    Promote => "promote",
    Demote => "demote",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceRole {
    Police,
    Judge,
    Executioner,
}

string_enum!(GovernanceRole, "role", {
    Police => "police",
    Judge => "judge",
    Executioner => "executioner",
});

/// A complaint filed against an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub target_id: CapabilityId,
    pub target_name: String,
    pub reported_by: String,
    pub report_type: ReportType,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub evidence: Value,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Client input for filing a report.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReport {
    pub target_name: String,
    pub report_type: ReportType,
    pub severity: Severity,
    pub description: String,
    pub evidence: Value,
}

/// Immutable audit record of a governance decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceAction {
    pub id: Uuid,
    pub target_id: CapabilityId,
    pub target_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<Uuid>,
    pub action_type: GovernanceActionType,
    pub role: GovernanceRole,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<CapabilityStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_reputation: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// The capability mutation that accompanies an audit record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateChange {
    None,
    Status(CapabilityStatus),
    Reputation(f64),
}

/// Read-only governance overview.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernanceStats {
    pub pending_reports: u64,
    pub reviewing_reports: u64,
    pub quarantined_count: u64,
    pub banned_count: u64,
    pub actions_last_24h: u64,
    pub actions_last_7d: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Police".parse::<GovernanceRole>().unwrap(), GovernanceRole::Police);
        assert_eq!(" CRITICAL ".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("spam".parse::<ReportType>().unwrap(), ReportType::Spam);
    }

    #[test]
    fn test_parse_error_lists_choices() {
        let err = "sheriff".parse::<GovernanceRole>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sheriff"));
        assert!(msg.contains("police, judge, executioner"));
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }
}
