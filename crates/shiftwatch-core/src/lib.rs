//! Core shift model shared by the extractor, the matcher and the scan pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "shiftwatch-core";

/// A mailbox message as handed over by a mail source, already decoded to text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, alias = "date")]
    pub received_date: String,
    /// `text/plain` when absent.
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl RawMessage {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.trim().to_ascii_lowercase().starts_with("text/html"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftField {
    Role,
    Date,
    TimeRange,
    Duration,
}

/// Which rule produced a field value, and the text it matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftEvidence {
    pub field: ShiftField,
    pub rule: String,
    pub snippet: String,
}

/// Structured shift facts pulled out of a notification.
///
/// Empty strings mean "not found". `duration_hours == 0.0` means the duration is
/// unknown, never a zero-length shift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ShiftRecord {
    pub role: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_hours: f64,
    #[serde(default)]
    pub evidence: Vec<ShiftEvidence>,
}

impl ShiftRecord {
    pub fn has_role(&self) -> bool {
        !self.role.is_empty()
    }

    pub fn has_duration(&self) -> bool {
        self.duration_hours > 0.0
    }

    pub fn evidence_for(&self, field: ShiftField) -> Option<&ShiftEvidence> {
        self.evidence.iter().find(|e| e.field == field)
    }
}

/// How a shift role is compared against an allowed role. Comparison is always
/// case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoleMatchPolicy {
    /// The shift role contains the allowed role.
    Contains,
    /// Either role contains the other.
    #[default]
    Bidirectional,
    /// The roles are equal.
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role match policy `{0}` (expected contains, bidirectional or exact)")]
pub struct UnknownRoleMatchPolicy(pub String);

impl FromStr for RoleMatchPolicy {
    type Err = UnknownRoleMatchPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contains" => Ok(Self::Contains),
            "bidirectional" => Ok(Self::Bidirectional),
            "exact" | "equals" => Ok(Self::Exact),
            _ => Err(UnknownRoleMatchPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for RoleMatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Contains => "contains",
            Self::Bidirectional => "bidirectional",
            Self::Exact => "exact",
        };
        f.write_str(name)
    }
}

/// Acceptance criteria for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaConfig {
    pub min_duration_hours: f64,
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub role_match: RoleMatchPolicy,
}

impl Default for CriteriaConfig {
    fn default() -> Self {
        Self {
            min_duration_hours: 8.0,
            allowed_roles: Vec::new(),
            role_match: RoleMatchPolicy::default(),
        }
    }
}

/// Outcome of matching one shift. `reasons` is in evaluation order: duration, then role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MatchDecision {
    pub matches: bool,
    pub reasons: Vec<String>,
}

impl MatchDecision {
    pub fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            matches: !reasons.is_empty(),
            reasons,
        }
    }

    /// Reasons joined for display.
    pub fn reason(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Everything the notification side needs about a qualifying message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftMatch {
    pub message_id: String,
    pub subject: String,
    pub received_date: String,
    pub shift: ShiftRecord,
    pub reason: String,
}
