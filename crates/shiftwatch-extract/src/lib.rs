//! Shift extraction rules + the inbox snapshot mail source.
//!
//! Each field is resolved by an ordered chain of independent rules; the first rule
//! that yields a value wins. Patterns are compiled once and shared read-only, so an
//! [`Extractor`] can be used from any number of threads.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveTime;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use shiftwatch_core::{RawMessage, ShiftEvidence, ShiftField, ShiftRecord};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftwatch-extract";

/// Role labels recognised verbatim (case-sensitive) anywhere in subject or body.
pub const DEFAULT_KNOWN_ROLES: &[&str] = &["LG: ALL", "LG: North", "Deck Coordinator"];

/// Labels tried in order by the labeled-field role rule.
const ROLE_LABELS: &[&str] = &["Role", "Position", "Area", "Shift"];

/// Accepted time-of-day layouts, applied to a token with whitespace removed and
/// letters upper-cased (so `9:00 pm`, `9:00PM` and `9:00 PM` all take the first layout).
const TIME_FORMATS: &[&str] = &["%I:%M%p", "%H:%M"];

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

const MONTHS: &str =
    "January|February|March|April|May|June|July|August|September|October|November|December";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("message {message_id} has neither a role nor a duration")]
    NoShiftDetails { message_id: String },
}

struct PatternRule {
    name: &'static str,
    regex: Regex,
}

impl PatternRule {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("valid extraction pattern"),
        }
    }
}

static LABELED_ROLE_RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    ROLE_LABELS
        .iter()
        .map(|label| {
            PatternRule::new(
                label_rule_name(label),
                &format!(r"(?i)\b{label}:[ \t]*(?:\r?\n[ \t]*)?([A-Za-z][^\-\n,]*)"),
            )
        })
        .collect()
});

static DATE_RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    vec![
        PatternRule::new("numeric_date", r"\b\d{1,2}/\d{1,2}/\d{4}\b"),
        PatternRule::new("iso_date", r"\b\d{4}-\d{2}-\d{2}\b"),
        PatternRule::new(
            "weekday_day_month",
            &format!(
                r"(?i)\b(?:Mon|Tues|Wednes|Thurs|Fri|Satur|Sun)day,?\s+\d{{1,2}}(?:st|nd|rd|th)?\s+(?:{MONTHS})(?:\s+\d{{4}})?\b"
            ),
        ),
        PatternRule::new(
            "month_day_year",
            &format!(r"(?i)\b(?:{MONTHS})\s+\d{{1,2}}(?:st|nd|rd|th)?,?\s+\d{{4}}\b"),
        ),
    ]
});

static TIME_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,2}:\d{2}(?:\s*[ap]m\b)?)\s*(?:-|–|—|to)\s*(\d{1,2}:\d{2}(?:\s*[ap]m\b)?)")
        .expect("valid time range pattern")
});

static EXPLICIT_HOURS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:hours?|hrs?|h)\b").expect("valid duration pattern")
});

fn label_rule_name(label: &str) -> &'static str {
    match label {
        "Role" => "role_label",
        "Position" => "position_label",
        "Area" => "area_label",
        _ => "shift_label",
    }
}

/// A value produced by one rule, with the text it was taken from.
#[derive(Debug, Clone, PartialEq)]
struct RuleHit<T> {
    rule: &'static str,
    value: T,
    snippet: String,
}

impl<T> RuleHit<T> {
    fn evidence(&self, field: ShiftField) -> ShiftEvidence {
        ShiftEvidence {
            field,
            rule: self.rule.to_string(),
            snippet: self.snippet.clone(),
        }
    }
}

/// Turns notification text into a [`ShiftRecord`]. Never fails: a field that no rule
/// recovers stays empty (or `0.0` for the duration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extractor {
    known_roles: Vec<String>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::with_known_roles(DEFAULT_KNOWN_ROLES.iter().copied())
    }
}

impl Extractor {
    pub fn with_known_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_roles: roles
                .into_iter()
                .map(Into::<String>::into)
                .filter(|role| !role.trim().is_empty())
                .collect(),
        }
    }

    pub fn known_roles(&self) -> &[String] {
        &self.known_roles
    }

    pub fn extract(&self, subject: &str, body: &str) -> ShiftRecord {
        let mut record = ShiftRecord::default();

        if let Some(hit) = self.role(subject, body) {
            record.evidence.push(hit.evidence(ShiftField::Role));
            record.role = hit.value;
        }

        if let Some(hit) = date(body) {
            record.evidence.push(hit.evidence(ShiftField::Date));
            record.date = hit.value;
        }

        if let Some(hit) = time_range(body) {
            record.evidence.push(hit.evidence(ShiftField::TimeRange));
            (record.start_time, record.end_time) = hit.value;
        }

        let duration = duration_from_time_range(&record.start_time, &record.end_time)
            .or_else(|| duration_from_phrase(body));
        if let Some(hit) = duration {
            record.evidence.push(hit.evidence(ShiftField::Duration));
            record.duration_hours = hit.value;
        }

        record
    }

    /// Extracts from a message, flattening HTML bodies first, and classifies a
    /// record with neither role nor duration as [`ExtractError::NoShiftDetails`].
    pub fn parse_message(&self, message: &RawMessage) -> Result<ShiftRecord, ExtractError> {
        let body = message_text(message);
        let record = self.extract(&message.subject, &body);
        if !record.has_role() && !record.has_duration() {
            debug!(message_id = %message.id, "no role or duration extracted");
            return Err(ExtractError::NoShiftDetails {
                message_id: message.id.clone(),
            });
        }
        Ok(record)
    }

    fn role(&self, subject: &str, body: &str) -> Option<RuleHit<String>> {
        self.known_role(subject, body)
            .or_else(|| labeled_role(subject, body))
    }

    fn known_role(&self, subject: &str, body: &str) -> Option<RuleHit<String>> {
        let haystack = format!("{subject} {body}");
        self.known_roles
            .iter()
            .find(|role| haystack.contains(role.as_str()))
            .map(|role| RuleHit {
                rule: "known_role",
                value: role.clone(),
                snippet: role.clone(),
            })
    }
}

/// Extracts with the built-in known-role list.
pub fn extract(subject: &str, body: &str) -> ShiftRecord {
    Extractor::default().extract(subject, body)
}

/// Convenience entry point for batch processing; see [`Extractor::parse_message`].
pub fn parse_shift(message: &RawMessage) -> Result<ShiftRecord, ExtractError> {
    Extractor::default().parse_message(message)
}

fn labeled_role(subject: &str, body: &str) -> Option<RuleHit<String>> {
    LABELED_ROLE_RULES.iter().find_map(|rule| {
        [body, subject].into_iter().find_map(|text| {
            let caps = rule.regex.captures(text)?;
            let value = caps.get(1)?.as_str().trim();
            if value.is_empty() {
                return None;
            }
            Some(RuleHit {
                rule: rule.name,
                value: value.to_string(),
                snippet: caps[0].trim().to_string(),
            })
        })
    })
}

fn date(body: &str) -> Option<RuleHit<String>> {
    DATE_RULES.iter().find_map(|rule| {
        rule.regex.find(body).map(|m| RuleHit {
            rule: rule.name,
            value: m.as_str().to_string(),
            snippet: m.as_str().to_string(),
        })
    })
}

fn time_range(body: &str) -> Option<RuleHit<(String, String)>> {
    let caps = TIME_RANGE.captures(body)?;
    Some(RuleHit {
        rule: "time_range",
        value: (caps[1].trim().to_string(), caps[2].trim().to_string()),
        snippet: caps[0].to_string(),
    })
}

fn duration_from_time_range(start: &str, end: &str) -> Option<RuleHit<f64>> {
    if start.is_empty() || end.is_empty() {
        return None;
    }
    let hours = shift_duration_hours(start, end)?;
    Some(RuleHit {
        rule: "time_range",
        value: hours,
        snippet: format!("{start} - {end}"),
    })
}

fn duration_from_phrase(body: &str) -> Option<RuleHit<f64>> {
    let caps = EXPLICIT_HOURS.captures(body)?;
    let hours = caps[1]
        .parse::<f64>()
        .ok()
        .filter(|h| h.is_finite() && *h > 0.0)?;
    Some(RuleHit {
        rule: "explicit_hours",
        value: hours,
        snippet: caps[0].to_string(),
    })
}

/// Parses a time-of-day token such as `9:00 AM`, `9:00pm` or `17:30`.
pub fn parse_time_of_day(token: &str) -> Option<NaiveTime> {
    let normalized = token
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    TIME_FORMATS
        .iter()
        .find_map(|layout| NaiveTime::parse_from_str(&normalized, layout).ok())
}

/// Hours between two time-of-day tokens. An end at or before the start is taken
/// to fall on the next day.
pub fn shift_duration_hours(start: &str, end: &str) -> Option<f64> {
    let start = parse_time_of_day(start)?;
    let end = parse_time_of_day(end)?;
    let mut seconds = end.signed_duration_since(start).num_seconds();
    if seconds <= 0 {
        seconds += SECONDS_PER_DAY;
    }
    Some(seconds as f64 / 3600.0)
}

/// Reduces an HTML body to its text nodes, one per line. A node ending in `:` is
/// joined to the next one with a space so `<b>Role:</b> Server` stays on one line.
pub fn flatten_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    for piece in document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        if !out.is_empty() {
            out.push(if out.ends_with(':') { ' ' } else { '\n' });
        }
        out.push_str(piece);
    }
    out
}

/// The body as plain text.
pub fn message_text(message: &RawMessage) -> Cow<'_, str> {
    if message.is_html() {
        Cow::Owned(flatten_html(&message.body))
    } else {
        Cow::Borrowed(message.body.as_str())
    }
}

/// Stable id for a message that arrived without one.
pub fn deterministic_message_id(message: &RawMessage) -> String {
    let source = format!(
        "{}\n{}\n{}",
        message.subject, message.received_date, message.body
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes()).to_string()
}

/// Read side of the mailbox: yields decoded messages carrying a label.
#[async_trait]
pub trait MailSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_messages(&self, label: &str, max_messages: usize) -> Result<Vec<RawMessage>>;
}

/// A mailbox exported to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxSnapshot {
    #[serde(default)]
    pub account: Option<String>,
    pub messages: Vec<RawMessage>,
}

pub fn load_inbox_snapshot(path: impl AsRef<Path>) -> Result<InboxSnapshot> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_inbox_snapshot(&data, path)
}

fn parse_inbox_snapshot(data: &str, path: &Path) -> Result<InboxSnapshot> {
    serde_json::from_str(data).with_context(|| format!("parsing {}", path.display()))
}

/// Keeps messages carrying `label` (unlabeled messages are kept), caps the batch at
/// `max_messages` and fills in missing ids.
pub fn select_messages(messages: Vec<RawMessage>, label: &str, max_messages: usize) -> Vec<RawMessage> {
    messages
        .into_iter()
        .filter(|m| {
            label.is_empty()
                || m.labels.is_empty()
                || m.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
        })
        .take(max_messages)
        .map(|mut m| {
            if m.id.trim().is_empty() {
                m.id = deterministic_message_id(&m);
            }
            m
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct InboxSnapshotSource {
    path: PathBuf,
}

impl InboxSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MailSource for InboxSnapshotSource {
    fn source_id(&self) -> &str {
        "inbox-snapshot"
    }

    async fn fetch_messages(&self, label: &str, max_messages: usize) -> Result<Vec<RawMessage>> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let snapshot = parse_inbox_snapshot(&data, &self.path)?;
        Ok(select_messages(snapshot.messages, label, max_messages))
    }
}
