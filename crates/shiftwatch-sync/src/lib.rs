//! Criteria matching, configuration and scan pipeline orchestration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shiftwatch_core::{CriteriaConfig, MatchDecision, RawMessage, RoleMatchPolicy, ShiftMatch, ShiftRecord};
use shiftwatch_extract::{
    ExtractError, Extractor, InboxSnapshotSource, MailSource, DEFAULT_KNOWN_ROLES,
};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shiftwatch-sync";

const BANNER_WIDTH: usize = 60;
const SUBJECT_PREVIEW_CHARS: usize = 50;

/// Decides whether a shift qualifies. Criteria are OR-ed: a qualifying duration or
/// an allowed role is enough on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaMatcher {
    criteria: CriteriaConfig,
}

impl CriteriaMatcher {
    pub fn new(criteria: CriteriaConfig) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &CriteriaConfig {
        &self.criteria
    }

    pub fn decide(&self, shift: &ShiftRecord) -> MatchDecision {
        let reasons = [self.duration_reason(shift), self.role_reason(shift)]
            .into_iter()
            .flatten()
            .collect();
        MatchDecision::from_reasons(reasons)
    }

    fn duration_reason(&self, shift: &ShiftRecord) -> Option<String> {
        // 0.0 is "unknown" and never qualifies, even against a 0h threshold.
        if !shift.has_duration() || shift.duration_hours < self.criteria.min_duration_hours {
            return None;
        }
        Some(format!(
            "Duration: {}h (target: >={}h)",
            format_hours(shift.duration_hours),
            format_hours(self.criteria.min_duration_hours)
        ))
    }

    fn role_reason(&self, shift: &ShiftRecord) -> Option<String> {
        if !shift.has_role() {
            return None;
        }
        self.criteria
            .allowed_roles
            .iter()
            .find(|allowed| role_matches(self.criteria.role_match, &shift.role, allowed))
            .map(|allowed| format!("Role: {} (matches: {})", shift.role, allowed))
    }
}

/// Case-insensitive role comparison under `policy`. Blank roles never match.
pub fn role_matches(policy: RoleMatchPolicy, role: &str, allowed: &str) -> bool {
    let role = role.trim().to_lowercase();
    let allowed = allowed.trim().to_lowercase();
    if role.is_empty() || allowed.is_empty() {
        return false;
    }
    match policy {
        RoleMatchPolicy::Contains => role.contains(&allowed),
        RoleMatchPolicy::Bidirectional => role.contains(&allowed) || allowed.contains(&role),
        RoleMatchPolicy::Exact => role == allowed,
    }
}

/// Shortest exact rendering of an hour count; whole numbers keep one decimal (`8.0`).
pub fn format_hours(hours: f64) -> String {
    if hours.is_finite() && hours.fract() == 0.0 {
        format!("{hours:.1}")
    } else {
        hours.to_string()
    }
}

pub fn decide(shift: &ShiftRecord, criteria: &CriteriaConfig) -> MatchDecision {
    CriteriaMatcher::new(criteria.clone()).decide(shift)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMethod {
    #[default]
    Console,
    Log,
}

impl FromStr for NotificationMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "log" => Ok(Self::Log),
            _ => Err(ConfigError::InvalidEnv {
                var: "SHIFTWATCH_NOTIFY",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {var}: `{value}`")]
    InvalidEnv { var: &'static str, value: String },
    #[error("target_shift_duration_hours must be a non-negative number, got {0}")]
    InvalidDuration(f64),
    #[error("max_messages must be at least 1")]
    ZeroMaxMessages,
}

/// Run configuration: defaults, then an optional YAML/JSON file, then `SHIFTWATCH_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    #[serde(rename = "target_shift_duration_hours")]
    pub min_duration_hours: f64,
    #[serde(rename = "target_shift_roles")]
    pub allowed_roles: Vec<String>,
    pub role_match: RoleMatchPolicy,
    pub known_roles: Vec<String>,
    #[serde(rename = "gmail_label", alias = "label")]
    pub label: String,
    pub max_messages: usize,
    pub notification_method: NotificationMethod,
    pub inbox_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub scan_cron: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            min_duration_hours: 8.0,
            allowed_roles: Vec::new(),
            role_match: RoleMatchPolicy::default(),
            known_roles: DEFAULT_KNOWN_ROLES.iter().map(ToString::to_string).collect(),
            label: "Deputy".to_string(),
            max_messages: 50,
            notification_method: NotificationMethod::default(),
            inbox_path: PathBuf::from("./inbox.json"),
            reports_dir: None,
            scheduler_enabled: false,
            scan_cron: "0 */15 * * * *".to_string(),
        }
    }
}

impl WatchConfig {
    pub const DEFAULT_FILE: &'static str = "shiftwatch.yaml";

    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Like [`WatchConfig::from_env`] with an injectable variable lookup.
    pub fn load_with<F>(config_path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = config_path
            .map(Path::to_path_buf)
            .or_else(|| lookup("SHIFTWATCH_CONFIG").map(PathBuf::from));
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(Self::DEFAULT_FILE).exists() => {
                Self::from_file(Path::new(Self::DEFAULT_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SHIFTWATCH_MIN_DURATION_HOURS") {
            self.min_duration_hours = parse_env("SHIFTWATCH_MIN_DURATION_HOURS", &v)?;
        }
        if let Some(v) = lookup("SHIFTWATCH_ALLOWED_ROLES") {
            self.allowed_roles = split_list(&v);
        }
        if let Some(v) = lookup("SHIFTWATCH_ROLE_MATCH") {
            self.role_match = parse_env("SHIFTWATCH_ROLE_MATCH", &v)?;
        }
        if let Some(v) = lookup("SHIFTWATCH_KNOWN_ROLES") {
            self.known_roles = split_list(&v);
        }
        if let Some(v) = lookup("SHIFTWATCH_LABEL") {
            self.label = v.trim().to_string();
        }
        if let Some(v) = lookup("SHIFTWATCH_MAX_MESSAGES") {
            self.max_messages = parse_env("SHIFTWATCH_MAX_MESSAGES", &v)?;
        }
        if let Some(v) = lookup("SHIFTWATCH_NOTIFY") {
            self.notification_method = v.parse()?;
        }
        if let Some(v) = lookup("SHIFTWATCH_INBOX") {
            self.inbox_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SHIFTWATCH_REPORTS_DIR") {
            self.reports_dir = Some(v).filter(|s| !s.trim().is_empty()).map(PathBuf::from);
        }
        if let Some(v) = lookup("SHIFTWATCH_SCHEDULER_ENABLED") {
            self.scheduler_enabled = matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes");
        }
        if let Some(v) = lookup("SHIFTWATCH_SCAN_CRON") {
            self.scan_cron = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_duration_hours.is_finite() || self.min_duration_hours < 0.0 {
            return Err(ConfigError::InvalidDuration(self.min_duration_hours));
        }
        if self.max_messages == 0 {
            return Err(ConfigError::ZeroMaxMessages);
        }
        Ok(())
    }

    pub fn criteria(&self) -> CriteriaConfig {
        CriteriaConfig {
            min_duration_hours: self.min_duration_hours,
            allowed_roles: self.allowed_roles.clone(),
            role_match: self.role_match,
        }
    }

    pub fn extractor(&self) -> Extractor {
        Extractor::with_known_roles(self.known_roles.iter().cloned())
    }
}

fn parse_env<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn value_or_na(value: &str) -> &str {
    if value.is_empty() {
        "N/A"
    } else {
        value
    }
}

/// Shortens `s` to `max_chars` characters, marking the cut with `...`.
pub fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Console rendering of a qualifying shift.
pub fn render_match(found: &ShiftMatch) -> String {
    let rule = "=".repeat(BANNER_WIDTH);
    let shift = &found.shift;
    [
        rule.clone(),
        "SHIFT MATCH FOUND!".to_string(),
        rule.clone(),
        format!("Email: {}", found.subject),
        format!("Date: {}", value_or_na(&found.received_date)),
        format!("Shift Role: {}", value_or_na(&shift.role)),
        format!("Shift Date: {}", value_or_na(&shift.date)),
        format!("Duration: {:.1} hours", shift.duration_hours),
        format!("Start Time: {}", value_or_na(&shift.start_time)),
        format!("End Time: {}", value_or_na(&shift.end_time)),
        format!("Match Reason: {}", found.reason),
        rule,
    ]
    .join("\n")
}

pub trait Notifier: Send + Sync {
    fn notify(&self, found: &ShiftMatch) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, found: &ShiftMatch) -> Result<()> {
        println!("\n{}\n", render_match(found));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, found: &ShiftMatch) -> Result<()> {
        info!(
            message_id = %found.message_id,
            subject = %found.subject,
            role = %found.shift.role,
            date = %found.shift.date,
            duration_hours = found.shift.duration_hours,
            reason = %found.reason,
            "shift match found"
        );
        Ok(())
    }
}

pub fn notifier_for(method: NotificationMethod) -> Box<dyn Notifier> {
    match method {
        NotificationMethod::Console => Box::<ConsoleNotifier>::default(),
        NotificationMethod::Log => Box::<LogNotifier>::default(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub label: String,
    pub processed: usize,
    pub unparsed: usize,
    pub matched: usize,
    pub matches: Vec<ShiftMatch>,
    pub reports_dir: Option<String>,
}

pub struct ScanPipeline {
    config: WatchConfig,
    extractor: Extractor,
    matcher: CriteriaMatcher,
    source: Box<dyn MailSource>,
    notifier: Box<dyn Notifier>,
}

impl ScanPipeline {
    pub fn new(config: WatchConfig) -> Self {
        let extractor = config.extractor();
        let matcher = CriteriaMatcher::new(config.criteria());
        let source = Box::new(InboxSnapshotSource::new(config.inbox_path.clone()));
        let notifier = notifier_for(config.notification_method);
        Self {
            config,
            extractor,
            matcher,
            source,
            notifier,
        }
    }

    pub fn with_source(mut self, source: Box<dyn MailSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Extracts and matches one message. `Ok(None)` means the shift did not qualify.
    pub fn evaluate(&self, message: &RawMessage) -> Result<Option<ShiftMatch>, ExtractError> {
        let shift = self.extractor.parse_message(message)?;
        let decision = self.matcher.decide(&shift);
        if !decision.matches {
            return Ok(None);
        }
        Ok(Some(ShiftMatch {
            message_id: message.id.clone(),
            subject: message.subject.clone(),
            received_date: message.received_date.clone(),
            reason: decision.reason(),
            shift,
        }))
    }

    pub async fn run_once(&self) -> Result<ScanSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scan", %run_id, source = self.source.source_id());
        self.run_once_inner(run_id).instrument(span).await
    }

    async fn run_once_inner(&self, run_id: Uuid) -> Result<ScanSummary> {
        let started_at = Utc::now();
        let messages = self
            .source
            .fetch_messages(&self.config.label, self.config.max_messages)
            .await
            .with_context(|| format!("fetching messages labeled '{}'", self.config.label))?;
        info!(count = messages.len(), label = %self.config.label, "fetched messages");

        let total = messages.len();
        let mut unparsed = 0usize;
        let mut matches = Vec::new();
        for (i, message) in messages.iter().enumerate() {
            info!(
                "[{}/{}] {}",
                i + 1,
                total,
                truncate(&message.subject, SUBJECT_PREVIEW_CHARS)
            );
            match self.evaluate(message) {
                Ok(Some(found)) => {
                    if let Err(err) = self.notifier.notify(&found) {
                        warn!(message_id = %found.message_id, error = %format!("{err:#}"), "notification failed");
                    }
                    matches.push(found);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "skipping message");
                    unparsed += 1;
                }
            }
        }

        let mut summary = ScanSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: self.source.source_id().to_string(),
            label: self.config.label.clone(),
            processed: total,
            unparsed,
            matched: matches.len(),
            matches,
            reports_dir: None,
        };
        if let Some(root) = &self.config.reports_dir {
            let dir = write_reports(root, &summary).await?;
            summary.reports_dir = Some(dir.display().to_string());
        }
        info!(
            processed = summary.processed,
            unparsed = summary.unparsed,
            matched = summary.matched,
            "scan complete"
        );
        Ok(summary)
    }
}

async fn write_reports(root: &Path, summary: &ScanSummary) -> Result<PathBuf> {
    let dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing scan summary")?;
    fs::write(dir.join("matches.json"), json)
        .await
        .context("writing matches.json")?;

    let mut lines = vec![
        "# Shift Scan".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Label: {}", summary.label),
        format!("- Messages processed: {}", summary.processed),
        format!("- Unparsed: {}", summary.unparsed),
        format!("- Matching shifts: {}", summary.matched),
        String::new(),
        "## Matches".to_string(),
    ];
    lines.extend(summary.matches.iter().map(|m| {
        format!(
            "- {} | {} | {} | {}",
            m.subject,
            value_or_na(&m.shift.role),
            value_or_na(&m.shift.date),
            m.reason
        )
    }));
    fs::write(dir.join("scan_summary.md"), lines.join("\n") + "\n")
        .await
        .context("writing scan_summary.md")?;

    Ok(dir)
}

/// Builds a scheduler that reruns the scan on `scan_cron`, or `None` when disabled.
pub async fn build_scheduler(pipeline: Arc<ScanPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }
    let cron = pipeline.config.scan_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    matched = summary.matched,
                    "scheduled scan finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled scan failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_scan_once(config: WatchConfig) -> Result<ScanSummary> {
    ScanPipeline::new(config).run_once().await
}

/// Scans on the configured cron until Ctrl-C.
pub async fn run_watch(mut config: WatchConfig) -> Result<()> {
    config.scheduler_enabled = true;
    let cron = config.scan_cron.clone();
    let pipeline = Arc::new(ScanPipeline::new(config));
    let Some(mut sched) = build_scheduler(Arc::clone(&pipeline)).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "watching for shifts; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    fn shift(role: &str, duration_hours: f64) -> ShiftRecord {
        ShiftRecord {
            role: role.to_string(),
            duration_hours,
            ..Default::default()
        }
    }

    fn criteria(min: f64, roles: &[&str], role_match: RoleMatchPolicy) -> CriteriaConfig {
        CriteriaConfig {
            min_duration_hours: min,
            allowed_roles: roles.iter().map(ToString::to_string).collect(),
            role_match,
        }
    }

    fn bar_and_server() -> CriteriaConfig {
        criteria(8.0, &["Bartender", "Server"], RoleMatchPolicy::default())
    }

    #[test]
    fn duration_alone_qualifies() {
        let decision = decide(&shift("Cook", 10.0), &bar_and_server());
        assert!(decision.matches);
        assert_eq!(decision.reasons, vec!["Duration: 10.0h (target: >=8.0h)".to_string()]);
    }

    #[test]
    fn duration_reason_reports_exact_values() {
        let decision = decide(&shift("Cook", 8.25), &criteria(7.96, &[], RoleMatchPolicy::default()));
        assert_eq!(decision.reason(), "Duration: 8.25h (target: >=7.96h)");
        assert_eq!(format_hours(10.0), "10.0");
        assert_eq!(format_hours(6.5), "6.5");
    }

    #[test]
    fn neither_criterion_does_not_qualify() {
        let decision = decide(&shift("Cook", 4.0), &bar_and_server());
        assert!(!decision.matches);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn role_alone_qualifies() {
        let decision = decide(&shift("Bartender", 4.0), &bar_and_server());
        assert!(decision.matches);
        assert_eq!(decision.reason(), "Role: Bartender (matches: Bartender)");
    }

    #[test]
    fn both_reasons_in_evaluation_order() {
        let decision = decide(&shift("Server", 8.0), &bar_and_server());
        assert_eq!(
            decision.reason(),
            "Duration: 8.0h (target: >=8.0h); Role: Server (matches: Server)"
        );
    }

    #[test]
    fn unknown_duration_never_qualifies_even_at_zero_threshold() {
        let decision = decide(&shift("", 0.0), &criteria(0.0, &[], RoleMatchPolicy::default()));
        assert!(!decision.matches);
        let decision = decide(&shift("", 0.5), &criteria(0.0, &[], RoleMatchPolicy::default()));
        assert!(decision.matches);
    }

    #[test]
    fn only_first_allowed_role_is_reported() {
        let decision = decide(
            &shift("Head Bartender", 2.0),
            &criteria(8.0, &["bartender", "Head", "Bartender"], RoleMatchPolicy::Contains),
        );
        assert_eq!(decision.reasons, vec!["Role: Head Bartender (matches: bartender)".to_string()]);
    }

    #[test]
    fn role_policies_differ_on_partial_roles() {
        assert!(role_matches(RoleMatchPolicy::Contains, "Head Bartender", "bartender"));
        assert!(!role_matches(RoleMatchPolicy::Contains, "Bartender", "Head Bartender"));

        assert!(role_matches(RoleMatchPolicy::Bidirectional, "Head Bartender", "Bartender"));
        assert!(role_matches(RoleMatchPolicy::Bidirectional, "Bartender", "Head Bartender"));
        assert!(!role_matches(RoleMatchPolicy::Bidirectional, "Cook", "Bartender"));

        assert!(role_matches(RoleMatchPolicy::Exact, "server", "SERVER"));
        assert!(!role_matches(RoleMatchPolicy::Exact, "Head Server", "Server"));
    }

    #[test]
    fn blank_roles_never_match() {
        for policy in [RoleMatchPolicy::Contains, RoleMatchPolicy::Bidirectional, RoleMatchPolicy::Exact] {
            assert!(!role_matches(policy, "Server", "  "));
            assert!(!role_matches(policy, " ", "Server"));
        }
    }

    #[test]
    fn role_or_duration_thresholds() {
        let config = criteria(4.0, &["LG: ALL", "LG: North", "Deck Coordinator"], RoleMatchPolicy::Exact);
        let cases = [
            ("LG: ALL", 2.0, true),
            ("Other Role", 5.0, true),
            ("LG: North", 6.0, true),
            ("Other Role", 2.0, false),
            ("Other Role", 4.0, true),
        ];
        for (role, hours, want) in cases {
            assert_eq!(decide(&shift(role, hours), &config).matches, want, "{role} {hours}");
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_without_file_or_env() {
        let config = WatchConfig::load_with(None, env(&[])).unwrap();
        assert_eq!(config, WatchConfig::default());
        assert_eq!(config.criteria(), CriteriaConfig::default());
        assert_eq!(config.extractor(), Extractor::default());
        assert_eq!(config.label, "Deputy");
        assert_eq!(config.max_messages, 50);
    }

    #[test]
    fn config_reads_json_file_with_gmail_style_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"target_shift_duration_hours": 6, "target_shift_roles": ["Bartender", "Server"],
                "gmail_label": "Deputy Shifts", "notification_method": "log"}"#,
        )
        .unwrap();

        let config = WatchConfig::load_with(Some(&path), env(&[])).unwrap();
        assert_eq!(config.min_duration_hours, 6.0);
        assert_eq!(config.allowed_roles, vec!["Bartender", "Server"]);
        assert_eq!(config.label, "Deputy Shifts");
        assert_eq!(config.notification_method, NotificationMethod::Log);
        assert_eq!(config.max_messages, 50);
    }

    #[test]
    fn env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shiftwatch.yaml");
        std::fs::write(
            &path,
            "target_shift_duration_hours: 6\nrole_match: contains\nknown_roles: []\nreports_dir: ./reports\n",
        )
        .unwrap();

        let config = WatchConfig::load_with(
            None,
            env(&[
                ("SHIFTWATCH_CONFIG", path.to_str().unwrap()),
                ("SHIFTWATCH_MIN_DURATION_HOURS", "7.5"),
                ("SHIFTWATCH_ALLOWED_ROLES", "Bartender, ,Server "),
                ("SHIFTWATCH_ROLE_MATCH", "exact"),
                ("SHIFTWATCH_REPORTS_DIR", ""),
                ("SHIFTWATCH_SCHEDULER_ENABLED", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(config.min_duration_hours, 7.5);
        assert_eq!(config.allowed_roles, vec!["Bartender", "Server"]);
        assert_eq!(config.role_match, RoleMatchPolicy::Exact);
        assert!(config.known_roles.is_empty());
        assert_eq!(config.reports_dir, None);
        assert!(config.scheduler_enabled);
    }

    #[test]
    fn invalid_config_values_are_rejected() {
        let err = WatchConfig::load_with(None, env(&[("SHIFTWATCH_MIN_DURATION_HOURS", "eight")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "SHIFTWATCH_MIN_DURATION_HOURS", .. }));

        let err = WatchConfig::load_with(None, env(&[("SHIFTWATCH_MIN_DURATION_HOURS", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration(_)));

        let err = WatchConfig::load_with(None, env(&[("SHIFTWATCH_ROLE_MATCH", "fuzzy")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "SHIFTWATCH_ROLE_MATCH", .. }));

        let err = WatchConfig::load_with(None, env(&[("SHIFTWATCH_NOTIFY", "sms")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "SHIFTWATCH_NOTIFY", .. }));

        let err = WatchConfig::load_with(None, env(&[("SHIFTWATCH_MAX_MESSAGES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroMaxMessages));

        let err = WatchConfig::load_with(Some(Path::new("/nonexistent/shiftwatch.yaml")), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn formatting_helpers() {
        assert_eq!(truncate("Hello", 10), "Hello");
        assert_eq!(truncate("HelloWorld", 10), "HelloWorld");
        assert_eq!(truncate("This is a very long string", 10), "This is a ...");
        assert_eq!(truncate("Überstunden", 4), "Über...");
        assert_eq!(value_or_na(""), "N/A");
        assert_eq!(value_or_na("Server"), "Server");
    }

    #[test]
    fn rendered_match_fills_missing_fields_with_na() {
        let found = ShiftMatch {
            message_id: "m1".into(),
            subject: "Open shift".into(),
            received_date: "Wed, 14 Jan 2026".into(),
            shift: shift("", 10.0),
            reason: "Duration: 10.0h (target: >=8.0h)".into(),
        };
        let text = render_match(&found);
        assert!(text.contains("SHIFT MATCH FOUND!"));
        assert!(text.contains("Shift Role: N/A"));
        assert!(text.contains("Start Time: N/A"));
        assert!(text.contains("Duration: 10.0 hours"));
        assert!(text.contains("Match Reason: Duration: 10.0h (target: >=8.0h)"));
    }

    struct StaticSource(Vec<RawMessage>);

    #[async_trait]
    impl MailSource for StaticSource {
        fn source_id(&self) -> &str {
            "static"
        }

        async fn fetch_messages(&self, _label: &str, max_messages: usize) -> Result<Vec<RawMessage>> {
            Ok(self.0.iter().take(max_messages).cloned().collect())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingNotifier(Arc<Mutex<Vec<ShiftMatch>>>);

    impl Notifier for RecordingNotifier {
        fn notify(&self, found: &ShiftMatch) -> Result<()> {
            self.0.lock().unwrap().push(found.clone());
            Ok(())
        }
    }

    fn message(id: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            id: id.into(),
            subject: subject.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pipeline_notifies_matches_and_counts_unparsed() {
        let config = WatchConfig {
            allowed_roles: vec!["Bartender".into()],
            ..Default::default()
        };
        let notifier = RecordingNotifier::default();
        let pipeline = ScanPipeline::new(config)
            .with_source(Box::new(StaticSource(vec![
                message("1", "Deputy Shift Available", "Shift: Bartender\nDate: January 5, 2026"),
                message("2", "Some notification", "No role information here"),
                message("3", "New Shift", "Position: Cook\nTime: 9:00 AM - 1:00 PM"),
                message("4", "Overnight", "Position: Cook\nTime: 10:00 PM - 6:00 AM"),
            ])))
            .with_notifier(Box::new(notifier.clone()));

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.source_id, "static");
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.unparsed, 1);
        assert_eq!(summary.matched, 2);
        assert!(summary.reports_dir.is_none());

        let seen = notifier.0.lock().unwrap();
        let ids = seen.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "4"]);
        assert_eq!(seen[1].reason, "Duration: 8.0h (target: >=8.0h)");
    }

    #[tokio::test]
    async fn pipeline_scans_fixture_inbox_and_writes_reports() {
        let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let reports = tempfile::tempdir().unwrap();
        let config = WatchConfig {
            allowed_roles: vec!["Bartender".into()],
            inbox_path: workspace.join("fixtures/inbox/sample.json"),
            reports_dir: Some(reports.path().to_path_buf()),
            notification_method: NotificationMethod::Log,
            ..Default::default()
        };

        let summary = run_scan_once(config).await.unwrap();
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.unparsed, 1);
        assert_eq!(summary.matched, 3);
        let matched_ids = summary
            .matches
            .iter()
            .map(|m| m.message_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(matched_ids, vec!["deputy-001", "deputy-002", "deputy-004"]);

        let run_dir = reports.path().join(summary.run_id.to_string());
        assert_eq!(summary.reports_dir.as_deref(), Some(run_dir.display().to_string().as_str()));
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("matches.json")).unwrap()).unwrap();
        assert_eq!(written["matched"], 3);
        let brief = std::fs::read_to_string(run_dir.join("scan_summary.md")).unwrap();
        assert!(brief.contains("- Matching shifts: 3"));
        assert!(brief.contains("Overnight shift open - LG: North | LG: North"));
    }

    #[tokio::test]
    async fn missing_inbox_is_an_error() {
        let config = WatchConfig {
            inbox_path: PathBuf::from("/nonexistent/inbox.json"),
            ..Default::default()
        };
        let err = run_scan_once(config).await.unwrap_err();
        assert!(format!("{err:#}").contains("fetching messages labeled 'Deputy'"));
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let pipeline = Arc::new(ScanPipeline::new(WatchConfig::default()));
        assert!(build_scheduler(pipeline).await.unwrap().is_none());
    }
}
