//! Entity model, enumerations, and aggregate shapes for the hub.
//!
//! All identifiers are opaque strings. Timestamps are `DateTime<Utc>` in
//! memory and serialize through [`ts`] as RFC 3339 with a fixed nine-digit
//! fraction, so lexicographic order equals chronological order in storage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// RFC 3339 timestamps with fixed nanosecond precision.
pub mod ts {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn to_string(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_string(dt))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Optional variant of [`ts`], for nullable timestamps like `finished_at`.
pub mod ts_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match dt {
            Some(dt) => serializer.serialize_str(&super::ts::to_string(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) if !raw.is_empty() => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

// ==================== Enumerations ====================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            _ => Err(AppError::invalid_argument(
                "status must be one of: todo, in_progress, done, blocked",
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    Api,
    Subscription,
    Opensource,
}

impl ProviderType {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "api" => Ok(Self::Api),
            "subscription" => Ok(Self::Subscription),
            "opensource" => Ok(Self::Opensource),
            _ => Err(AppError::invalid_argument(
                "provider_type must be one of: api, subscription, opensource",
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Subscription => "subscription",
            Self::Opensource => "opensource",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(AppError::invalid_argument(
                "status must be one of: running, completed, failed, cancelled",
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    #[default]
    Failed,
    Timeout,
    RetryableError,
    ToolError,
}

impl AttemptOutcome {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "retryable_error" => Ok(Self::RetryableError),
            "tool_error" => Ok(Self::ToolError),
            _ => Err(AppError::invalid_argument(
                "outcome must be one of: success, failed, timeout, retryable_error, tool_error",
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::RetryableError => "retryable_error",
            Self::ToolError => "tool_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    #[default]
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(AppError::invalid_argument(
                "level must be one of: info, warn, error",
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangelogCategory {
    Platform,
    Policy,
    Model,
    Infra,
    #[default]
    Ops,
}

impl ChangelogCategory {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "platform" => Ok(Self::Platform),
            "policy" => Ok(Self::Policy),
            "model" => Ok(Self::Model),
            "infra" => Ok(Self::Infra),
            "ops" => Ok(Self::Ops),
            _ => Err(AppError::invalid_argument(
                "category must be one of: platform, policy, model, infra, ops",
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Policy => "policy",
            Self::Model => "model",
            Self::Infra => "infra",
            Self::Ops => "ops",
        }
    }
}

// ==================== Entities ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub details: String,
    pub status: TaskStatus,
    pub tags: Vec<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub id: String,
    pub category: ChangelogCategory,
    pub summary: String,
    pub details: String,
    pub actor: String,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: String,
    pub workflow: String,
    pub provider_type: ProviderType,
    pub provider: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub quality_score: f64,
    pub notes: String,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub task_id: String,
    pub workflow: String,
    pub agent_id: String,
    pub prompt_version: String,
    pub model_policy: String,
    pub status: RunStatus,
    pub max_retries: i64,
    pub total_attempts: i64,
    pub success_attempts: i64,
    pub failed_attempts: i64,
    pub total_tokens_in: i64,
    pub total_tokens_out: i64,
    pub total_cost_usd: f64,
    pub duration_ms: i64,
    pub last_error: String,
    #[serde(with = "ts")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "ts_opt", skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptAttempt {
    pub id: String,
    pub run_id: String,
    pub attempt_number: i64,
    pub workflow: String,
    pub agent_id: String,
    pub provider_type: ProviderType,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    pub prompt_hash: String,
    pub outcome: AttemptOutcome,
    pub error_type: String,
    pub error_message: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub quality_score: f64,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: String,
    pub run_id: String,
    pub event_type: String,
    pub level: EventLevel,
    pub message: String,
    /// Opaque JSON-encoded payload; never interpreted by the hub.
    pub data_payload: String,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
}

/// Global policy singleton. A limit of `0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationPolicy {
    pub kill_switch: bool,
    pub kill_switch_reason: String,
    pub max_cost_per_run_usd: f64,
    pub max_attempts_per_run: i64,
    pub max_tokens_per_run: i64,
    pub max_latency_per_attempt_ms: i64,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Default for OrchestrationPolicy {
    fn default() -> Self {
        Self {
            kill_switch: false,
            kill_switch_reason: String::new(),
            max_cost_per_run_usd: 0.0,
            max_attempts_per_run: 0,
            max_tokens_per_run: 0,
            max_latency_per_attempt_ms: 0,
            updated_at: DateTime::UNIX_EPOCH,
        }
    }
}

/// Policy override for matching (provider_type, provider, model) triples.
///
/// Empty selector strings are wildcards. A limit of `0` inherits from the
/// global policy; the per-attempt limits exist only at the cap level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCap {
    pub id: String,
    pub name: String,
    pub provider_type: String,
    pub provider: String,
    pub model: String,
    pub max_cost_per_run_usd: f64,
    pub max_attempts_per_run: i64,
    pub max_tokens_per_run: i64,
    pub max_cost_per_attempt_usd: f64,
    pub max_tokens_per_attempt: i64,
    pub max_latency_per_attempt_ms: i64,
    pub priority: i64,
    pub dry_run: bool,
    pub is_active: bool,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

// ==================== Filters ====================

/// Empty string fields match everything; `limit` of 0 means no limit.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub run_id: String,
    pub task_id: String,
    pub workflow: String,
    pub agent_id: String,
    pub status: String,
    pub prompt_version: String,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    pub run_id: String,
    pub workflow: String,
    pub agent_id: String,
    pub model: String,
    pub outcome: String,
    pub prompt_version: String,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: String,
    pub event_type: String,
    pub level: String,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
}

// ==================== Aggregates ====================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub tasks: Vec<Task>,
    pub notes: Vec<Note>,
    pub changelog: Vec<ChangelogEntry>,
    pub benchmarks: Vec<Benchmark>,
    pub runs: Vec<AgentRun>,
    pub attempts: Vec<PromptAttempt>,
    pub run_events: Vec<RunEvent>,
    pub policy: OrchestrationPolicy,
    pub policy_caps: Vec<PolicyCap>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub counts: SummaryCounts,
    pub totals: SummaryTotals,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub tasks: i64,
    pub notes: i64,
    pub changelog: i64,
    pub benchmarks: i64,
    pub runs: i64,
    pub attempts: i64,
    pub run_events: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryTotals {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub by_provider: BTreeMap<String, ProviderTotals>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderTotals {
    pub count: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub counts: TelemetryCounts,
    pub totals: TelemetryTotals,
    pub averages: TelemetryAverages,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryCounts {
    pub runs: i64,
    pub running_runs: i64,
    pub completed_runs: i64,
    pub failed_runs: i64,
    pub cancelled_runs: i64,
    pub attempts: i64,
    pub success_attempts: i64,
    pub failed_attempts: i64,
    pub retries: i64,
    pub events: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryTotals {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryAverages {
    pub attempt_latency_ms: f64,
    pub cost_per_attempt: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub workflow: String,
    pub prompt_version: String,
    pub model: String,
    pub attempts: i64,
    pub success_attempts: i64,
    pub failed_attempts: i64,
    pub success_rate: f64,
    pub average_cost_usd: f64,
    pub average_latency_ms: f64,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_serializes_fixed_nanosecond_width() {
        let dt = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(ts::to_string(&dt), "2026-03-01T10:00:00.500000000Z");
    }

    #[test]
    fn test_enum_parse_round_trip() {
        for raw in ["todo", "in_progress", "done", "blocked"] {
            assert_eq!(TaskStatus::parse(raw).unwrap().as_str(), raw);
        }
        for raw in ["api", "subscription", "opensource"] {
            assert_eq!(ProviderType::parse(raw).unwrap().as_str(), raw);
        }
        for raw in ["success", "failed", "timeout", "retryable_error", "tool_error"] {
            assert_eq!(AttemptOutcome::parse(raw).unwrap().as_str(), raw);
        }
        assert!(TaskStatus::parse("paused").is_err());
        assert!(EventLevel::parse("debug").is_err());
    }

    #[test]
    fn test_run_serializes_finished_at_only_when_set() {
        let run = AgentRun {
            id: "run_1".to_string(),
            task_id: String::new(),
            workflow: "mvp".to_string(),
            agent_id: "a1".to_string(),
            prompt_version: String::new(),
            model_policy: String::new(),
            status: RunStatus::Running,
            max_retries: 0,
            total_attempts: 0,
            success_attempts: 0,
            failed_attempts: 0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            total_cost_usd: 0.0,
            duration_ms: 0,
            last_error: String::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        let value = serde_json::to_value(&run).unwrap();
        assert!(value.get("finished_at").is_none());
        assert_eq!(value["status"], "running");
    }
}
