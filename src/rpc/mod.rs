//! RPC surface contract and the unary request pipeline.
//!
//! The hub is reached exclusively through the single service
//! `modeloman.v1.ModeloManHub`. This module pins down the method partition
//! (public read / private read / write) and per-method scope requirements;
//! the pipeline itself lives in [`interceptors`].

pub mod auth;
pub mod http;
pub mod idempotency;
pub mod interceptors;
pub mod ratelimit;

use std::collections::HashMap;

pub const SERVICE_NAME: &str = "modeloman.v1.ModeloManHub";

pub const METHOD_GET_HEALTH: &str = "/modeloman.v1.ModeloManHub/GetHealth";
pub const METHOD_GET_SUMMARY: &str = "/modeloman.v1.ModeloManHub/GetSummary";
pub const METHOD_EXPORT_STATE: &str = "/modeloman.v1.ModeloManHub/ExportState";
pub const METHOD_CREATE_TASK: &str = "/modeloman.v1.ModeloManHub/CreateTask";
pub const METHOD_UPDATE_TASK: &str = "/modeloman.v1.ModeloManHub/UpdateTask";
pub const METHOD_DELETE_TASK: &str = "/modeloman.v1.ModeloManHub/DeleteTask";
pub const METHOD_LIST_TASKS: &str = "/modeloman.v1.ModeloManHub/ListTasks";
pub const METHOD_CREATE_NOTE: &str = "/modeloman.v1.ModeloManHub/CreateNote";
pub const METHOD_LIST_NOTES: &str = "/modeloman.v1.ModeloManHub/ListNotes";
pub const METHOD_APPEND_CHANGELOG: &str = "/modeloman.v1.ModeloManHub/AppendChangelog";
pub const METHOD_LIST_CHANGELOG: &str = "/modeloman.v1.ModeloManHub/ListChangelog";
pub const METHOD_RECORD_BENCHMARK: &str = "/modeloman.v1.ModeloManHub/RecordBenchmark";
pub const METHOD_LIST_BENCHMARKS: &str = "/modeloman.v1.ModeloManHub/ListBenchmarks";
pub const METHOD_START_RUN: &str = "/modeloman.v1.ModeloManHub/StartRun";
pub const METHOD_FINISH_RUN: &str = "/modeloman.v1.ModeloManHub/FinishRun";
pub const METHOD_LIST_RUNS: &str = "/modeloman.v1.ModeloManHub/ListRuns";
pub const METHOD_RECORD_PROMPT_ATTEMPT: &str = "/modeloman.v1.ModeloManHub/RecordPromptAttempt";
pub const METHOD_LIST_PROMPT_ATTEMPTS: &str = "/modeloman.v1.ModeloManHub/ListPromptAttempts";
pub const METHOD_RECORD_RUN_EVENT: &str = "/modeloman.v1.ModeloManHub/RecordRunEvent";
pub const METHOD_LIST_RUN_EVENTS: &str = "/modeloman.v1.ModeloManHub/ListRunEvents";
pub const METHOD_GET_TELEMETRY_SUMMARY: &str = "/modeloman.v1.ModeloManHub/GetTelemetrySummary";
pub const METHOD_GET_POLICY: &str = "/modeloman.v1.ModeloManHub/GetPolicy";
pub const METHOD_SET_POLICY: &str = "/modeloman.v1.ModeloManHub/SetPolicy";
pub const METHOD_GET_LEADERBOARD: &str = "/modeloman.v1.ModeloManHub/GetLeaderboard";
pub const METHOD_LIST_POLICY_CAPS: &str = "/modeloman.v1.ModeloManHub/ListPolicyCaps";
pub const METHOD_UPSERT_POLICY_CAP: &str = "/modeloman.v1.ModeloManHub/UpsertPolicyCap";
pub const METHOD_DELETE_POLICY_CAP: &str = "/modeloman.v1.ModeloManHub/DeletePolicyCap";

pub const SCOPE_TASKS_WRITE: &str = "tasks:write";
pub const SCOPE_TELEMETRY_WRITE: &str = "telemetry:write";
pub const SCOPE_POLICY_WRITE: &str = "policy:write";
pub const SCOPE_ADMIN_READ: &str = "admin:read";

pub const DEFAULT_AGENT_KEY_SCOPES: [&str; 4] = [
    SCOPE_TASKS_WRITE,
    SCOPE_TELEMETRY_WRITE,
    SCOPE_POLICY_WRITE,
    SCOPE_ADMIN_READ,
];

/// Write methods participate in idempotency and require auth.
pub fn is_write_method(full_method: &str) -> bool {
    matches!(
        full_method,
        METHOD_CREATE_TASK
            | METHOD_UPDATE_TASK
            | METHOD_DELETE_TASK
            | METHOD_CREATE_NOTE
            | METHOD_APPEND_CHANGELOG
            | METHOD_RECORD_BENCHMARK
            | METHOD_START_RUN
            | METHOD_FINISH_RUN
            | METHOD_RECORD_PROMPT_ATTEMPT
            | METHOD_RECORD_RUN_EVENT
            | METHOD_SET_POLICY
            | METHOD_UPSERT_POLICY_CAP
            | METHOD_DELETE_POLICY_CAP
    )
}

pub fn is_public_read_method(full_method: &str) -> bool {
    matches!(
        full_method,
        METHOD_GET_HEALTH | METHOD_GET_LEADERBOARD | METHOD_GET_TELEMETRY_SUMMARY
    )
}

pub fn is_private_read_method(full_method: &str) -> bool {
    matches!(
        full_method,
        METHOD_GET_SUMMARY
            | METHOD_EXPORT_STATE
            | METHOD_LIST_TASKS
            | METHOD_LIST_NOTES
            | METHOD_LIST_CHANGELOG
            | METHOD_LIST_BENCHMARKS
            | METHOD_LIST_RUNS
            | METHOD_LIST_PROMPT_ATTEMPTS
            | METHOD_LIST_RUN_EVENTS
            | METHOD_GET_POLICY
            | METHOD_LIST_POLICY_CAPS
    )
}

pub fn requires_authentication(full_method: &str) -> bool {
    is_write_method(full_method) || is_private_read_method(full_method)
}

/// The single scope each non-public method requires.
pub fn required_scope(full_method: &str) -> Option<&'static str> {
    match full_method {
        METHOD_GET_SUMMARY
        | METHOD_EXPORT_STATE
        | METHOD_LIST_TASKS
        | METHOD_LIST_NOTES
        | METHOD_LIST_CHANGELOG
        | METHOD_LIST_BENCHMARKS
        | METHOD_LIST_RUNS
        | METHOD_LIST_PROMPT_ATTEMPTS
        | METHOD_LIST_RUN_EVENTS
        | METHOD_GET_POLICY
        | METHOD_LIST_POLICY_CAPS => Some(SCOPE_ADMIN_READ),

        METHOD_CREATE_TASK
        | METHOD_UPDATE_TASK
        | METHOD_DELETE_TASK
        | METHOD_CREATE_NOTE
        | METHOD_APPEND_CHANGELOG => Some(SCOPE_TASKS_WRITE),

        METHOD_RECORD_BENCHMARK
        | METHOD_START_RUN
        | METHOD_FINISH_RUN
        | METHOD_RECORD_PROMPT_ATTEMPT
        | METHOD_RECORD_RUN_EVENT => Some(SCOPE_TELEMETRY_WRITE),

        METHOD_SET_POLICY | METHOD_UPSERT_POLICY_CAP | METHOD_DELETE_POLICY_CAP => {
            Some(SCOPE_POLICY_WRITE)
        }

        _ => None,
    }
}

/// Request metadata handed to the chain by the transport: lowercased header
/// map plus the remote host for unauthenticated rate limiting.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    headers: HashMap<String, String>,
    remote_host: String,
}

impl RequestMetadata {
    pub fn new(headers: HashMap<String, String>, remote_host: impl Into<String>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .collect();
        Self {
            headers,
            remote_host: remote_host.into(),
        }
    }

    /// Trimmed header value; None when absent or blank.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn remote_host(&self) -> &str {
        if self.remote_host.is_empty() {
            "unknown"
        } else {
            &self.remote_host
        }
    }
}
